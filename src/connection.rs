//! Per-session state machine and action dispatch.
//!
//! ```text
//! Upgraded ──► HandshakeSent ──► AwaitingKeyValidation ──► Active ──► Closing
//!                 Connection         ValidateKey           actions     SignOut /
//!                 frame out          (retries allowed)                 DeleteUser /
//!                                                                     transport
//! ```
//!
//! One worker owns one connection. Inbound frames arrive in order and are
//! handled to completion one at a time, so connection state needs no locking.
//! Everything the worker emits goes through the connection's bounded outbound
//! queue; responses therefore leave in request-arrival order, interleaved
//! with fan-out at append points.

use std::sync::Arc;
use std::time::Instant;

use base64ct::{Base64, Encoding};
use serde_json::{json, Value};

use crate::config::ServerConfig;
use crate::crypto::KeyAgreement;
use crate::error::{RequestError, RequestResult};
use crate::protocol::{
    Action, BundleParams, ClientRequest, Command, ItemParams, PushFrame, ResponseFrame,
    MAX_FRAME_SIZE, MSG_TOO_LARGE,
};
use crate::registry::{CloseReason, ConnectionHandle, SessionRegistry};
use crate::subscribe::SubscriptionDispatcher;
use crate::txlog::LogEngine;
use crate::users::{AuthContext, UserDirectory};

/// Everything a connection worker calls into.
pub struct CoreServices {
    pub users: Arc<UserDirectory>,
    pub engine: Arc<LogEngine>,
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<SubscriptionDispatcher>,
    pub key_agreement: Arc<KeyAgreement>,
}

/// Token bucket, refilled lazily from elapsed time.
///
/// A denied acquire has no side effects anywhere: the action is never
/// dispatched, so a 429 provably mutated nothing.
pub struct RateBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl RateBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// What the reader loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    Close(CloseReason),
}

pub struct ConnectionWorker {
    services: Arc<CoreServices>,
    handle: Arc<ConnectionHandle>,
    ctx: AuthContext,
    key_validated: bool,
    /// Plaintext challenge retained for the byte-wise comparison.
    expected_validation: [u8; crate::crypto::VALIDATION_MESSAGE_LEN],
    bucket: RateBucket,
}

impl ConnectionWorker {
    /// Build the worker and the `Connection` handshake frame that moves the
    /// session into `AwaitingKeyValidation`.
    pub fn new(
        services: Arc<CoreServices>,
        config: &ServerConfig,
        ctx: AuthContext,
        handle: Arc<ConnectionHandle>,
    ) -> RequestResult<(Self, PushFrame)> {
        let challenge = KeyAgreement::validation_message();
        let sealed = services
            .key_agreement
            .seal(ctx.user.public_key.as_bytes(), &challenge)?;
        let hello = PushFrame::Connection {
            key_salts: ctx.user.key_salts.clone(),
            encrypted_validation_message: Base64::encode_string(&sealed),
        };
        let worker = Self {
            bucket: RateBucket::new(config.rate_capacity, config.rate_refill_per_sec),
            services,
            handle,
            ctx,
            key_validated: false,
            expected_validation: challenge,
        };
        Ok((worker, hello))
    }

    pub fn conn_id(&self) -> crate::registry::ConnId {
        self.handle.conn_id
    }

    /// Handle one inbound text frame.
    pub async fn handle_frame(&mut self, raw: &str) -> FrameOutcome {
        if raw.len() > MAX_FRAME_SIZE {
            self.send_plain(MSG_TOO_LARGE);
            return FrameOutcome::Continue;
        }

        let request = match ClientRequest::decode(raw) {
            Ok(request) => request,
            Err(_) => {
                self.send_plain("Malformed request");
                return FrameOutcome::Continue;
            }
        };
        let Some(action_name) = request.action else {
            self.send_plain("Malformed request: missing action");
            return FrameOutcome::Continue;
        };

        let action = match Action::parse(&action_name, request.params.unwrap_or(Value::Null)) {
            Ok(action) => action,
            Err(crate::protocol::ActionParseError::UnknownAction(name)) => {
                self.send_plain(&format!("Unknown action {name}"));
                return FrameOutcome::Continue;
            }
            Err(e) => {
                match &request.request_id {
                    Some(request_id) => self.respond(request_id, &action_name, Err(e.into())),
                    None => self.send_plain("Malformed request: missing requestId"),
                }
                return FrameOutcome::Continue;
            }
        };

        // Liveness acknowledgment; never answered, never rate limited.
        if action == Action::Pong {
            return FrameOutcome::Continue;
        }

        let Some(request_id) = request.request_id else {
            self.send_plain("Malformed request: missing requestId");
            return FrameOutcome::Continue;
        };

        if !self.bucket.try_acquire() {
            self.respond(&request_id, &action_name, Err(RequestError::TooManyRequests));
            return FrameOutcome::Continue;
        }

        if !self.key_validated {
            return match action {
                Action::ValidateKey(params) => {
                    let result = self.validate_key(&params.validation_message);
                    self.respond(&request_id, &action_name, result.map(|()| Value::Null));
                    FrameOutcome::Continue
                }
                _ => {
                    self.respond(
                        &request_id,
                        &action_name,
                        Err(RequestError::BadRequest("Key not validated".into())),
                    );
                    FrameOutcome::Continue
                }
            };
        }

        self.dispatch_active(&request_id, &action_name, action).await
    }

    fn validate_key(&mut self, presented: &str) -> RequestResult<()> {
        let bytes = Base64::decode_vec(presented)
            .map_err(|_| RequestError::BadRequest("Invalid validation message encoding".into()))?;
        if bytes == self.expected_validation {
            self.key_validated = true;
            log::debug!("connection {} validated its key", self.handle.conn_id);
            Ok(())
        } else {
            Err(RequestError::Unauthorized("Failed to validate key".into()))
        }
    }

    /// Dispatch table for the `Active` state.
    async fn dispatch_active(
        &mut self,
        request_id: &str,
        route: &str,
        action: Action,
    ) -> FrameOutcome {
        match action {
            Action::ValidateKey(_) => {
                self.respond(
                    request_id,
                    route,
                    Err(RequestError::BadRequest("Key already validated".into())),
                );
                FrameOutcome::Continue
            }
            Action::SignOut => {
                let result = self
                    .services
                    .users
                    .invalidate_session(self.ctx.session_id)
                    .map(|()| Value::Null);
                let failed = result.is_err();
                self.respond(request_id, route, result);
                if failed {
                    FrameOutcome::Continue
                } else {
                    FrameOutcome::Close(CloseReason::SignOut)
                }
            }
            Action::UpdateUser(params) => {
                let result = self.update_user(&params);
                self.respond(request_id, route, result);
                FrameOutcome::Continue
            }
            Action::DeleteUser => {
                let result = self.delete_user();
                let failed = result.is_err();
                self.respond(request_id, route, result);
                if failed {
                    FrameOutcome::Continue
                } else {
                    FrameOutcome::Close(CloseReason::UserDeleted)
                }
            }
            Action::OpenDatabase(params) => {
                let result = self
                    .services
                    .engine
                    .open_database(
                        &self.services.dispatcher,
                        self.handle.conn_id,
                        self.ctx.user.user_id,
                        &params,
                    )
                    .await
                    .map(|outcome| json!({ "databaseId": outcome.database_id }));
                self.respond(request_id, route, result);
                FrameOutcome::Continue
            }
            Action::Insert(params) => {
                let result = self.append_single(Command::Insert, params).await;
                self.respond(request_id, route, result);
                FrameOutcome::Continue
            }
            Action::Update(params) => {
                let result = self.append_single(Command::Update, params).await;
                self.respond(request_id, route, result);
                FrameOutcome::Continue
            }
            Action::Delete(params) => {
                let result = self.append_single(Command::Delete, params).await;
                self.respond(request_id, route, result);
                FrameOutcome::Continue
            }
            Action::BatchTransaction(params) => {
                let result = async {
                    self.services
                        .engine
                        .resolve_owned(self.ctx.user.user_id, params.database_id)?;
                    let records = self
                        .services
                        .engine
                        .append_batch(
                            &self.services.dispatcher,
                            params.database_id,
                            self.ctx.user.user_id,
                            &params.operations,
                        )
                        .await?;
                    let seq_nos: Vec<u64> = records.iter().map(|r| r.seq_no).collect();
                    Ok(json!({ "seqNos": seq_nos }))
                }
                .await;
                self.respond(request_id, route, result);
                FrameOutcome::Continue
            }
            Action::Bundle(params) => {
                let result = self.publish_bundle(params).await;
                self.respond(request_id, route, result);
                FrameOutcome::Continue
            }
            Action::GetPasswordSalts => {
                let result = serde_json::to_value(&self.ctx.user.key_salts)
                    .map_err(RequestError::from);
                self.respond(request_id, route, result);
                FrameOutcome::Continue
            }
            // Handled before dispatch.
            Action::Pong => FrameOutcome::Continue,
        }
    }

    async fn append_single(&self, command: Command, params: ItemParams) -> RequestResult<Value> {
        self.services
            .engine
            .resolve_owned(self.ctx.user.user_id, params.database_id)?;
        match command {
            Command::Insert | Command::Update if params.encrypted_item.is_none() => {
                return Err(RequestError::BadRequest("Missing encrypted item".into()));
            }
            _ => {}
        }
        let record = self
            .services
            .engine
            .append(
                &self.services.dispatcher,
                params.database_id,
                self.ctx.user.user_id,
                command,
                &params.item_key,
                params.encrypted_item,
            )
            .await?;
        Ok(json!({ "seqNo": record.seq_no }))
    }

    async fn publish_bundle(&self, params: BundleParams) -> RequestResult<Value> {
        self.services
            .engine
            .resolve_owned(self.ctx.user.user_id, params.database_id)?;
        self.services
            .engine
            .publish_bundle(
                &self.services.dispatcher,
                params.database_id,
                params.seq_no,
                params.bundle,
            )
            .await?;
        Ok(Value::Null)
    }

    fn update_user(&self, params: &crate::protocol::UpdateUserParams) -> RequestResult<Value> {
        let (_, password_rotated) = self
            .services
            .users
            .update_user(self.ctx.user.user_id, params)?;
        if password_rotated {
            self.services
                .users
                .invalidate_other_sessions(self.ctx.user.user_id, Some(self.ctx.session_id))?;
            self.close_other_connections(CloseReason::Revoked);
        }
        Ok(Value::Null)
    }

    fn delete_user(&self) -> RequestResult<Value> {
        self.services.users.delete_user(self.ctx.user.user_id)?;
        self.services
            .engine
            .teardown_user(&self.services.dispatcher, self.ctx.user.user_id)?;
        self.close_other_connections(CloseReason::UserDeleted);
        Ok(Value::Null)
    }

    /// Revoke every other live connection of this user.
    fn close_other_connections(&self, reason: CloseReason) {
        let revoked = PushFrame::SessionRevoked.encode().ok();
        for conn in self.services.registry.for_user(self.ctx.user.user_id) {
            if conn.conn_id == self.handle.conn_id {
                continue;
            }
            if let Some(frame) = &revoked {
                let _ = conn.try_send(frame.clone());
            }
            if let Some(handle) = self.services.registry.close(conn.conn_id, reason) {
                self.services
                    .dispatcher
                    .release(handle.conn_id, &handle.subscriptions());
            }
        }
    }

    fn respond(&self, request_id: &str, route: &str, result: RequestResult<Value>) {
        let frame = match result {
            Ok(data) => ResponseFrame::ok(request_id, route, data),
            Err(e) => ResponseFrame::error(request_id, route, &e),
        };
        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                log::error!(
                    "failed to encode response on connection {}: {e}",
                    self.handle.conn_id
                );
                return;
            }
        };
        if self.handle.try_send(encoded).is_err() {
            log::debug!(
                "dropped response on connection {}: queue unavailable",
                self.handle.conn_id
            );
        }
    }

    fn send_plain(&self, text: &str) {
        let _ = self.handle.try_send(text.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeySalts;
    use crate::protocol::ServerFrame;
    use crate::store::MemoryStore;
    use crate::users::SignUpParams;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn services() -> Arc<CoreServices> {
        let store: Arc<dyn crate::store::Store> = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new(64));
        Arc::new(CoreServices {
            users: Arc::new(UserDirectory::new(store.clone())),
            engine: Arc::new(LogEngine::new(store)),
            dispatcher: Arc::new(SubscriptionDispatcher::new(registry.clone())),
            registry,
            key_agreement: Arc::new(KeyAgreement::generate()),
        })
    }

    async fn worker(
        services: &Arc<CoreServices>,
    ) -> (ConnectionWorker, mpsc::Receiver<String>, AuthContext) {
        let app_id = Uuid::new_v4();
        let (user, session) = services
            .users
            .sign_up(SignUpParams {
                app_id,
                username: "alice".into(),
                public_key: "cGstYWxpY2U=".into(),
                key_salts: KeySalts::generate(),
                password_token: "token".into(),
                password_based_backup: None,
                email: None,
                profile: None,
            })
            .unwrap();
        let ctx = services
            .users
            .verify_session(app_id, session.session_id, None)
            .unwrap();
        let (handle, rx) = services
            .registry
            .register(user.user_id, "client-1".into(), None);
        let (worker, hello) = ConnectionWorker::new(
            services.clone(),
            &ServerConfig::for_testing(),
            ctx.clone(),
            handle.clone(),
        )
        .unwrap();
        handle.try_send(hello.encode().unwrap()).unwrap();
        (worker, rx, ctx)
    }

    /// Pull the sealed challenge out of the handshake frame and decrypt it
    /// the way the client SDK would.
    fn solve_challenge(services: &CoreServices, ctx: &AuthContext, hello: &str) -> String {
        let frame = ServerFrame::decode(hello).unwrap();
        let ServerFrame::Push(PushFrame::Connection {
            encrypted_validation_message,
            ..
        }) = frame
        else {
            panic!("expected Connection frame, got {hello}");
        };
        let sealed = Base64::decode_vec(&encrypted_validation_message).unwrap();
        let plaintext = services
            .key_agreement
            .open(ctx.user.public_key.as_bytes(), &sealed)
            .unwrap();
        Base64::encode_string(&plaintext)
    }

    async fn validated_worker(
        services: &Arc<CoreServices>,
    ) -> (ConnectionWorker, mpsc::Receiver<String>, AuthContext) {
        let (mut worker, mut rx, ctx) = worker(services).await;
        let hello = rx.recv().await.unwrap();
        let answer = solve_challenge(services, &ctx, &hello);
        let frame = ClientRequest::new(
            "validate",
            "ValidateKey",
            serde_json::json!({ "validationMessage": answer }),
        )
        .encode()
        .unwrap();
        assert_eq!(worker.handle_frame(&frame).await, FrameOutcome::Continue);
        let response = rx.recv().await.unwrap();
        assert!(response.contains("\"status\":200"), "got {response}");
        (worker, rx, ctx)
    }

    #[test]
    fn test_rate_bucket_drains_and_refills() {
        let mut bucket = RateBucket::new(3, 1000.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        // Nothing measurable has elapsed with a slow refill.
        let mut slow = RateBucket::new(1, 0.001);
        assert!(slow.try_acquire());
        assert!(!slow.try_acquire());
        // Fast refill recovers within a tick.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(bucket.try_acquire());
    }

    #[test]
    fn test_rate_bucket_caps_at_capacity() {
        // Zero refill: idle time never grows the bucket past capacity.
        let mut bucket = RateBucket::new(2, 0.0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test]
    async fn test_handshake_then_validate() {
        let services = services();
        let (_worker, mut rx, _ctx) = validated_worker(&services).await;
        // Queue is empty after the validation response.
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_wrong_validation_message_retries() {
        let services = services();
        let (mut worker, mut rx, ctx) = worker(&services).await;
        let hello = rx.recv().await.unwrap();

        let bad = ClientRequest::new(
            "v1",
            "ValidateKey",
            serde_json::json!({ "validationMessage": Base64::encode_string(&[0u8; 32]) }),
        )
        .encode()
        .unwrap();
        worker.handle_frame(&bad).await;
        let response = rx.recv().await.unwrap();
        assert!(response.contains("\"status\":401"));

        // Still in AwaitingKeyValidation: the right answer now succeeds.
        let answer = solve_challenge(&services, &ctx, &hello);
        let good = ClientRequest::new(
            "v2",
            "ValidateKey",
            serde_json::json!({ "validationMessage": answer }),
        )
        .encode()
        .unwrap();
        worker.handle_frame(&good).await;
        let response = rx.recv().await.unwrap();
        assert!(response.contains("\"status\":200"));
    }

    #[tokio::test]
    async fn test_validate_twice_is_bad_request() {
        let services = services();
        let (mut worker, mut rx, _ctx) = validated_worker(&services).await;
        let again = ClientRequest::new(
            "v2",
            "ValidateKey",
            serde_json::json!({ "validationMessage": Base64::encode_string(&[0u8; 32]) }),
        )
        .encode()
        .unwrap();
        worker.handle_frame(&again).await;
        let response = rx.recv().await.unwrap();
        assert!(response.contains("\"status\":400"));
    }

    #[tokio::test]
    async fn test_writes_before_validation_rejected() {
        let services = services();
        let (mut worker, mut rx, _ctx) = worker(&services).await;
        let _hello = rx.recv().await.unwrap();

        let frame = ClientRequest::new(
            "r1",
            "Insert",
            serde_json::json!({
                "databaseId": Uuid::new_v4(),
                "itemKey": "k",
                "encryptedItem": "Y3Q="
            }),
        )
        .encode()
        .unwrap();
        worker.handle_frame(&frame).await;
        let response = rx.recv().await.unwrap();
        assert!(response.contains("\"status\":400"));
        assert!(response.contains("Key not validated"));
    }

    #[tokio::test]
    async fn test_unknown_action_plain_text() {
        let services = services();
        let (mut worker, mut rx, _ctx) = validated_worker(&services).await;
        worker
            .handle_frame(r#"{"requestId":"r1","action":"Teleport","params":{}}"#)
            .await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply, "Unknown action Teleport");
    }

    #[tokio::test]
    async fn test_oversized_frame_plain_text_and_continue() {
        let services = services();
        let (mut worker, mut rx, _ctx) = validated_worker(&services).await;
        let huge = "x".repeat(MAX_FRAME_SIZE + 1);
        assert_eq!(worker.handle_frame(&huge).await, FrameOutcome::Continue);
        assert_eq!(rx.recv().await.unwrap(), MSG_TOO_LARGE);

        // The connection still works.
        worker
            .handle_frame(&ClientRequest::new("r", "GetPasswordSalts", Value::Null).encode().unwrap())
            .await;
        assert!(rx.recv().await.unwrap().contains("\"status\":200"));
    }

    #[tokio::test]
    async fn test_malformed_json_plain_text() {
        let services = services();
        let (mut worker, mut rx, _ctx) = validated_worker(&services).await;
        worker.handle_frame("{not json").await;
        assert_eq!(rx.recv().await.unwrap(), "Malformed request");
    }

    #[tokio::test]
    async fn test_open_insert_roundtrip() {
        let services = services();
        let (mut worker, mut rx, _ctx) = validated_worker(&services).await;

        let db_id = Uuid::new_v4();
        let open = ClientRequest::new(
            "open",
            "OpenDatabase",
            serde_json::json!({
                "databaseId": db_id,
                "nameHash": "aGFzaA==",
                "newDatabaseParams": "bWV0YQ=="
            }),
        )
        .encode()
        .unwrap();
        worker.handle_frame(&open).await;
        let response = rx.recv().await.unwrap();
        assert!(response.contains("\"status\":200"), "got {response}");

        let insert = ClientRequest::new(
            "ins",
            "Insert",
            serde_json::json!({
                "databaseId": db_id,
                "itemKey": "todo-1",
                "encryptedItem": "Y2lwaGVydGV4dA=="
            }),
        )
        .encode()
        .unwrap();
        worker.handle_frame(&insert).await;

        // Subscribed to its own database: fan-out frame first, then response.
        let fanout = rx.recv().await.unwrap();
        assert!(fanout.contains("TransactionLog"), "got {fanout}");
        assert!(fanout.contains("\"seqNo\":1"));
        let response = rx.recv().await.unwrap();
        assert!(response.contains("\"requestId\":\"ins\""));
        assert!(response.contains("\"seqNo\":1"));
    }

    #[tokio::test]
    async fn test_insert_into_foreign_database_404() {
        let services = services();
        let (mut worker, mut rx, _ctx) = validated_worker(&services).await;
        let frame = ClientRequest::new(
            "r",
            "Insert",
            serde_json::json!({
                "databaseId": Uuid::new_v4(),
                "itemKey": "k",
                "encryptedItem": "Y3Q="
            }),
        )
        .encode()
        .unwrap();
        worker.handle_frame(&frame).await;
        assert!(rx.recv().await.unwrap().contains("\"status\":404"));
    }

    #[tokio::test]
    async fn test_rate_limit_429_no_side_effects() {
        let services = services();
        let (mut worker, mut rx, ctx) = validated_worker(&services).await;
        // Burn the whole bucket.
        worker.bucket = RateBucket::new(0, 0.0);

        let frame = ClientRequest::new(
            "r",
            "OpenDatabase",
            serde_json::json!({
                "databaseId": Uuid::new_v4(),
                "nameHash": "aGFzaA==",
                "newDatabaseParams": "bWV0YQ=="
            }),
        )
        .encode()
        .unwrap();
        worker.handle_frame(&frame).await;
        let response = rx.recv().await.unwrap();
        assert!(response.contains("\"status\":429"));
        assert!(response.contains("\"retryDelay\":1000"));
        // Nothing was created.
        let err = services
            .engine
            .resolve_owned(ctx.user.user_id, Uuid::new_v4())
            .unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn test_sign_out_closes() {
        let services = services();
        let (mut worker, mut rx, ctx) = validated_worker(&services).await;
        let frame = ClientRequest::new("so", "SignOut", Value::Null).encode().unwrap();
        assert_eq!(
            worker.handle_frame(&frame).await,
            FrameOutcome::Close(CloseReason::SignOut)
        );
        assert!(rx.recv().await.unwrap().contains("\"status\":200"));
        // The session is gone.
        assert!(services
            .users
            .verify_session(ctx.user.app_id, ctx.session_id, None)
            .is_err());
    }

    #[tokio::test]
    async fn test_password_rotation_revokes_other_connections() {
        let services = services();
        let (mut worker, mut rx, ctx) = validated_worker(&services).await;

        // A second device for the same user.
        let (other_handle, mut other_rx) = services
            .registry
            .register(ctx.user.user_id, "client-2".into(), None);

        let frame = ClientRequest::new(
            "up",
            "UpdateUser",
            serde_json::json!({ "passwordToken": "token-2" }),
        )
        .encode()
        .unwrap();
        worker.handle_frame(&frame).await;
        assert!(rx.recv().await.unwrap().contains("\"status\":200"));

        assert!(other_handle.is_closed());
        assert!(other_rx.recv().await.unwrap().contains("SessionRevoked"));
    }

    #[tokio::test]
    async fn test_delete_user_tears_down() {
        let services = services();
        let (mut worker, mut rx, ctx) = validated_worker(&services).await;

        let db_id = Uuid::new_v4();
        let open = ClientRequest::new(
            "open",
            "OpenDatabase",
            serde_json::json!({
                "databaseId": db_id,
                "nameHash": "aGFzaA==",
                "newDatabaseParams": "bWV0YQ=="
            }),
        )
        .encode()
        .unwrap();
        worker.handle_frame(&open).await;
        let _ = rx.recv().await.unwrap();

        let frame = ClientRequest::new("del", "DeleteUser", Value::Null).encode().unwrap();
        assert_eq!(
            worker.handle_frame(&frame).await,
            FrameOutcome::Close(CloseReason::UserDeleted)
        );
        assert!(rx.recv().await.unwrap().contains("\"status\":200"));
        assert!(services.users.get(ctx.user.user_id).unwrap().deleted_at.is_some());
        assert!(services
            .engine
            .resolve_owned(ctx.user.user_id, db_id)
            .is_err());
    }
}

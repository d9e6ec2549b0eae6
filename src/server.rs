//! WebSocket server: authenticated upgrades, per-connection tasks, heartbeat.
//!
//! ```text
//! TcpListener ──► authenticate upgrade (session token in query)
//!                      │
//!                      ▼
//!            ┌── reader task ────────► ConnectionWorker (state machine)
//!   per conn │                              │ responses / fan-out
//!            └── writer task ◄── bounded outbound queue
//!
//!   heartbeat task: every tick, terminate silent connections, ping the rest
//! ```
//!
//! The REST credential façade (sign-up, sign-in, password-salt lookup) is an
//! external collaborator; it shares this server's [`UserDirectory`] and hands
//! clients the session token they present on upgrade.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::HeaderValue;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::connection::{ConnectionWorker, CoreServices, FrameOutcome};
use crate::crypto::KeyAgreement;
use crate::error::RequestError;
use crate::protocol::PushFrame;
use crate::registry::{CloseReason, ConnectionHandle, RegistryStats, SessionRegistry};
use crate::store::{MemoryStore, Store};
use crate::subscribe::SubscriptionDispatcher;
use crate::txlog::LogEngine;
use crate::users::{AuthContext, UserDirectory};

/// Added to every HTTP response, the upgrade included. Two years.
const HSTS_VALUE: &str = "max-age=63072000; includeSubDomains; preload";

/// Server-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub registry: RegistryStats,
    pub records_dispatched: u64,
}

/// The sync server. Owns the shared state; `run()` drives the accept loop.
pub struct SyncServer {
    config: ServerConfig,
    services: Arc<CoreServices>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, store: Arc<dyn Store>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.outbound_queue));
        let services = Arc::new(CoreServices {
            users: Arc::new(UserDirectory::new(store.clone())),
            engine: Arc::new(LogEngine::new(store)),
            dispatcher: Arc::new(SubscriptionDispatcher::new(registry.clone())),
            registry,
            key_agreement: Arc::new(KeyAgreement::generate()),
        });
        Self { config, services }
    }

    /// In-memory store, default config.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// The user store shared with the REST credential façade.
    pub fn users(&self) -> &Arc<UserDirectory> {
        &self.services.users
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.services.registry
    }

    pub fn engine(&self) -> &Arc<LogEngine> {
        &self.services.engine
    }

    /// Client-side handshake helper; tests and SDK shims use it to answer
    /// the validation challenge.
    pub fn key_agreement(&self) -> &Arc<KeyAgreement> {
        &self.services.key_agreement
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            registry: self.services.registry.stats(),
            records_dispatched: self.services.dispatcher.records_dispatched(),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        log::info!("listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve on an already-bound listener (tests bind port 0 themselves).
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let heartbeat = self.spawn_heartbeat();
        let result = loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let services = self.services.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(services, config, stream, addr).await
                        {
                            log::debug!("connection from {addr} ended: {e}");
                        }
                    });
                }
                Err(e) => break Err(e),
            }
        };
        heartbeat.abort();
        result
    }

    /// Process-wide liveness sweep: a connection silent for two ticks is
    /// terminated; everyone else gets a `Ping` and one tick to answer.
    fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.services.registry.clone();
        let dispatcher = self.services.dispatcher.clone();
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                let ping = match PushFrame::Ping.encode() {
                    Ok(ping) => ping,
                    Err(e) => {
                        log::error!("failed to encode heartbeat ping: {e}");
                        continue;
                    }
                };
                for conn in registry.all() {
                    if conn.is_alive.swap(false, Ordering::AcqRel) {
                        let _ = conn.try_send(ping.clone());
                    } else {
                        log::info!(
                            "terminating silent connection {} (user {})",
                            conn.conn_id,
                            conn.user_id
                        );
                        if let Some(handle) = registry.close(conn.conn_id, CloseReason::Liveness)
                        {
                            dispatcher.release(handle.conn_id, &handle.subscriptions());
                        }
                    }
                }
            }
        })
    }
}

/// One accepted TCP stream: upgrade, register, pump frames until close.
async fn handle_connection(
    services: Arc<CoreServices>,
    config: ServerConfig,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let mut auth: Option<(AuthContext, String)> = None;
    let users = services.users.clone();
    let callback = |request: &Request, mut response: Response| {
        match authenticate_upgrade(&users, request) {
            Ok(authenticated) => {
                auth = Some(authenticated);
                response
                    .headers_mut()
                    .insert("Strict-Transport-Security", HeaderValue::from_static(HSTS_VALUE));
                Ok(response)
            }
            Err(e) => Err(reject_upgrade(&e)),
        }
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let Some((ctx, client_id)) = auth else {
        return Ok(());
    };
    log::info!(
        "connection from {addr} for user {} (client {client_id})",
        ctx.user.user_id
    );

    let (handle, outbound_rx) =
        services
            .registry
            .register(ctx.user.user_id, client_id, ctx.admin_id);
    let (mut worker, hello) =
        match ConnectionWorker::new(services.clone(), &config, ctx, handle.clone()) {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("handshake setup failed on connection {}: {e}", handle.conn_id);
                finish(&services, &handle, CloseReason::Transport);
                return Ok(());
            }
        };
    match hello.encode() {
        Ok(frame) => {
            let _ = handle.try_send(frame);
        }
        Err(e) => {
            log::error!("failed to encode handshake on connection {}: {e}", handle.conn_id);
            finish(&services, &handle, CloseReason::Transport);
            return Ok(());
        }
    }

    let (ws_sink, mut ws_stream) = ws.split();
    let writer = tokio::spawn(write_outbound(ws_sink, outbound_rx, handle.clone()));

    loop {
        tokio::select! {
            message = ws_stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    handle.is_alive.store(true, Ordering::Release);
                    match worker.handle_frame(text.as_str()).await {
                        FrameOutcome::Continue => {}
                        FrameOutcome::Close(reason) => {
                            finish(&services, &handle, reason);
                            break;
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    handle.is_alive.store(true, Ordering::Release);
                    let _ = handle.try_send("Expected a text frame".to_string());
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Transport-level liveness counts too.
                    handle.is_alive.store(true, Ordering::Release);
                }
                Some(Ok(Message::Close(_))) | None => {
                    finish(&services, &handle, CloseReason::Transport);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("transport error on connection {}: {e}", handle.conn_id);
                    finish(&services, &handle, CloseReason::Transport);
                    break;
                }
            },
            // Closed from elsewhere: supersession, heartbeat, revocation.
            _ = handle.wait_shutdown() => break,
        }
    }

    let _ = writer.await;
    Ok(())
}

/// Idempotent close plus subscription release.
fn finish(services: &Arc<CoreServices>, handle: &Arc<ConnectionHandle>, reason: CloseReason) {
    if let Some(handle) = services.registry.close(handle.conn_id, reason) {
        services
            .dispatcher
            .release(handle.conn_id, &handle.subscriptions());
    }
}

/// Writer task: drain the outbound queue into the socket. On shutdown the
/// queue is flushed so responses queued just before a close still go out.
async fn write_outbound(
    mut sink: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<TcpStream>,
        Message,
    >,
    mut outbound_rx: mpsc::Receiver<String>,
    handle: Arc<ConnectionHandle>,
) {
    loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(text) => {
                    if sink.send(Message::text(text)).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
            _ = handle.wait_shutdown() => {
                while let Ok(text) = outbound_rx.try_recv() {
                    if sink.send(Message::text(text)).await.is_err() {
                        return;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        }
    }
}

/// Resolve the upgrade request's session credential before completing the
/// WebSocket handshake.
fn authenticate_upgrade(
    users: &UserDirectory,
    request: &Request,
) -> Result<(AuthContext, String), RequestError> {
    let path = request.uri().path();
    if path != "/v1/api" && path != "/v1/api/" {
        return Err(RequestError::NotFound("endpoint"));
    }
    let params = parse_query(request.uri().query().unwrap_or(""));

    let session_id = params
        .get("sessionToken")
        .ok_or_else(|| RequestError::Unauthorized("Missing session token".into()))
        .and_then(|raw| {
            Uuid::parse_str(raw)
                .map_err(|_| RequestError::Unauthorized("Invalid session token".into()))
        })?;
    let app_id = params
        .get("appId")
        .ok_or_else(|| RequestError::Unauthorized("Missing app id".into()))
        .and_then(|raw| {
            Uuid::parse_str(raw).map_err(|_| RequestError::Unauthorized("Invalid app id".into()))
        })?;
    let client_id = params
        .get("clientId")
        .cloned()
        .ok_or_else(|| RequestError::BadRequest("Missing client id".into()))?;
    let admin_id = match params.get("adminId") {
        Some(raw) => Some(
            Uuid::parse_str(raw)
                .map_err(|_| RequestError::Unauthorized("Invalid admin id".into()))?,
        ),
        None => None,
    };

    let ctx = users.verify_session(app_id, session_id, admin_id)?;
    Ok((ctx, client_id))
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn reject_upgrade(error: &RequestError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(error.to_string()));
    *response.status_mut() =
        StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    response
        .headers_mut()
        .insert("Strict-Transport-Security", HeaderValue::from_static(HSTS_VALUE));
    response
}

//! JSON wire protocol spoken over the WebSocket transport.
//!
//! Every frame is a single UTF-8 JSON document, at most [`MAX_FRAME_SIZE`]
//! bytes:
//!
//! ```text
//! client → server   {"requestId": "…", "action": "Insert", "params": { … }}
//! server → client   {"requestId": "…", "route": "Insert",
//!                    "response": {"status": 200, "data": { … }}}
//! server → client   {"route": "TransactionLog", …}        (unsolicited)
//! ```
//!
//! Unsolicited routes: `Connection`, `Ping`, `TransactionLog`,
//! `BundlePublished`, `SessionRevoked`. Status codes follow HTTP
//! conventions. Item bodies, bundles, public keys, and name hashes are
//! opaque client-encoded strings end to end; the server never looks inside.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::crypto::KeySalts;
use crate::error::RequestError;

/// Maximum size of a single frame, inbound or outbound, including framing.
pub const MAX_FRAME_SIZE: usize = 400 * 1024;

/// Maximum operations in one `BatchTransaction`.
pub const MAX_BATCH_OPS: usize = 10;

/// Plain-text reply to an oversized inbound frame.
pub const MSG_TOO_LARGE: &str = "Message is too large";

// ───────────────────────────────────────────────────────────────────
// Transaction records
// ───────────────────────────────────────────────────────────────────

/// Log command kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Insert,
    Update,
    Delete,
}

/// One record of a database's append-only log.
///
/// Persisted as-is and delivered verbatim in `TransactionLog` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub seq_no: u64,
    pub command: Command,
    pub item_key: String,
    /// Client ciphertext; absent for `Delete`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_item: Option<String>,
    pub created_by: Uuid,
    /// Unix millis.
    pub created_at: u64,
}

// ───────────────────────────────────────────────────────────────────
// Client → server
// ───────────────────────────────────────────────────────────────────

/// Raw inbound frame, before action-specific parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl ClientRequest {
    /// Build a request frame (client side; used by tests standing in for
    /// the SDK).
    pub fn new(request_id: impl Into<String>, action: impl Into<String>, params: Value) -> Self {
        Self {
            request_id: Some(request_id.into()),
            action: Some(action.into()),
            params: Some(params),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Why an action failed to parse into its params record.
#[derive(Debug, Clone)]
pub enum ActionParseError {
    /// Not in the dispatch table. Yields a plain-text error, no structured
    /// response.
    UnknownAction(String),
    /// In the table, but the params record did not deserialize.
    InvalidParams { action: &'static str, message: String },
}

impl From<ActionParseError> for RequestError {
    fn from(e: ActionParseError) -> Self {
        match e {
            ActionParseError::UnknownAction(name) => {
                RequestError::BadRequest(format!("Unknown action {name}"))
            }
            ActionParseError::InvalidParams { action, message } => {
                RequestError::BadRequest(format!("Invalid params for {action}: {message}"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateKeyParams {
    /// Decrypted challenge, base64.
    pub validation_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserParams {
    pub username: Option<String>,
    pub email: Option<String>,
    pub profile: Option<Value>,
    /// Rotating the password token invalidates every other session.
    pub password_token: Option<String>,
    pub password_based_backup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDatabaseParams {
    /// Client-generated stable id; required only on the creating open,
    /// later opens resolve through the name hash.
    pub database_id: Option<Uuid>,
    /// Client-side digest of the database name.
    pub name_hash: String,
    /// Encrypted metadata; present only on the creating open.
    pub new_database_params: Option<String>,
    /// Resume point for reconnects; honored when ≥ the current bundle seq.
    pub reopen_at_seq_no: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemParams {
    pub database_id: Uuid,
    pub item_key: String,
    pub encrypted_item: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperation {
    pub command: Command,
    pub item_key: String,
    pub encrypted_item: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTransactionParams {
    pub database_id: Uuid,
    pub operations: Vec<BatchOperation>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleParams {
    pub database_id: Uuid,
    pub seq_no: u64,
    /// Client-produced snapshot ciphertext.
    pub bundle: String,
}

/// The fixed action set, params already parsed into records.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ValidateKey(ValidateKeyParams),
    SignOut,
    UpdateUser(UpdateUserParams),
    DeleteUser,
    OpenDatabase(OpenDatabaseParams),
    Insert(ItemParams),
    Update(ItemParams),
    Delete(ItemParams),
    BatchTransaction(BatchTransactionParams),
    Bundle(BundleParams),
    GetPasswordSalts,
    Pong,
}

impl Action {
    /// Dispatch table: action name → params record.
    pub fn parse(name: &str, params: Value) -> Result<Self, ActionParseError> {
        fn record<T: serde::de::DeserializeOwned>(
            action: &'static str,
            params: Value,
        ) -> Result<T, ActionParseError> {
            serde_json::from_value(params).map_err(|e| ActionParseError::InvalidParams {
                action,
                message: e.to_string(),
            })
        }

        match name {
            "ValidateKey" => Ok(Action::ValidateKey(record("ValidateKey", params)?)),
            "SignOut" => Ok(Action::SignOut),
            "UpdateUser" => Ok(Action::UpdateUser(record("UpdateUser", params)?)),
            "DeleteUser" => Ok(Action::DeleteUser),
            "OpenDatabase" => Ok(Action::OpenDatabase(record("OpenDatabase", params)?)),
            "Insert" => Ok(Action::Insert(record("Insert", params)?)),
            "Update" => Ok(Action::Update(record("Update", params)?)),
            "Delete" => Ok(Action::Delete(record("Delete", params)?)),
            "BatchTransaction" => Ok(Action::BatchTransaction(record("BatchTransaction", params)?)),
            "Bundle" => Ok(Action::Bundle(record("Bundle", params)?)),
            "GetPasswordSalts" => Ok(Action::GetPasswordSalts),
            "Pong" => Ok(Action::Pong),
            other => Err(ActionParseError::UnknownAction(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::ValidateKey(_) => "ValidateKey",
            Action::SignOut => "SignOut",
            Action::UpdateUser(_) => "UpdateUser",
            Action::DeleteUser => "DeleteUser",
            Action::OpenDatabase(_) => "OpenDatabase",
            Action::Insert(_) => "Insert",
            Action::Update(_) => "Update",
            Action::Delete(_) => "Delete",
            Action::BatchTransaction(_) => "BatchTransaction",
            Action::Bundle(_) => "Bundle",
            Action::GetPasswordSalts => "GetPasswordSalts",
            Action::Pong => "Pong",
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Server → client
// ───────────────────────────────────────────────────────────────────

/// `{status, data}` body of a response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusBody {
    pub status: u16,
    pub data: Value,
}

/// Reply to one request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    pub request_id: String,
    /// Echoes the action name.
    pub route: String,
    pub response: StatusBody,
}

impl ResponseFrame {
    pub fn ok(request_id: &str, route: &str, data: Value) -> Self {
        Self {
            request_id: request_id.to_string(),
            route: route.to_string(),
            response: StatusBody {
                status: crate::error::status::OK,
                data,
            },
        }
    }

    pub fn error(request_id: &str, route: &str, err: &RequestError) -> Self {
        Self {
            request_id: request_id.to_string(),
            route: route.to_string(),
            response: StatusBody {
                status: err.status(),
                data: err.data(),
            },
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Unsolicited server frames, tagged by `route`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "route")]
pub enum PushFrame {
    /// Handshake: salts plus the sealed validation challenge.
    #[serde(rename_all = "camelCase")]
    Connection {
        key_salts: KeySalts,
        /// base64 of `nonce ‖ ciphertext ‖ tag`.
        encrypted_validation_message: String,
    },
    /// Heartbeat probe; answered by the `Pong` action.
    Ping,
    /// Ordered log deltas for one open database.
    #[serde(rename_all = "camelCase")]
    TransactionLog {
        database_id: Uuid,
        records: Vec<TransactionRecord>,
    },
    /// A bundle now covers the log up to `bundle_seq_no`. The blob itself is
    /// attached only on initial open; live subscribers already hold the data.
    #[serde(rename_all = "camelCase")]
    BundlePublished {
        database_id: Uuid,
        bundle_seq_no: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        bundle: Option<String>,
    },
    /// The session behind this connection is no longer valid.
    SessionRevoked,
}

impl PushFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Any server frame, for client-side decoding.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Response(ResponseFrame),
    Push(PushFrame),
}

impl ServerFrame {
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

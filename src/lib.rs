//! # cipherbase — server core for an end-to-end encrypted backend
//!
//! Clients hold the keys; this server stores opaque ciphertext and brokers
//! real-time synchronization over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   WebSocket (JSON)   ┌──────────────────────────────┐
//! │ client SDK │ ◄──────────────────► │ SyncServer                   │
//! │ (holds     │   key validation,    │   SessionRegistry (per user) │
//! │  the keys) │   actions, fan-out   │   ConnectionWorker (per conn)│
//! └────────────┘                      └──────────┬───────────────────┘
//!                                                │
//!                                     ┌──────────┴───────────┐
//!                                     │ LogEngine            │
//!                                     │   per-db ordered log │
//!                                     │   bundles + GC       │
//!                                     ├──────────────────────┤
//!                                     │ SubscriptionDispatcher│
//!                                     │   ordered fan-out    │
//!                                     ├──────────────────────┤
//!                                     │ Store (wide-column)  │
//!                                     └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire frames and the action dispatch table
//! - [`server`] — accept loop, authenticated upgrade, heartbeat
//! - [`connection`] — per-session state machine and rate limiting
//! - [`registry`] — process-wide user → connection index
//! - [`subscribe`] — per-database fan-out with backpressure
//! - [`txlog`] — append-only encrypted transaction logs and bundles
//! - [`users`] — user, session, and tenant records
//! - [`store`] — wide-column store adapter (in-memory; RocksDB via `rocks`)
//! - [`crypto`] — key-validation handshake primitives
//!
//! The server never observes plaintext user data or user keys, yet enforces
//! ordering, authorization, quota, and liveness across concurrent sessions.

pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;
pub mod subscribe;
pub mod txlog;
pub mod users;

// Re-exports for convenience
pub use config::ServerConfig;
pub use crypto::{KeyAgreement, KeySalts};
pub use error::{RequestError, RequestResult, RETRY_DELAY_MS};
pub use protocol::{
    Action, ClientRequest, Command, PushFrame, ResponseFrame, ServerFrame, TransactionRecord,
    MAX_FRAME_SIZE,
};
pub use registry::{CloseReason, ConnectionHandle, SessionRegistry};
pub use server::{ServerStats, SyncServer};
pub use store::{MemoryStore, Store, StoreError};
pub use subscribe::SubscriptionDispatcher;
pub use txlog::LogEngine;
pub use users::{AuthContext, RememberMe, SignUpParams, UserDirectory, UserRecord};

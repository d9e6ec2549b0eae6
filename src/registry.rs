//! Process-wide index of live connections per user.
//!
//! Connections are addressed by a process-unique id and held behind `Arc`
//! handles in a flat map; detaching one is a map removal, never a destructor
//! cascade through subscriptions. Registration and close serialize through
//! one short lock; broadcast snapshots the target set under the lock and
//! sends outside it.
//!
//! Each handle owns the sending half of the connection's bounded outbound
//! queue. Sends never block: a full queue is a slow consumer and a closed
//! queue is a dead transport, both of which the caller resolves by closing
//! the connection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::protocol::PushFrame;

pub type ConnId = u64;

/// Why the server closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection with the same client id took over.
    Superseded,
    /// Outbound queue overflowed.
    SlowConsumer,
    /// Missed two heartbeat intervals.
    Liveness,
    SignOut,
    /// Session invalidated from elsewhere (password rotation).
    Revoked,
    UserDeleted,
    /// Transport error or client-initiated close.
    Transport,
}

/// Outcome of a non-blocking send into a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Queue full: the consumer is not keeping up.
    Overflow,
    /// Writer gone.
    Closed,
}

/// One live connection as the rest of the process sees it.
pub struct ConnectionHandle {
    pub conn_id: ConnId,
    pub user_id: Uuid,
    pub client_id: String,
    pub admin_id: Option<Uuid>,
    sender: mpsc::Sender<String>,
    /// Heartbeat liveness flag: set by any inbound frame, cleared by each
    /// heartbeat tick.
    pub is_alive: AtomicBool,
    closed: AtomicBool,
    shutdown: Notify,
    /// Databases this connection has open, for release on close.
    subscriptions: Mutex<HashSet<Uuid>>,
}

impl ConnectionHandle {
    /// Enqueue a frame without blocking.
    pub fn try_send(&self, frame: String) -> Result<(), SendError> {
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::Overflow),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve when [`SessionRegistry::close`] has been called for this
    /// connection. The reader and writer tasks select on this.
    pub async fn wait_shutdown(&self) {
        loop {
            let notified = self.shutdown.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub fn track_subscription(&self, db_id: Uuid) {
        self.subscriptions.lock().insert(db_id);
    }

    pub fn untrack_subscription(&self, db_id: Uuid) {
        self.subscriptions.lock().remove(&db_id);
    }

    pub fn subscriptions(&self) -> Vec<Uuid> {
        self.subscriptions.lock().iter().copied().collect()
    }
}

/// Registry counters, read via [`SessionRegistry::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub supersessions: u64,
    pub slow_consumer_drops: u64,
    pub heartbeat_terminations: u64,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    supersessions: AtomicU64,
    slow_consumer_drops: AtomicU64,
    heartbeat_terminations: AtomicU64,
}

pub struct SessionRegistry {
    /// Guards both maps: registration and close are serialized.
    index: Mutex<RegistryIndex>,
    next_conn_id: AtomicU64,
    queue_capacity: usize,
    counters: Counters,
}

#[derive(Default)]
struct RegistryIndex {
    connections: HashMap<ConnId, Arc<ConnectionHandle>>,
    /// Connection ids per user, in registration order.
    by_user: HashMap<Uuid, Vec<ConnId>>,
}

impl SessionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            index: Mutex::new(RegistryIndex::default()),
            next_conn_id: AtomicU64::new(1),
            queue_capacity,
            counters: Counters::default(),
        }
    }

    /// Create a connection for an authenticated user.
    ///
    /// A `client_id` collision with an existing connection of the same user
    /// supersedes the older one: it receives `SessionRevoked` and is closed.
    /// Returns the handle plus the receiving half of its outbound queue.
    pub fn register(
        &self,
        user_id: Uuid,
        client_id: String,
        admin_id: Option<Uuid>,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<String>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let handle = Arc::new(ConnectionHandle {
            conn_id,
            user_id,
            client_id,
            admin_id,
            sender,
            is_alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            subscriptions: Mutex::new(HashSet::new()),
        });

        let superseded = {
            let mut index = self.index.lock();
            let RegistryIndex {
                connections,
                by_user,
            } = &mut *index;
            let conns = by_user.entry(user_id).or_default();
            let superseded = conns.iter().copied().find(|id| {
                connections
                    .get(id)
                    .is_some_and(|c| c.client_id == handle.client_id)
            });
            conns.push(conn_id);
            connections.insert(conn_id, handle.clone());
            superseded
        };

        if let Some(old_id) = superseded {
            self.counters.supersessions.fetch_add(1, Ordering::Relaxed);
            if let Some(old) = self.connection(old_id) {
                if let Ok(frame) = PushFrame::SessionRevoked.encode() {
                    let _ = old.try_send(frame);
                }
            }
            self.close(old_id, CloseReason::Superseded);
        }

        self.counters
            .total_connections
            .fetch_add(1, Ordering::Relaxed);
        (handle, receiver)
    }

    /// Remove a connection and wake its tasks. Idempotent; returns the handle
    /// when this call did the removal, so the caller can release its
    /// subscriptions exactly once.
    pub fn close(&self, conn_id: ConnId, reason: CloseReason) -> Option<Arc<ConnectionHandle>> {
        let handle = {
            let mut index = self.index.lock();
            let handle = index.connections.remove(&conn_id)?;
            if let Some(conns) = index.by_user.get_mut(&handle.user_id) {
                conns.retain(|id| *id != conn_id);
                if conns.is_empty() {
                    index.by_user.remove(&handle.user_id);
                }
            }
            handle
        };

        match reason {
            CloseReason::SlowConsumer => {
                self.counters
                    .slow_consumer_drops
                    .fetch_add(1, Ordering::Relaxed);
            }
            CloseReason::Liveness => {
                self.counters
                    .heartbeat_terminations
                    .fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        log::debug!(
            "closing connection {conn_id} (user {}, {reason:?})",
            handle.user_id
        );

        handle.closed.store(true, Ordering::Release);
        handle.shutdown.notify_waiters();
        Some(handle)
    }

    pub fn connection(&self, conn_id: ConnId) -> Option<Arc<ConnectionHandle>> {
        self.index.lock().connections.get(&conn_id).cloned()
    }

    /// Consistent snapshot of a user's live connections, registration order.
    pub fn for_user(&self, user_id: Uuid) -> Vec<Arc<ConnectionHandle>> {
        let index = self.index.lock();
        index
            .by_user
            .get(&user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| index.connections.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Send to every connection of a user. Snapshot under the lock, send
    /// outside it; failures are left for the close paths to reap.
    pub fn broadcast(&self, user_id: Uuid, frame: &str) {
        for conn in self.for_user(user_id) {
            let _ = conn.try_send(frame.to_string());
        }
    }

    pub fn send_to(&self, conn_id: ConnId, frame: String) -> Result<(), SendError> {
        match self.connection(conn_id) {
            Some(conn) => conn.try_send(frame),
            None => Err(SendError::Closed),
        }
    }

    /// Snapshot of every live connection, for the heartbeat sweep.
    pub fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.index.lock().connections.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.index.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.len(),
            supersessions: self.counters.supersessions.load(Ordering::Relaxed),
            slow_consumer_drops: self.counters.slow_consumer_drops.load(Ordering::Relaxed),
            heartbeat_terminations: self
                .counters
                .heartbeat_terminations
                .load(Ordering::Relaxed),
        }
    }
}

//! Fan-out of log records to subscribed connections.
//!
//! Couples the log engine to the session registry: every record the engine
//! commits is enqueued, in sequence order, to each connection that has the
//! database open. The engine calls in while holding the per-database append
//! mutex, so all subscribers observe one identical total order.
//!
//! Backpressure is per subscriber: a full outbound queue drops only that
//! subscription and closes only that connection (`SlowConsumer`); everyone
//! else is unaffected. This is the one place the system sheds load.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::protocol::{PushFrame, TransactionRecord, MAX_FRAME_SIZE};
use crate::registry::{CloseReason, ConnId, SendError, SessionRegistry};

/// Soft cap for replay frames, leaving headroom for framing around records.
const REPLAY_CHUNK_BYTES: usize = MAX_FRAME_SIZE - 64 * 1024;

struct Subscriber {
    conn_id: ConnId,
    last_delivered: u64,
}

pub struct SubscriptionDispatcher {
    registry: Arc<SessionRegistry>,
    /// Per-database subscriber lists, registration order.
    subscribers: Mutex<HashMap<Uuid, Vec<Subscriber>>>,
    records_dispatched: AtomicU64,
}

impl SubscriptionDispatcher {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            subscribers: Mutex::new(HashMap::new()),
            records_dispatched: AtomicU64::new(0),
        }
    }

    /// Attach a connection to a database, already caught up through
    /// `last_delivered`.
    pub fn subscribe(&self, db_id: Uuid, conn_id: ConnId, last_delivered: u64) {
        let mut subs = self.subscribers.lock();
        let list = subs.entry(db_id).or_default();
        if list.iter().any(|s| s.conn_id == conn_id) {
            return;
        }
        list.push(Subscriber {
            conn_id,
            last_delivered,
        });
        drop(subs);
        if let Some(conn) = self.registry.connection(conn_id) {
            conn.track_subscription(db_id);
        }
    }

    pub fn unsubscribe(&self, db_id: Uuid, conn_id: ConnId) {
        let mut subs = self.subscribers.lock();
        if let Some(list) = subs.get_mut(&db_id) {
            list.retain(|s| s.conn_id != conn_id);
            if list.is_empty() {
                subs.remove(&db_id);
            }
        }
    }

    /// Release every subscription a closing connection held.
    pub fn release(&self, conn_id: ConnId, dbs: &[Uuid]) {
        for db_id in dbs {
            self.unsubscribe(*db_id, conn_id);
        }
    }

    /// Drop a database's subscriber list entirely (user teardown).
    pub fn drop_database(&self, db_id: Uuid) {
        self.subscribers.lock().remove(&db_id);
    }

    /// Fan one committed record out to every subscriber in registration
    /// order. A failed send detaches that subscriber and schedules its
    /// connection for close; the rest proceed.
    pub fn deliver(&self, db_id: Uuid, record: &TransactionRecord) {
        let encoded = PushFrame::TransactionLog {
            database_id: db_id,
            records: vec![record.clone()],
        }
        .encode();
        let frame = match encoded {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("failed to encode record {} for {db_id}: {e}", record.seq_no);
                return;
            }
        };

        let mut dropped: Vec<(ConnId, CloseReason)> = Vec::new();
        {
            let mut subs = self.subscribers.lock();
            let Some(list) = subs.get_mut(&db_id) else {
                return;
            };
            list.retain_mut(|sub| match self.registry.send_to(sub.conn_id, frame.clone()) {
                Ok(()) => {
                    sub.last_delivered = record.seq_no;
                    true
                }
                Err(SendError::Overflow) => {
                    dropped.push((sub.conn_id, CloseReason::SlowConsumer));
                    false
                }
                Err(SendError::Closed) => {
                    dropped.push((sub.conn_id, CloseReason::Transport));
                    false
                }
            });
        }
        self.records_dispatched.fetch_add(1, Ordering::Relaxed);

        for (conn_id, reason) in dropped {
            log::warn!("dropping subscriber {conn_id} of {db_id}: {reason:?}");
            if let Some(handle) = self.registry.close(conn_id, reason) {
                self.release(conn_id, &handle.subscriptions());
            }
        }
    }

    /// Replay history to one connection on open: the bundle (if any)
    /// followed by the records above it, chunked under the frame cap.
    pub fn replay_to(
        &self,
        conn_id: ConnId,
        db_id: Uuid,
        bundle: Option<(u64, String)>,
        records: &[TransactionRecord],
    ) {
        if let Some((bundle_seq_no, bundle)) = bundle {
            let frame = match (PushFrame::BundlePublished {
                database_id: db_id,
                bundle_seq_no,
                bundle: Some(bundle),
            })
            .encode()
            {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("failed to encode bundle for {db_id}: {e}");
                    return;
                }
            };
            if self.registry.send_to(conn_id, frame).is_err() {
                return;
            }
        }

        let mut chunk: Vec<TransactionRecord> = Vec::new();
        let mut chunk_bytes = 0usize;
        for record in records {
            let record_bytes = record
                .encrypted_item
                .as_ref()
                .map_or(0, |item| item.len())
                + record.item_key.len()
                + 128;
            if !chunk.is_empty() && chunk_bytes + record_bytes > REPLAY_CHUNK_BYTES {
                if !self.send_log_chunk(conn_id, db_id, std::mem::take(&mut chunk)) {
                    return;
                }
                chunk_bytes = 0;
            }
            chunk_bytes += record_bytes;
            chunk.push(record.clone());
        }
        if !chunk.is_empty() {
            self.send_log_chunk(conn_id, db_id, chunk);
        }
    }

    fn send_log_chunk(
        &self,
        conn_id: ConnId,
        db_id: Uuid,
        records: Vec<TransactionRecord>,
    ) -> bool {
        let encoded = PushFrame::TransactionLog {
            database_id: db_id,
            records,
        }
        .encode();
        match encoded {
            Ok(frame) => self.registry.send_to(conn_id, frame).is_ok(),
            Err(e) => {
                log::error!("failed to encode replay chunk for {db_id}: {e}");
                false
            }
        }
    }

    /// Tell live subscribers a bundle now covers the log up to `seq_no`, so
    /// they can drop replayed history. The blob is omitted: they already
    /// hold the data.
    pub fn publish_bundle_notice(&self, db_id: Uuid, seq_no: u64) {
        let encoded = PushFrame::BundlePublished {
            database_id: db_id,
            bundle_seq_no: seq_no,
            bundle: None,
        }
        .encode();
        let frame = match encoded {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("failed to encode bundle notice for {db_id}: {e}");
                return;
            }
        };
        let conn_ids: Vec<ConnId> = {
            let subs = self.subscribers.lock();
            subs.get(&db_id)
                .map(|list| list.iter().map(|s| s.conn_id).collect())
                .unwrap_or_default()
        };
        for conn_id in conn_ids {
            let _ = self.registry.send_to(conn_id, frame.clone());
        }
    }

    pub fn subscriber_count(&self, db_id: Uuid) -> usize {
        self.subscribers
            .lock()
            .get(&db_id)
            .map_or(0, |list| list.len())
    }

    pub fn records_dispatched(&self) -> u64 {
        self.records_dispatched.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    fn record(seq_no: u64) -> TransactionRecord {
        TransactionRecord {
            seq_no,
            command: Command::Insert,
            item_key: format!("k{seq_no}"),
            encrypted_item: Some("Y3Q=".into()),
            created_by: Uuid::nil(),
            created_at: 0,
        }
    }

    fn setup() -> (Arc<SessionRegistry>, SubscriptionDispatcher) {
        let registry = Arc::new(SessionRegistry::new(4));
        let dispatcher = SubscriptionDispatcher::new(registry.clone());
        (registry, dispatcher)
    }

    #[tokio::test]
    async fn test_deliver_in_registration_order() {
        let (registry, dispatcher) = setup();
        let db = Uuid::new_v4();
        let (c1, mut rx1) = registry.register(Uuid::new_v4(), "a".into(), None);
        let (c2, mut rx2) = registry.register(Uuid::new_v4(), "b".into(), None);
        dispatcher.subscribe(db, c1.conn_id, 0);
        dispatcher.subscribe(db, c2.conn_id, 0);

        dispatcher.deliver(db, &record(1));
        dispatcher.deliver(db, &record(2));

        for rx in [&mut rx1, &mut rx2] {
            let f1 = rx.recv().await.unwrap();
            let f2 = rx.recv().await.unwrap();
            assert!(f1.contains("\"seqNo\":1"));
            assert!(f2.contains("\"seqNo\":2"));
        }
    }

    #[tokio::test]
    async fn test_deliver_ignores_other_databases() {
        let (registry, dispatcher) = setup();
        let (c1, mut rx1) = registry.register(Uuid::new_v4(), "a".into(), None);
        let db1 = Uuid::new_v4();
        let db2 = Uuid::new_v4();
        dispatcher.subscribe(db1, c1.conn_id, 0);

        dispatcher.deliver(db2, &record(1));
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), rx1.recv())
                .await
                .is_err(),
            "no cross-database leakage"
        );
    }

    #[tokio::test]
    async fn test_slow_consumer_dropped_others_unaffected() {
        let (registry, dispatcher) = setup();
        let db = Uuid::new_v4();
        // Queue capacity is 4; the slow connection never drains.
        let (slow, _slow_rx) = registry.register(Uuid::new_v4(), "slow".into(), None);
        let (fast, mut fast_rx) = registry.register(Uuid::new_v4(), "fast".into(), None);
        dispatcher.subscribe(db, slow.conn_id, 0);
        dispatcher.subscribe(db, fast.conn_id, 0);

        for seq in 1..=6 {
            dispatcher.deliver(db, &record(seq));
            // Keep the fast consumer fast.
            let _ = fast_rx.recv().await.unwrap();
        }

        assert!(slow.is_closed());
        assert_eq!(dispatcher.subscriber_count(db), 1);
        assert_eq!(registry.stats().slow_consumer_drops, 1);
        assert!(!fast.is_closed());
    }

    #[tokio::test]
    async fn test_release_on_close() {
        let (registry, dispatcher) = setup();
        let db1 = Uuid::new_v4();
        let db2 = Uuid::new_v4();
        let (conn, _rx) = registry.register(Uuid::new_v4(), "a".into(), None);
        dispatcher.subscribe(db1, conn.conn_id, 0);
        dispatcher.subscribe(db2, conn.conn_id, 0);

        let handle = registry
            .close(conn.conn_id, CloseReason::Transport)
            .unwrap();
        dispatcher.release(conn.conn_id, &handle.subscriptions());
        assert_eq!(dispatcher.subscriber_count(db1), 0);
        assert_eq!(dispatcher.subscriber_count(db2), 0);
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let (registry, dispatcher) = setup();
        let db = Uuid::new_v4();
        let (conn, mut rx) = registry.register(Uuid::new_v4(), "a".into(), None);
        dispatcher.subscribe(db, conn.conn_id, 0);
        dispatcher.subscribe(db, conn.conn_id, 0);
        assert_eq!(dispatcher.subscriber_count(db), 1);

        dispatcher.deliver(db, &record(1));
        let _ = rx.recv().await.unwrap();
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv())
                .await
                .is_err(),
            "one subscription, one copy"
        );
    }

    #[tokio::test]
    async fn test_replay_chunks_large_histories() {
        // Deep queue so the whole replay fits without a consumer.
        let registry = Arc::new(SessionRegistry::new(64));
        let dispatcher = SubscriptionDispatcher::new(registry.clone());
        let (conn, mut rx) = registry.register(Uuid::new_v4(), "a".into(), None);
        let db = Uuid::new_v4();
        // ~90KB per record: forces multiple chunks under the cap.
        let records: Vec<TransactionRecord> = (1..=8)
            .map(|seq| TransactionRecord {
                seq_no: seq,
                command: Command::Insert,
                item_key: format!("k{seq}"),
                encrypted_item: Some("x".repeat(90 * 1024)),
                created_by: Uuid::nil(),
                created_at: 0,
            })
            .collect();

        dispatcher.replay_to(conn.conn_id, db, Some((0, "YnVuZGxl".into())), &records);

        let mut frames = Vec::new();
        while let Ok(Some(frame)) =
            tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv()).await
        {
            frames.push(frame);
        }
        // Bundle frame first, then several log chunks, each under the cap.
        assert!(frames[0].contains("BundlePublished"));
        assert!(frames.len() > 2);
        for frame in &frames {
            assert!(frame.len() <= MAX_FRAME_SIZE);
        }
        // Every record arrived exactly once, in order.
        let delivered: Vec<u64> = frames
            .iter()
            .flat_map(|f| {
                let value: serde_json::Value = serde_json::from_str(f).unwrap();
                value["records"]
                    .as_array()
                    .map(|records| {
                        records
                            .iter()
                            .map(|r| r["seqNo"].as_u64().unwrap())
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            })
            .collect();
        assert_eq!(delivered, (1..=8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_bundle_notice_to_all_subscribers() {
        let (registry, dispatcher) = setup();
        let db = Uuid::new_v4();
        let (c1, mut rx1) = registry.register(Uuid::new_v4(), "a".into(), None);
        dispatcher.subscribe(db, c1.conn_id, 0);

        dispatcher.publish_bundle_notice(db, 500);
        let frame = rx1.recv().await.unwrap();
        assert!(frame.contains("\"bundleSeqNo\":500"));
        assert!(!frame.contains("\"bundle\":"));
    }
}

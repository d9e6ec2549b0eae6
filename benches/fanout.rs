use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use uuid::Uuid;

use cipherbase::protocol::{Command, PushFrame, TransactionRecord};
use cipherbase::registry::SessionRegistry;
use cipherbase::subscribe::SubscriptionDispatcher;

fn record(seq_no: u64) -> TransactionRecord {
    TransactionRecord {
        seq_no,
        command: Command::Insert,
        item_key: format!("item-{seq_no}"),
        encrypted_item: Some("Y2lwaGVydGV4dA==".repeat(8)),
        created_by: Uuid::nil(),
        created_at: 1_700_000_000_000,
    }
}

fn bench_frame_encode(c: &mut Criterion) {
    let db_id = Uuid::new_v4();
    let rec = record(42);

    c.bench_function("transaction_log_frame_encode", |b| {
        b.iter(|| {
            let frame = PushFrame::TransactionLog {
                database_id: black_box(db_id),
                records: vec![black_box(rec.clone())],
            };
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_fanout_100_subscribers(c: &mut Criterion) {
    let registry = Arc::new(SessionRegistry::new(4096));
    let dispatcher = SubscriptionDispatcher::new(registry.clone());
    let db_id = Uuid::new_v4();

    let mut receivers = Vec::new();
    for i in 0..100 {
        let (conn, rx) = registry.register(Uuid::new_v4(), format!("peer-{i}"), None);
        dispatcher.subscribe(db_id, conn.conn_id, 0);
        receivers.push(rx);
    }

    let rec = record(1);
    c.bench_function("fanout_100_subscribers", |b| {
        b.iter(|| {
            dispatcher.deliver(black_box(db_id), black_box(&rec));
            // Drain so the bounded queues never overflow mid-benchmark.
            for rx in &mut receivers {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(benches, bench_frame_encode, bench_fanout_100_subscribers);
criterion_main!(benches);

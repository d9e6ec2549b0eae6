//! Transaction log engine: per-database append-only encrypted logs.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                 one database (db_id)                  │
//! │                                                       │
//! │  bundle (client snapshot)   log records               │
//! │  ┌──────────────┐           ┌────┬────┬────┬────┐     │
//! │  │ seq ≤ B      │           │B+1 │B+2 │ …  │max │     │
//! │  └──────────────┘           └────┴────┴────┴────┘     │
//! │                                                       │
//! │  item-key index: key → seq of live insert             │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! Appends to one database funnel through a per-database async mutex, so
//! sequence numbers are dense, duplicate-key checks are race-free, and every
//! subscriber observes the identical total order. Distinct databases progress
//! independently.
//!
//! The key index is persisted (not rebuilt from the log) because records at
//! or below the bundle seq are garbage-collected and the bundle itself is
//! ciphertext the server cannot read.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (Log-Structured Storage)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::{RequestError, RequestResult};
use crate::protocol::{
    BatchOperation, Command, OpenDatabaseParams, TransactionRecord, MAX_BATCH_OPS, MAX_FRAME_SIZE,
};
use crate::registry::ConnId;
use crate::store::{seq_sort_key, BatchOp, Store, StoreError};
use crate::subscribe::SubscriptionDispatcher;

/// Attempts at a sequence slot before giving up with 503.
const APPEND_RETRY_LIMIT: usize = 3;

fn txlog_partition(db_id: Uuid) -> String {
    format!("txlog/{db_id}")
}

fn keys_partition(db_id: Uuid) -> String {
    format!("keys/{db_id}")
}

fn meta_partition(db_id: Uuid) -> String {
    format!("dbmeta/{db_id}")
}

fn dbs_partition(user_id: Uuid) -> String {
    format!("dbs/{user_id}")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-user database registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRecord {
    pub database_id: Uuid,
    pub owner_user_id: Uuid,
    pub name_hash: String,
    /// Encrypted metadata from the creating client.
    pub new_database_params: String,
    pub created_at: u64,
}

/// The single retained bundle for a database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleRecord {
    pub bundle_seq_no: u64,
    pub bundle: String,
    pub published_at: u64,
}

/// Cached per-database tail state, guarded by the append mutex.
#[derive(Debug, Default)]
struct DbState {
    loaded: bool,
    max_seq: u64,
    bundle_seq: u64,
}

/// What an open delivers before live deltas begin.
#[derive(Debug, Clone)]
pub struct OpenOutcome {
    pub database_id: Uuid,
    pub created: bool,
}

pub struct LogEngine {
    store: Arc<dyn Store>,
    databases: Mutex<HashMap<Uuid, Arc<AsyncMutex<DbState>>>>,
}

impl LogEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            databases: Mutex::new(HashMap::new()),
        }
    }

    fn db_lock(&self, db_id: Uuid) -> Arc<AsyncMutex<DbState>> {
        self.databases
            .lock()
            .entry(db_id)
            .or_default()
            .clone()
    }

    /// Populate the cached tail state from the store on first touch.
    fn load_state(&self, db_id: Uuid, state: &mut DbState) -> RequestResult<()> {
        if state.loaded {
            return Ok(());
        }
        state.bundle_seq = self.load_bundle(db_id)?.map_or(0, |b| b.bundle_seq_no);
        let tail = self.store.range(
            &txlog_partition(db_id),
            &seq_sort_key(state.bundle_seq + 1),
            None,
        )?;
        state.max_seq = tail
            .last()
            .and_then(|(sort, _)| crate::store::seq_from_sort_key(sort))
            .unwrap_or(state.bundle_seq);
        state.loaded = true;
        Ok(())
    }

    fn load_bundle(&self, db_id: Uuid) -> RequestResult<Option<BundleRecord>> {
        match self.store.get(&meta_partition(db_id), b"bundle")? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Database record for `db_id` if `user_id` owns it.
    pub fn resolve_owned(&self, user_id: Uuid, db_id: Uuid) -> RequestResult<DatabaseRecord> {
        let sort = format!("id/{db_id}");
        let bytes = self
            .store
            .get(&dbs_partition(user_id), sort.as_bytes())?
            .ok_or(RequestError::NotFound("database"))?;
        decode(&bytes)
    }

    fn resolve_by_name(&self, user_id: Uuid, name_hash: &str) -> RequestResult<Option<Uuid>> {
        let sort = format!("name/{name_hash}");
        match self.store.get(&dbs_partition(user_id), sort.as_bytes())? {
            Some(bytes) => Ok(Some(Uuid::from_slice(&bytes).map_err(|e| {
                RequestError::Internal(format!("database name index: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Open (and lazily create) a database for a connection.
    ///
    /// Replay frames are enqueued and the subscription registered while the
    /// append mutex is held, so the subscriber's view is gap-free: everything
    /// at or below the replay point arrives via replay, everything after via
    /// fan-out, nothing twice.
    pub async fn open_database(
        &self,
        dispatcher: &SubscriptionDispatcher,
        conn_id: ConnId,
        user_id: Uuid,
        params: &OpenDatabaseParams,
    ) -> RequestResult<OpenOutcome> {
        let (db_id, created) = match self.resolve_by_name(user_id, &params.name_hash)? {
            Some(db_id) => (db_id, false),
            None => {
                let db_id = self.create_database(user_id, params)?;
                (db_id, true)
            }
        };

        let lock = self.db_lock(db_id);
        let mut state = lock.lock().await;
        self.load_state(db_id, &mut state)?;

        // Either resume after the client's checkpoint or start from the
        // bundle. A checkpoint below the bundle seq is useless: those
        // records are gone.
        let (bundle, replay_from) = match params.reopen_at_seq_no {
            Some(seq) if seq >= state.bundle_seq => (None, seq + 1),
            _ => (self.load_bundle(db_id)?, state.bundle_seq + 1),
        };

        let records = self.read_records(db_id, replay_from)?;
        dispatcher.replay_to(
            conn_id,
            db_id,
            bundle.map(|b| (b.bundle_seq_no, b.bundle)),
            &records,
        );
        dispatcher.subscribe(db_id, conn_id, state.max_seq);

        Ok(OpenOutcome {
            database_id: db_id,
            created,
        })
    }

    fn create_database(
        &self,
        user_id: Uuid,
        params: &OpenDatabaseParams,
    ) -> RequestResult<Uuid> {
        let database_id = params.database_id.ok_or_else(|| {
            RequestError::NotFound("database")
        })?;
        let new_database_params = params.new_database_params.clone().ok_or_else(|| {
            RequestError::BadRequest("Database does not exist and no creation params given".into())
        })?;

        let record = DatabaseRecord {
            database_id,
            owner_user_id: user_id,
            name_hash: params.name_hash.clone(),
            new_database_params,
            created_at: now_millis(),
        };
        let result = self.store.batch(
            &dbs_partition(user_id),
            &[
                BatchOp::Put {
                    sort: format!("name/{}", params.name_hash).into_bytes(),
                    value: database_id.as_bytes().to_vec(),
                    if_absent: true,
                },
                BatchOp::Put {
                    sort: format!("id/{database_id}").into_bytes(),
                    value: encode(&record)?,
                    if_absent: true,
                },
            ],
        );
        match result {
            Ok(()) => Ok(database_id),
            // Lost a concurrent create for the same name: use the winner.
            Err(StoreError::ConditionFailed) | Err(StoreError::TxConflict) => self
                .resolve_by_name(user_id, &params.name_hash)?
                .ok_or(RequestError::ServiceUnavailable),
            Err(e) => Err(e.into()),
        }
    }

    fn read_records(&self, db_id: Uuid, from_seq: u64) -> RequestResult<Vec<TransactionRecord>> {
        let items = self
            .store
            .range(&txlog_partition(db_id), &seq_sort_key(from_seq), None)?;
        items.iter().map(|(_, bytes)| decode(bytes)).collect()
    }

    /// Append one command. Returns the committed record after fan-out.
    pub async fn append(
        &self,
        dispatcher: &SubscriptionDispatcher,
        db_id: Uuid,
        created_by: Uuid,
        command: Command,
        item_key: &str,
        encrypted_item: Option<String>,
    ) -> RequestResult<TransactionRecord> {
        let lock = self.db_lock(db_id);
        let mut state = lock.lock().await;
        self.load_state(db_id, &mut state)?;

        self.check_command(db_id, command, item_key, None)?;

        let mut record = TransactionRecord {
            seq_no: 0,
            command,
            item_key: item_key.to_string(),
            encrypted_item,
            created_by,
            created_at: now_millis(),
        };
        check_record_size(&record)?;

        let seq_no = self.commit_one(db_id, &mut record)?;
        self.apply_key_effect(db_id, command, item_key, seq_no)?;
        state.max_seq = seq_no;

        dispatcher.deliver(db_id, &record);
        Ok(record)
    }

    /// Append up to [`MAX_BATCH_OPS`] commands atomically: all records land
    /// with contiguous sequence numbers or none land at all.
    pub async fn append_batch(
        &self,
        dispatcher: &SubscriptionDispatcher,
        db_id: Uuid,
        created_by: Uuid,
        operations: &[BatchOperation],
    ) -> RequestResult<Vec<TransactionRecord>> {
        if operations.is_empty() {
            return Err(RequestError::BadRequest("Empty batch".into()));
        }
        if operations.len() > MAX_BATCH_OPS {
            return Err(RequestError::BadRequest(format!(
                "Batch exceeds {MAX_BATCH_OPS} operations"
            )));
        }

        let lock = self.db_lock(db_id);
        let mut state = lock.lock().await;
        self.load_state(db_id, &mut state)?;

        // Validate against the index plus the batch's own earlier effects.
        let mut pending: HashMap<&str, bool> = HashMap::new();
        for op in operations {
            self.check_command(db_id, op.command, &op.item_key, pending.get(op.item_key.as_str()))?;
            pending.insert(&op.item_key, !matches!(op.command, Command::Delete));
        }

        let created_at = now_millis();
        let mut records: Vec<TransactionRecord> = operations
            .iter()
            .map(|op| TransactionRecord {
                seq_no: 0,
                command: op.command,
                item_key: op.item_key.clone(),
                encrypted_item: op.encrypted_item.clone(),
                created_by,
                created_at,
            })
            .collect();
        for record in &records {
            check_record_size(record)?;
        }

        self.commit_batch(db_id, &mut records)?;
        for record in &records {
            self.apply_key_effect(db_id, record.command, &record.item_key, record.seq_no)?;
        }
        state.max_seq = records.last().map(|r| r.seq_no).unwrap_or(state.max_seq);

        for record in &records {
            dispatcher.deliver(db_id, record);
        }
        Ok(records)
    }

    /// Duplicate and missing key checks against the persisted index.
    /// `pending` overrides the index for keys already touched in this batch.
    fn check_command(
        &self,
        db_id: Uuid,
        command: Command,
        item_key: &str,
        pending: Option<&bool>,
    ) -> RequestResult<()> {
        let live = match pending {
            Some(live) => *live,
            None => self
                .store
                .get(&keys_partition(db_id), item_key.as_bytes())?
                .is_some(),
        };
        match command {
            Command::Insert if live => {
                Err(RequestError::BadRequest("Item already exists".into()))
            }
            Command::Update | Command::Delete if !live => {
                Err(RequestError::BadRequest("Item does not exist".into()))
            }
            _ => Ok(()),
        }
    }

    fn apply_key_effect(
        &self,
        db_id: Uuid,
        command: Command,
        item_key: &str,
        seq_no: u64,
    ) -> RequestResult<()> {
        let partition = keys_partition(db_id);
        match command {
            Command::Insert | Command::Update => {
                self.store
                    .put(&partition, item_key.as_bytes(), &seq_no.to_be_bytes(), false)?;
            }
            Command::Delete => {
                self.store.delete(&partition, item_key.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Allocate a slot and conditionally insert, retrying on collisions with
    /// concurrent writers outside this process.
    fn commit_one(&self, db_id: Uuid, record: &mut TransactionRecord) -> RequestResult<u64> {
        let partition = txlog_partition(db_id);
        for _ in 0..APPEND_RETRY_LIMIT {
            let seq_no = self.store.next_seq(&partition)?;
            record.seq_no = seq_no;
            match self
                .store
                .put(&partition, &seq_sort_key(seq_no), &encode(record)?, true)
            {
                Ok(()) => return Ok(seq_no),
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        log::warn!("append to {db_id} exhausted {APPEND_RETRY_LIMIT} sequence slots");
        Err(RequestError::ServiceUnavailable)
    }

    fn commit_batch(
        &self,
        db_id: Uuid,
        records: &mut [TransactionRecord],
    ) -> RequestResult<()> {
        let partition = txlog_partition(db_id);
        'attempt: for _ in 0..APPEND_RETRY_LIMIT {
            let first = self.store.next_seq(&partition)?;
            for (offset, record) in records.iter_mut().enumerate() {
                record.seq_no = first + offset as u64;
            }
            // Burn through the allocator so the range is reserved end to end.
            for expected in (first + 1)..(first + records.len() as u64) {
                if self.store.next_seq(&partition)? != expected {
                    continue 'attempt;
                }
            }

            let mut ops = Vec::with_capacity(records.len());
            for record in records.iter() {
                ops.push(BatchOp::Put {
                    sort: seq_sort_key(record.seq_no).to_vec(),
                    value: encode(record)?,
                    if_absent: true,
                });
            }
            match self.store.batch(&partition, &ops) {
                Ok(()) => return Ok(()),
                Err(StoreError::ConditionFailed) | Err(StoreError::TxConflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        log::warn!("batch append to {db_id} exhausted {APPEND_RETRY_LIMIT} attempts");
        Err(RequestError::ServiceUnavailable)
    }

    /// Accept a client bundle at `seq_no` and schedule garbage collection of
    /// the records it covers. Concurrent publishers race; one wins, the rest
    /// get 400 and retry against the new baseline.
    pub async fn publish_bundle(
        &self,
        dispatcher: &SubscriptionDispatcher,
        db_id: Uuid,
        seq_no: u64,
        bundle: String,
    ) -> RequestResult<()> {
        let lock = self.db_lock(db_id);
        let mut state = lock.lock().await;
        self.load_state(db_id, &mut state)?;

        if state.bundle_seq > 0 && seq_no <= state.bundle_seq {
            return Err(RequestError::BadRequest(format!(
                "Bundle at {seq_no} is not newer than {}",
                state.bundle_seq
            )));
        }
        if seq_no > state.max_seq {
            return Err(RequestError::BadRequest(format!(
                "Bundle at {seq_no} is past the log end {}",
                state.max_seq
            )));
        }

        let record = BundleRecord {
            bundle_seq_no: seq_no,
            bundle,
            published_at: now_millis(),
        };
        self.store
            .put(&meta_partition(db_id), b"bundle", &encode(&record)?, false)?;
        state.bundle_seq = seq_no;

        dispatcher.publish_bundle_notice(db_id, seq_no);

        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = gc_covered_records(store.as_ref(), db_id, seq_no) {
                // Next publish covers the leftovers; nothing to surface.
                log::warn!("bundle GC for {db_id} at {seq_no} failed: {e}");
            }
        });
        Ok(())
    }

    /// Current bundle seq, zero when no bundle exists. Test and admin
    /// introspection.
    pub fn bundle_seq(&self, db_id: Uuid) -> RequestResult<u64> {
        Ok(self.load_bundle(db_id)?.map_or(0, |b| b.bundle_seq_no))
    }

    /// Delete every database partition of a user. Runs on `DeleteUser`.
    pub fn teardown_user(
        &self,
        dispatcher: &SubscriptionDispatcher,
        user_id: Uuid,
    ) -> RequestResult<usize> {
        let dbs = self.store.range(&dbs_partition(user_id), b"id/", None)?;
        let mut removed = 0;
        for (sort, bytes) in dbs {
            if !sort.starts_with(b"id/") {
                break;
            }
            let record: DatabaseRecord = decode(&bytes)?;
            let db_id = record.database_id;
            dispatcher.drop_database(db_id);
            self.databases.lock().remove(&db_id);
            self.store.delete_partition(&txlog_partition(db_id))?;
            self.store.delete_partition(&keys_partition(db_id))?;
            self.store.delete_partition(&meta_partition(db_id))?;
            removed += 1;
        }
        self.store.delete_partition(&dbs_partition(user_id))?;
        log::info!("tore down {removed} databases for user {user_id}");
        Ok(removed)
    }
}

fn gc_covered_records(store: &dyn Store, db_id: Uuid, bundle_seq: u64) -> Result<(), StoreError> {
    let partition = txlog_partition(db_id);
    let covered = store.range(&partition, &seq_sort_key(1), Some(&seq_sort_key(bundle_seq)))?;
    let count = covered.len();
    for (sort, _) in covered {
        store.delete(&partition, &sort)?;
    }
    log::debug!("GC removed {count} records ≤ {bundle_seq} for {db_id}");
    Ok(())
}

fn check_record_size(record: &TransactionRecord) -> RequestResult<()> {
    let size = serde_json::to_vec(record).map(|b| b.len()).unwrap_or(usize::MAX);
    if size > MAX_FRAME_SIZE {
        return Err(RequestError::BadRequest("Transaction is too large".into()));
    }
    Ok(())
}

fn encode<T: Serialize>(value: &T) -> RequestResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> RequestResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| RequestError::Internal(format!("corrupt record: {e}")))
}

//! RocksDB-backed store adapter (feature `rocks`).
//!
//! Layout:
//! - CF `records`  — items keyed `partition ‖ 0x00 ‖ sort`; partition names
//!   never contain NUL, so prefixes are unambiguous and range scans within a
//!   partition are contiguous.
//! - CF `counters` — one little u64 per partition for `next_seq`, durable
//!   across reopen.
//!
//! RocksDB has no native compare-and-set, so conditional puts, batches, and
//! counter bumps serialize through one write mutex. Reads go straight to the
//! DB. That is enough for the per-partition linearizability contract at the
//! write rates a single process sees.

use std::path::PathBuf;

use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch,
};

use super::{BatchOp, Store, StoreError, StoreResult};

const CF_RECORDS: &str = "records";
const CF_COUNTERS: &str = "counters";

const COLUMN_FAMILIES: &[&str] = &[CF_RECORDS, CF_COUNTERS];

/// RocksDB adapter configuration.
#[derive(Debug, Clone)]
pub struct RocksStoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB).
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10).
    pub bloom_filter_bits: f64,
    /// fsync every write (default: false).
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for RocksStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cipherbase_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10.0,
            sync_writes: false,
            max_open_files: 512,
        }
    }
}

impl RocksStoreConfig {
    /// Small caches, temp-friendly.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            max_open_files: 64,
            ..Self::default()
        }
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksStoreConfig,
    /// Serializes every conditional check-then-write.
    write_lock: Mutex<()>,
}

impl RocksStore {
    pub fn open(config: RocksStoreConfig) -> StoreResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(config: &RocksStoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        opts.set_block_based_table_factory(&block_opts);
        // Stored values are client ciphertext; compression buys nothing.
        opts.set_compression_type(DBCompressionType::None);
        opts
    }

    fn records_cf(&self) -> StoreResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(CF_RECORDS)
            .ok_or_else(|| StoreError::Unavailable("missing records column family".into()))
    }

    fn counters_cf(&self) -> StoreResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(CF_COUNTERS)
            .ok_or_else(|| StoreError::Unavailable("missing counters column family".into()))
    }

    fn item_key(partition: &str, sort: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(partition.len() + 1 + sort.len());
        key.extend_from_slice(partition.as_bytes());
        key.push(0);
        key.extend_from_slice(sort);
        key
    }

    fn map_err(e: rocksdb::Error) -> StoreError {
        StoreError::Unavailable(e.to_string())
    }
}

impl Store for RocksStore {
    fn put(&self, partition: &str, sort: &[u8], value: &[u8], if_absent: bool) -> StoreResult<()> {
        let cf = self.records_cf()?;
        let key = Self::item_key(partition, sort);
        let _guard = self.write_lock.lock();
        if if_absent
            && self
                .db
                .get_pinned_cf(cf, &key)
                .map_err(Self::map_err)?
                .is_some()
        {
            return Err(StoreError::Conflict {
                partition: partition.to_string(),
                sort: String::from_utf8_lossy(sort).into_owned(),
            });
        }
        self.db.put_cf(cf, &key, value).map_err(Self::map_err)
    }

    fn get(&self, partition: &str, sort: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let cf = self.records_cf()?;
        self.db
            .get_cf(cf, Self::item_key(partition, sort))
            .map_err(Self::map_err)
    }

    fn range(
        &self,
        partition: &str,
        from: &[u8],
        to: Option<&[u8]>,
    ) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.records_cf()?;
        let mut prefix = partition.as_bytes().to_vec();
        prefix.push(0);
        let start = Self::item_key(partition, from);
        let upper = to.map(|to| Self::item_key(partition, to));

        let mut items = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(&start, rocksdb::Direction::Forward),
        );
        for entry in iter {
            let (key, value) = entry.map_err(Self::map_err)?;
            if !key.starts_with(&prefix) {
                break;
            }
            if let Some(upper) = &upper {
                if key.as_ref() > upper.as_slice() {
                    break;
                }
            }
            items.push((key[prefix.len()..].to_vec(), value.to_vec()));
        }
        Ok(items)
    }

    fn batch(&self, partition: &str, ops: &[BatchOp]) -> StoreResult<()> {
        let cf = self.records_cf()?;
        let _guard = self.write_lock.lock();

        for op in ops {
            if let BatchOp::Put {
                sort,
                if_absent: true,
                ..
            } = op
            {
                let key = Self::item_key(partition, sort);
                if self
                    .db
                    .get_pinned_cf(cf, &key)
                    .map_err(Self::map_err)?
                    .is_some()
                {
                    return Err(StoreError::ConditionFailed);
                }
            }
        }

        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put { sort, value, .. } => {
                    batch.put_cf(cf, Self::item_key(partition, sort), value);
                }
                BatchOp::Delete { sort } => {
                    batch.delete_cf(cf, Self::item_key(partition, sort));
                }
            }
        }
        let mut write_opts = rocksdb::WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts).map_err(Self::map_err)
    }

    fn next_seq(&self, partition: &str) -> StoreResult<u64> {
        let cf = self.counters_cf()?;
        let _guard = self.write_lock.lock();
        let current = match self
            .db
            .get_cf(cf, partition.as_bytes())
            .map_err(Self::map_err)?
        {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt(format!("counter for {partition}")))?;
                u64::from_be_bytes(bytes)
            }
            None => 0,
        };
        let next = current + 1;
        self.db
            .put_cf(cf, partition.as_bytes(), next.to_be_bytes())
            .map_err(Self::map_err)?;
        Ok(next)
    }

    fn delete(&self, partition: &str, sort: &[u8]) -> StoreResult<()> {
        let cf = self.records_cf()?;
        self.db
            .delete_cf(cf, Self::item_key(partition, sort))
            .map_err(Self::map_err)
    }

    fn delete_partition(&self, partition: &str) -> StoreResult<()> {
        let items = self.range(partition, &[], None)?;
        let cf = self.records_cf()?;
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        for (sort, _) in items {
            batch.delete_cf(cf, Self::item_key(partition, &sort));
        }
        self.db.write(batch).map_err(Self::map_err)?;
        let counters = self.counters_cf()?;
        self.db
            .delete_cf(counters, partition.as_bytes())
            .map_err(Self::map_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::seq_sort_key;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(RocksStoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, store) = open_temp();
        store.put("users", b"u1", b"alice", true).unwrap();
        assert_eq!(store.get("users", b"u1").unwrap(), Some(b"alice".to_vec()));
    }

    #[test]
    fn test_conditional_put_conflict() {
        let (_dir, store) = open_temp();
        store.put("users", b"u1", b"alice", true).unwrap();
        assert!(matches!(
            store.put("users", b"u1", b"bob", true),
            Err(StoreError::Conflict { .. })
        ));
    }

    #[test]
    fn test_partitions_do_not_bleed() {
        let (_dir, store) = open_temp();
        store.put("a", b"k", b"in-a", true).unwrap();
        store.put("ab", b"k", b"in-ab", true).unwrap();
        let items = store.range("a", &[], None).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].1, b"in-a");
    }

    #[test]
    fn test_range_with_bounds() {
        let (_dir, store) = open_temp();
        for seq in 1u64..=10 {
            store.put("log", &seq_sort_key(seq), b"r", true).unwrap();
        }
        let items = store
            .range("log", &seq_sort_key(4), Some(&seq_sort_key(7)))
            .unwrap();
        assert_eq!(items.len(), 4);
    }

    #[test]
    fn test_batch_condition_failure_applies_nothing() {
        let (_dir, store) = open_temp();
        store.put("p", b"taken", b"v", true).unwrap();
        let err = store
            .batch(
                "p",
                &[
                    BatchOp::Put {
                        sort: b"fresh".to_vec(),
                        value: b"v".to_vec(),
                        if_absent: true,
                    },
                    BatchOp::Put {
                        sort: b"taken".to_vec(),
                        value: b"v".to_vec(),
                        if_absent: true,
                    },
                ],
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed));
        assert_eq!(store.get("p", b"fresh").unwrap(), None);
    }

    #[test]
    fn test_next_seq_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksStore::open(RocksStoreConfig::for_testing(&path)).unwrap();
            assert_eq!(store.next_seq("log").unwrap(), 1);
            assert_eq!(store.next_seq("log").unwrap(), 2);
        }
        let store = RocksStore::open(RocksStoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.next_seq("log").unwrap(), 3);
    }

    #[test]
    fn test_delete_partition_resets_counter() {
        let (_dir, store) = open_temp();
        store.put("p", b"a", b"1", true).unwrap();
        store.next_seq("p").unwrap();
        store.delete_partition("p").unwrap();
        assert!(store.range("p", &[], None).unwrap().is_empty());
        assert_eq!(store.next_seq("p").unwrap(), 1);
    }
}

//! In-process store adapter over ordered maps.
//!
//! The default adapter for embedding and tests. A single write lock per call
//! gives the serializable-batch and linearizable-per-partition contracts
//! trivially; contention is irrelevant at in-process scale.

use std::collections::{BTreeMap, HashMap};

use parking_lot::{Mutex, RwLock};

use super::{BatchOp, Store, StoreError, StoreResult};

type Partition = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<String, Partition>>,
    counters: Mutex<HashMap<String, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sort_display(sort: &[u8]) -> String {
        String::from_utf8_lossy(sort).into_owned()
    }
}

impl Store for MemoryStore {
    fn put(&self, partition: &str, sort: &[u8], value: &[u8], if_absent: bool) -> StoreResult<()> {
        let mut partitions = self.partitions.write();
        let part = partitions.entry(partition.to_string()).or_default();
        if if_absent && part.contains_key(sort) {
            return Err(StoreError::Conflict {
                partition: partition.to_string(),
                sort: Self::sort_display(sort),
            });
        }
        part.insert(sort.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, partition: &str, sort: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let partitions = self.partitions.read();
        Ok(partitions
            .get(partition)
            .and_then(|part| part.get(sort))
            .cloned())
    }

    fn range(
        &self,
        partition: &str,
        from: &[u8],
        to: Option<&[u8]>,
    ) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let partitions = self.partitions.read();
        let Some(part) = partitions.get(partition) else {
            return Ok(Vec::new());
        };
        let items = part
            .range(from.to_vec()..)
            .take_while(|(k, _)| match to {
                Some(to) => k.as_slice() <= to,
                None => true,
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(items)
    }

    fn batch(&self, partition: &str, ops: &[BatchOp]) -> StoreResult<()> {
        let mut partitions = self.partitions.write();
        let part = partitions.entry(partition.to_string()).or_default();

        // Validate the full condition set before touching anything.
        for op in ops {
            if let BatchOp::Put {
                sort,
                if_absent: true,
                ..
            } = op
            {
                if part.contains_key(sort) {
                    return Err(StoreError::ConditionFailed);
                }
            }
        }
        for op in ops {
            match op {
                BatchOp::Put { sort, value, .. } => {
                    part.insert(sort.clone(), value.clone());
                }
                BatchOp::Delete { sort } => {
                    part.remove(sort);
                }
            }
        }
        Ok(())
    }

    fn next_seq(&self, partition: &str) -> StoreResult<u64> {
        let mut counters = self.counters.lock();
        let counter = counters.entry(partition.to_string()).or_insert_with(|| {
            // Resume above any 8-byte sequence key already in the partition,
            // mirroring how a durable adapter recovers its counter.
            self.partitions
                .read()
                .get(partition)
                .and_then(|part| {
                    part.keys()
                        .rev()
                        .find_map(|k| super::seq_from_sort_key(k))
                })
                .unwrap_or(0)
        });
        *counter += 1;
        Ok(*counter)
    }

    fn delete(&self, partition: &str, sort: &[u8]) -> StoreResult<()> {
        let mut partitions = self.partitions.write();
        if let Some(part) = partitions.get_mut(partition) {
            part.remove(sort);
        }
        Ok(())
    }

    fn delete_partition(&self, partition: &str) -> StoreResult<()> {
        self.partitions.write().remove(partition);
        self.counters.lock().remove(partition);
        Ok(())
    }
}

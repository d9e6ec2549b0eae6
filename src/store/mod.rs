//! Store adapter: a thin interface over a wide-column KV store.
//!
//! ```text
//! ┌────────────┐  put / get / range / batch   ┌──────────────┐
//! │ LogEngine  │ ───────────────────────────► │ impl Store   │
//! │ UserDir    │          next_seq            │  memory      │
//! └────────────┘                              │  rocks (opt) │
//!                                             └──────────────┘
//! ```
//!
//! Contracts every adapter upholds:
//! - Within one `batch`, condition checks and writes apply serializably.
//! - Across calls, reads observe a linearizable history per partition.
//! - `next_seq` is strictly increasing per partition and never reused,
//!   including across reopen for durable adapters.

pub mod memory;
#[cfg(feature = "rocks")]
pub mod rocks;

pub use memory::MemoryStore;
#[cfg(feature = "rocks")]
pub use rocks::{RocksStore, RocksStoreConfig};

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Conditional insert found the sort key occupied.
    #[error("conflict at {partition}/{sort}")]
    Conflict { partition: String, sort: String },
    /// A batch condition did not hold; nothing was applied.
    #[error("batch condition failed")]
    ConditionFailed,
    /// The batch lost a transactional race; nothing was applied.
    #[error("transaction conflict")]
    TxConflict,
    #[error("not found")]
    NotFound,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage timeout")]
    Timeout,
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One operation of a same-partition transactional batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put {
        sort: Vec<u8>,
        value: Vec<u8>,
        if_absent: bool,
    },
    Delete {
        sort: Vec<u8>,
    },
}

/// Wide-column KV interface: items addressed by (partition, sort key),
/// ordered by sort key within a partition.
pub trait Store: Send + Sync {
    /// Write one item. With `if_absent`, fails with [`StoreError::Conflict`]
    /// when the sort key is already present.
    fn put(&self, partition: &str, sort: &[u8], value: &[u8], if_absent: bool) -> StoreResult<()>;

    fn get(&self, partition: &str, sort: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Items with `from ≤ sort ≤ to`, ascending. `None` runs to the end of
    /// the partition.
    fn range(
        &self,
        partition: &str,
        from: &[u8],
        to: Option<&[u8]>,
    ) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply all operations or none, within one partition.
    fn batch(&self, partition: &str, ops: &[BatchOp]) -> StoreResult<()>;

    /// Next value of the partition's monotone counter, starting at 1.
    fn next_seq(&self, partition: &str) -> StoreResult<u64>;

    fn delete(&self, partition: &str, sort: &[u8]) -> StoreResult<()>;

    /// Drop every item in a partition. Used for database teardown; built on
    /// `range` + `delete` unless the adapter has something cheaper.
    fn delete_partition(&self, partition: &str) -> StoreResult<()> {
        for (sort, _) in self.range(partition, &[], None)? {
            self.delete(partition, &sort)?;
        }
        Ok(())
    }
}

/// Big-endian sort key for a sequence number, so byte order matches numeric
/// order in `range` scans.
pub fn seq_sort_key(seq_no: u64) -> [u8; 8] {
    seq_no.to_be_bytes()
}

/// Inverse of [`seq_sort_key`].
pub fn seq_from_sort_key(sort: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = sort.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

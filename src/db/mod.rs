//! Persistent reference-counted cell storage.
//!
//! Cells are stored in a [`KeyValue`] store keyed by their representation hash.
//! Each row contains a reference counter, a root reference counter and an
//! encoded cell body. Changes are accumulated with [`CellDb::inc`] and
//! [`CellDb::dec`], converted into row diffs by [`CellDb::prepare_commit`] and
//! written as a single atomic batch by [`CellDb::commit`].
//!
//! ```text
//! Idle --inc/dec--> Pending --prepare_commit--> Prepared --commit--> Idle
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cell::{Cell, HashBytes, UsageTree};

pub use self::concurrent::{ConcurrentCellDb, PrepareHandle};
pub use self::executor::{AsyncExecutor, ThreadExecutor};
#[cfg(feature = "rayon")]
pub use self::executor::RayonExecutor;
pub use self::in_memory::InMemoryCellDb;
pub use self::kv::{
    keep_cell_row, merge_cell_rows, BatchOp, CellRow, KeyValue, KvSnapshot, Namespace, WriteBatch,
};
pub use self::loader::{CellLoader, HotCellCache};
pub use self::memory::MemoryKv;
#[cfg(feature = "rocksdb")]
pub use self::rocks::{RocksKv, RocksKvConfig};
pub use self::sequential::SequentialCellDb;
pub use self::storage_cell::StorageCell;

mod concurrent;
mod executor;
mod in_memory;
mod kv;
mod loader;
mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;
mod sequential;
mod storage_cell;
mod transaction;

#[cfg(test)]
mod tests;

/// Reference-counted cell database.
pub trait CellDb: Send {
    /// Adds a root reference to the cell.
    fn inc(&mut self, cell: &Cell);

    /// Removes a root reference from the cell.
    fn dec(&mut self, cell: &Cell);

    /// Computes row changes for all pending root references.
    ///
    /// Pending changes are consumed even if an error occurs.
    fn prepare_commit(&mut self) -> Result<(), StorageError>;

    /// Writes prepared changes and metadata into the store as a single batch.
    ///
    /// Prepares pending changes first if [`prepare_commit`] was not called.
    ///
    /// [`prepare_commit`]: Self::prepare_commit
    fn commit(&mut self, kv: &dyn KeyValue) -> Result<(), StorageError>;

    /// Loads a cell with a positive reference counter.
    fn load_cell(&self, hash: &HashBytes) -> Result<Cell, StorageError>;

    /// Loads a cell which was added as a root at least once.
    fn load_root(&self, hash: &HashBytes) -> Result<Cell, StorageError>;

    /// Loads a root cell which records all visited cells into the usage tree.
    fn load_root_tracked(
        &self,
        hash: &HashBytes,
        usage_tree: &UsageTree,
    ) -> Result<Cell, StorageError> {
        let cell = ok!(self.load_root(hash));
        Ok(usage_tree.track(&cell))
    }

    /// Replaces the loader used for new loads.
    ///
    /// Already loaded cells keep using their own loader.
    fn set_loader(&mut self, loader: Arc<CellLoader>);

    /// Reads a metadata value including uncommitted changes.
    fn meta_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Sets a metadata value which will be written with the next commit.
    fn meta_set(&mut self, key: &[u8], value: &[u8]);

    /// Removes a metadata value with the next commit.
    fn meta_erase(&mut self, key: &[u8]);

    /// Returns storage statistics.
    fn get_stats(&self) -> DbStats;
}

/// Storage statistics.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct DbStats {
    /// The number of stored cells with a positive reference counter.
    pub cells_total: u64,
    /// The number of stored cells with a positive root reference counter.
    pub roots_total: u64,
    /// Implementation specific counters.
    pub named: BTreeMap<&'static str, u64>,
}

/// Cell database settings.
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CellDbConfig {
    /// Cells with a representation depth up to this value are stored
    /// with their whole subtree in a single row. Disabled when zero.
    pub compress_depth: u16,
    /// The number of additional threads used to fetch rows during prepare.
    pub extra_threads: usize,
    /// The minimal number of rows in a depth bucket to fetch them in parallel.
    pub parallel_fetch_threshold: usize,
    /// Lifetime of hot cache entries in milliseconds.
    pub hot_cache_ttl_ms: u64,
    /// The maximum number of hot cache entries.
    pub hot_cache_capacity: usize,
}

impl Default for CellDbConfig {
    fn default() -> Self {
        Self {
            compress_depth: 0,
            extra_threads: 2,
            parallel_fetch_threshold: 1024,
            hot_cache_ttl_ms: 30_000,
            hot_cache_capacity: 100_000,
        }
    }
}

/// Key-value backend error.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum KvError {
    /// Generic backend error.
    #[error("backend error: {0}")]
    Backend(String),
    /// RocksDB error.
    #[cfg(feature = "rocksdb")]
    #[error(transparent)]
    Rocks(#[from] rocksdb::Error),
    /// Column family for the namespace was not created.
    #[cfg(feature = "rocksdb")]
    #[error("column family `{0}` not found")]
    ColumnFamilyNotFound(&'static str),
    /// Backend options are invalid.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// Cell storage error.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum StorageError {
    /// Key-value backend failed.
    #[error(transparent)]
    Kv(#[from] KvError),
    /// There is no alive cell with the specified hash.
    #[error("cell not found: {0}")]
    NotFound(HashBytes),
    /// Stored row is corrupted.
    #[error("invalid cell row: {0}")]
    InvalidRow(HashBytes),
    /// Stored cell references a child which has no valid alive row.
    #[error("cell {parent} references a missing child {child}")]
    BrokenReference {
        /// Representation hash of the loaded cell.
        parent: HashBytes,
        /// Representation hash of the child.
        child: HashBytes,
    },
    /// Failed to build a cell.
    #[error(transparent)]
    Cell(#[from] crate::error::Error),
    /// Reference counter became negative.
    #[error("refcount underflow for cell {hash}: {refcount}")]
    RefcountUnderflow {
        /// Cell representation hash.
        hash: HashBytes,
        /// Resulting counter value.
        refcount: i64,
    },
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::kv::{CellRow, KvSnapshot, Namespace};
use super::storage_cell::decode_body;
use super::StorageError;
use crate::cell::{Cell, HashBytes};

/// Loads cells from a fixed snapshot of the store.
///
/// Loaded cells keep a reference to the loader which was used
/// to load them, so their children are resolved from the same snapshot.
pub struct CellLoader {
    snapshot: Arc<dyn KvSnapshot>,
    hot_cache: Option<Arc<HotCellCache>>,
}

impl CellLoader {
    /// Creates a loader for the specified snapshot.
    pub fn new(snapshot: Arc<dyn KvSnapshot>) -> Arc<Self> {
        Arc::new(Self {
            snapshot,
            hot_cache: None,
        })
    }

    /// Creates a loader which reuses recently committed or loaded cells.
    pub fn with_hot_cache(snapshot: Arc<dyn KvSnapshot>, hot_cache: Arc<HotCellCache>) -> Arc<Self> {
        Arc::new(Self {
            snapshot,
            hot_cache: Some(hot_cache),
        })
    }

    /// Returns the underlying snapshot.
    pub fn snapshot(&self) -> &Arc<dyn KvSnapshot> {
        &self.snapshot
    }

    /// Returns the hot cache if it was specified.
    pub fn hot_cache(&self) -> Option<&Arc<HotCellCache>> {
        self.hot_cache.as_ref()
    }

    /// Reads the counters and the body of the cell row.
    pub fn load_row(&self, hash: &HashBytes) -> Result<Option<LoadedRow>, StorageError> {
        let Some(value) = self.snapshot.get(Namespace::Cells, hash.as_slice())? else {
            return Ok(None);
        };
        match CellRow::decode(&value) {
            Some(row) => Ok(Some(LoadedRow {
                refcount: row.refcount,
                root_refs: row.root_refs,
                body: row.body.to_vec(),
            })),
            None => Err(StorageError::InvalidRow(*hash)),
        }
    }

    /// Loads an alive cell.
    ///
    /// The row is always checked against the snapshot of this loader,
    /// the hot cache only replaces decoding.
    pub fn load_cell(self: &Arc<Self>, hash: &HashBytes) -> Result<Cell, StorageError> {
        match ok!(self.load_row(hash)) {
            Some(row) if row.refcount > 0 => self.decode_row(hash, &row),
            _ => Err(StorageError::NotFound(*hash)),
        }
    }

    /// Loads a cell with a positive root reference counter.
    pub fn load_root(self: &Arc<Self>, hash: &HashBytes) -> Result<Cell, StorageError> {
        match ok!(self.load_row(hash)) {
            Some(row) if row.refcount > 0 && row.root_refs > 0 => self.decode_row(hash, &row),
            _ => Err(StorageError::NotFound(*hash)),
        }
    }

    fn decode_row(self: &Arc<Self>, hash: &HashBytes, row: &LoadedRow) -> Result<Cell, StorageError> {
        if let Some(cell) = self.hot_cache.as_ref().and_then(|cache| cache.get(hash)) {
            return Ok(cell);
        }

        let cell = ok!(decode_body(self, hash, &row.body));
        if let Some(cache) = &self.hot_cache {
            cache.insert(&cell);
        }
        Ok(cell)
    }
}

/// Owned cell row.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LoadedRow {
    /// The total number of references.
    pub refcount: i64,
    /// The number of root references.
    pub root_refs: i64,
    /// Encoded cell body.
    pub body: Vec<u8>,
}

/// Shared cache of recently used cells.
///
/// Entries expire after the specified TTL. New entries are not
/// added when the cache is full even after expired entries are removed.
pub struct HotCellCache {
    entries: scc::HashMap<HashBytes, HotEntry, ahash::RandomState>,
    ttl: Duration,
    capacity: usize,
}

struct HotEntry {
    cell: Cell,
    inserted_at: Instant,
}

impl HotCellCache {
    /// Creates an empty cache.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Default::default(),
            ttl,
            capacity,
        }
    }

    /// Returns a fresh cached cell.
    pub fn get(&self, hash: &HashBytes) -> Option<Cell> {
        let ttl = self.ttl;
        let cached = self
            .entries
            .read(hash, |_, entry| (entry.inserted_at.elapsed() <= ttl).then(|| entry.cell.clone()))?;

        match cached {
            Some(cell) => {
                tracing::trace!(%hash, "hot cell cache hit");
                Some(cell)
            }
            None => {
                self.entries.remove(hash);
                None
            }
        }
    }

    /// Adds or refreshes the cell.
    pub fn insert(&self, cell: &Cell) {
        let hash = *cell.repr_hash();
        if self.entries.len() >= self.capacity && !self.entries.contains(&hash) {
            self.evict_expired();
            if self.entries.len() >= self.capacity {
                tracing::warn!(capacity = self.capacity, "hot cell cache is full");
                return;
            }
        }

        let entry = HotEntry {
            cell: cell.clone(),
            inserted_at: Instant::now(),
        };
        match self.entries.entry(hash) {
            scc::hash_map::Entry::Occupied(mut occupied) => *occupied.get_mut() = entry,
            scc::hash_map::Entry::Vacant(vacant) => {
                vacant.insert_entry(entry);
            }
        }
    }

    /// Removes the cell from the cache.
    pub fn remove(&self, hash: &HashBytes) -> bool {
        self.entries.remove(hash).is_some()
    }

    /// Returns the number of entries including expired ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the cache has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn evict_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use super::kv::KeyValue;
use super::loader::CellLoader;
use super::transaction::{
    prepare, MetaChanges, PendingRoots, PrepareOptions, PreparedCommit, RowChange, RowSource,
    StoredRow,
};
use super::{CellDb, CellDbConfig, DbStats, StorageError};
use crate::cell::{Cell, HashBytes};

/// Cell database which keeps all cells in memory.
///
/// Follows the same reference counting rules as the persistent variants,
/// but ignores the key-value store passed to [`CellDb::commit`].
pub struct InMemoryCellDb {
    arena: ahash::HashMap<HashBytes, ArenaEntry>,
    meta: BTreeMap<Vec<u8>, Vec<u8>>,
    config: CellDbConfig,
    pending: PendingRoots,
    prepared: Option<PreparedCommit>,
    meta_changes: MetaChanges,
    commits: u64,
}

struct ArenaEntry {
    cell: Cell,
    refcount: i64,
    root_refs: i64,
}

impl InMemoryCellDb {
    /// Creates an empty database.
    pub fn new(config: CellDbConfig) -> Self {
        Self {
            arena: Default::default(),
            meta: Default::default(),
            config,
            pending: Default::default(),
            prepared: None,
            meta_changes: Default::default(),
            commits: 0,
        }
    }

    fn apply(&mut self, prepared: &PreparedCommit) -> Result<(), StorageError> {
        for update in &prepared.updates {
            match update.change {
                RowChange::Created => {
                    let Some(cell) = &update.cell else {
                        return Err(StorageError::NotFound(update.hash));
                    };
                    let entry = self.arena.entry(update.hash).or_insert_with(|| ArenaEntry {
                        cell: cell.clone(),
                        refcount: 0,
                        root_refs: 0,
                    });
                    entry.refcount += update.refcount;
                    entry.root_refs += update.root_refs;
                }
                RowChange::Updated => {
                    let Some(entry) = self.arena.get_mut(&update.hash) else {
                        return Err(StorageError::NotFound(update.hash));
                    };
                    entry.refcount += update.refcount;
                    entry.root_refs += update.root_refs;
                }
                RowChange::Removed => {
                    self.arena.remove(&update.hash);
                }
            }
        }
        Ok(())
    }
}

impl Default for InMemoryCellDb {
    fn default() -> Self {
        Self::new(CellDbConfig::default())
    }
}

impl RowSource for InMemoryCellDb {
    fn fetch(&self, hash: &HashBytes) -> Result<Option<StoredRow>, StorageError> {
        Ok(self.arena.get(hash).map(|entry| {
            let cell = entry.cell.as_ref().untracked();
            StoredRow {
                refcount: entry.refcount,
                root_refs: entry.root_refs,
                depth: cell.repr_depth(),
                children: cell.references().map(|child| *child.repr_hash()).collect(),
                is_subtree: false,
            }
        }))
    }
}

impl CellDb for InMemoryCellDb {
    fn inc(&mut self, cell: &Cell) {
        self.pending.inc(cell);
    }

    fn dec(&mut self, cell: &Cell) {
        self.pending.dec(cell);
    }

    fn prepare_commit(&mut self) -> Result<(), StorageError> {
        if self.prepared.is_some() {
            return Ok(());
        }

        let pending = std::mem::take(&mut self.pending);
        let options = PrepareOptions {
            compress_depth: 0,
            extra_threads: 0,
            ..PrepareOptions::new(&self.config, false)
        };
        let prepared = ok!(prepare(pending, &*self, &options));
        self.prepared = Some(prepared);
        Ok(())
    }

    fn commit(&mut self, _: &dyn KeyValue) -> Result<(), StorageError> {
        ok!(self.prepare_commit());
        let prepared = self.prepared.take().unwrap_or_default();
        ok!(self.apply(&prepared));

        for (key, value) in self.meta_changes.take() {
            match value {
                Some(value) => {
                    self.meta.insert(key, value);
                }
                None => {
                    self.meta.remove(&key);
                }
            }
        }

        self.commits += 1;
        tracing::debug!(
            rows = prepared.updates.len(),
            cells = self.arena.len(),
            "committed in-memory cell db transaction"
        );
        Ok(())
    }

    fn load_cell(&self, hash: &HashBytes) -> Result<Cell, StorageError> {
        match self.arena.get(hash) {
            Some(entry) if entry.refcount > 0 => Ok(entry.cell.clone()),
            _ => Err(StorageError::NotFound(*hash)),
        }
    }

    fn load_root(&self, hash: &HashBytes) -> Result<Cell, StorageError> {
        match self.arena.get(hash) {
            Some(entry) if entry.refcount > 0 && entry.root_refs > 0 => Ok(entry.cell.clone()),
            _ => Err(StorageError::NotFound(*hash)),
        }
    }

    /// Does nothing since cells are never loaded from the store.
    fn set_loader(&mut self, _: Arc<CellLoader>) {}

    fn meta_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(match self.meta_changes.get(key) {
            Some(value) => value.map(<[u8]>::to_vec),
            None => self.meta.get(key).cloned(),
        })
    }

    fn meta_set(&mut self, key: &[u8], value: &[u8]) {
        self.meta_changes.set(key, value);
    }

    fn meta_erase(&mut self, key: &[u8]) {
        self.meta_changes.erase(key);
    }

    fn get_stats(&self) -> DbStats {
        let mut stats = DbStats {
            cells_total: self.arena.len() as u64,
            roots_total: self.arena.values().filter(|x| x.root_refs > 0).count() as u64,
            named: Default::default(),
        };
        stats.named.insert("commits", self.commits);
        stats.named.insert("pending_roots", self.pending.len() as u64);
        stats
    }
}

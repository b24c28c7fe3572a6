use std::sync::Arc;

use super::kv::{KeyValue, Namespace};
use super::loader::CellLoader;
use super::transaction::{
    prepare, scan_stats, write_commit, Counters, MetaChanges, PendingRoots, PrepareOptions,
    PreparedCommit, SnapshotRows,
};
use super::{CellDb, CellDbConfig, DbStats, StorageError};
use crate::cell::{Cell, HashBytes};

/// Cell database which prepares transactions on the calling thread.
pub struct SequentialCellDb {
    loader: Arc<CellLoader>,
    config: CellDbConfig,
    pending: PendingRoots,
    prepared: Option<PreparedCommit>,
    meta: MetaChanges,
    counters: Counters,
}

impl SequentialCellDb {
    /// Opens the database on top of the current state of the store.
    pub fn new(kv: &dyn KeyValue, config: CellDbConfig) -> Result<Self, StorageError> {
        let snapshot = kv.snapshot();
        let stats = ok!(scan_stats(snapshot.as_ref()));
        tracing::debug!(
            cells_total = stats.cells_total,
            roots_total = stats.roots_total,
            "opened sequential cell db"
        );

        Ok(Self {
            loader: CellLoader::new(snapshot),
            config,
            pending: Default::default(),
            prepared: None,
            meta: Default::default(),
            counters: Counters::new(&stats),
        })
    }

    /// Returns the database settings.
    pub fn config(&self) -> &CellDbConfig {
        &self.config
    }

    /// Changes the subtree compression threshold for new cells.
    pub fn set_compress_depth(&mut self, depth: u16) {
        self.config.compress_depth = depth;
    }

    /// Returns the current loader.
    pub fn loader(&self) -> &Arc<CellLoader> {
        &self.loader
    }
}

impl CellDb for SequentialCellDb {
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
        let source = SnapshotRows {
            snapshot: self.loader.snapshot().clone(),
        };
        let prepared = ok!(prepare(
            pending,
            &source,
            &PrepareOptions::new(&self.config, true)
        ));
        self.prepared = Some(prepared);
        Ok(())
    }

    fn commit(&mut self, kv: &dyn KeyValue) -> Result<(), StorageError> {
        ok!(self.prepare_commit());
        let prepared = self.prepared.take().unwrap_or_default();

        if let Err(e) = write_commit(kv, &prepared, &self.meta) {
            self.prepared = Some(prepared);
            return Err(e);
        }

        self.meta.clear();
        self.counters.apply(&prepared);
        self.loader = CellLoader::new(kv.snapshot());
        tracing::debug!("switched cell loader to the new snapshot");
        Ok(())
    }

    fn load_cell(&self, hash: &HashBytes) -> Result<Cell, StorageError> {
        self.loader.load_cell(hash)
    }

    fn load_root(&self, hash: &HashBytes) -> Result<Cell, StorageError> {
        self.loader.load_root(hash)
    }

    fn set_loader(&mut self, loader: Arc<CellLoader>) {
        self.loader = loader;
    }

    fn meta_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(value) = self.meta.get(key) {
            return Ok(value.map(<[u8]>::to_vec));
        }
        Ok(self.loader.snapshot().get(Namespace::Meta, key)?)
    }

    fn meta_set(&mut self, key: &[u8], value: &[u8]) {
        self.meta.set(key, value);
    }

    fn meta_erase(&mut self, key: &[u8]) {
        self.meta.erase(key);
    }

    fn get_stats(&self) -> DbStats {
        let mut stats = self.counters.to_stats();
        stats.named.insert("pending_roots", self.pending.len() as u64);
        stats
    }
}

use std::sync::Arc;
use std::time::Duration;

use super::executor::AsyncExecutor;
use super::kv::{KeyValue, Namespace};
use super::loader::{CellLoader, HotCellCache};
use super::transaction::{
    prepare, scan_stats, write_commit, Counters, MetaChanges, PendingRoots, PrepareOptions,
    PreparedCommit, RowChange, SnapshotRows,
};
use super::{CellDb, CellDbConfig, DbStats, StorageError};
use crate::cell::{Cell, HashBytes};
use crate::util::Promise;

/// Cell database with a shared hot cell cache which can prepare
/// transactions in background.
pub struct ConcurrentCellDb {
    loader: Arc<CellLoader>,
    hot_cache: Arc<HotCellCache>,
    config: CellDbConfig,
    pending: PendingRoots,
    prepared: PreparedState,
    meta: MetaChanges,
    counters: Counters,
}

enum PreparedState {
    Idle,
    InFlight(PrepareHandle),
    Ready(Arc<PreparedCommit>),
}

impl ConcurrentCellDb {
    /// Opens the database on top of the current state of the store.
    pub fn new(kv: &dyn KeyValue, config: CellDbConfig) -> Result<Self, StorageError> {
        let snapshot = kv.snapshot();
        let stats = ok!(scan_stats(snapshot.as_ref()));
        tracing::debug!(
            cells_total = stats.cells_total,
            roots_total = stats.roots_total,
            "opened concurrent cell db"
        );

        let hot_cache = Arc::new(HotCellCache::new(
            Duration::from_millis(config.hot_cache_ttl_ms),
            config.hot_cache_capacity,
        ));

        Ok(Self {
            loader: CellLoader::with_hot_cache(snapshot, hot_cache.clone()),
            hot_cache,
            config,
            pending: Default::default(),
            prepared: PreparedState::Idle,
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

    /// Returns the cache which is shared by all loaders of this database.
    pub fn hot_cache(&self) -> &Arc<HotCellCache> {
        &self.hot_cache
    }

    /// Starts preparing pending changes on the executor.
    ///
    /// Returns the handle of the already started prepare if there is one.
    /// Dropping the handle doesn't cancel the work, [`commit`] waits for it.
    ///
    /// [`commit`]: CellDb::commit
    pub fn prepare_commit_async(&mut self, executor: &dyn AsyncExecutor) -> PrepareHandle {
        match &self.prepared {
            PreparedState::InFlight(handle) => return handle.clone(),
            PreparedState::Ready(prepared) => return PrepareHandle::resolved(Ok(prepared.clone())),
            PreparedState::Idle => {}
        }

        let pending = std::mem::take(&mut self.pending);
        let source = SnapshotRows {
            snapshot: self.loader.snapshot().clone(),
        };
        let options = PrepareOptions::new(&self.config, true);

        let handle = PrepareHandle {
            promise: Promise::new(),
        };
        executor.execute_async(Box::new({
            let promise = handle.promise.clone();
            move || promise.set(prepare(pending, &source, &options).map(Arc::new))
        }));

        self.prepared = PreparedState::InFlight(handle.clone());
        handle
    }

    fn take_prepared(&mut self) -> Result<Arc<PreparedCommit>, StorageError> {
        match std::mem::replace(&mut self.prepared, PreparedState::Idle) {
            PreparedState::Idle => {
                let pending = std::mem::take(&mut self.pending);
                let source = SnapshotRows {
                    snapshot: self.loader.snapshot().clone(),
                };
                let prepared = ok!(prepare(
                    pending,
                    &source,
                    &PrepareOptions::new(&self.config, true)
                ));
                Ok(Arc::new(prepared))
            }
            PreparedState::InFlight(handle) => handle.join(),
            PreparedState::Ready(prepared) => Ok(prepared),
        }
    }

    fn update_hot_cache(&self, prepared: &PreparedCommit) {
        for update in &prepared.updates {
            match update.change {
                RowChange::Removed => {
                    self.hot_cache.remove(&update.hash);
                }
                RowChange::Created => {
                    // Tracked cells must not leak into other readers
                    if let Some(cell) = &update.cell {
                        if std::ptr::addr_eq(cell.as_ref(), cell.as_ref().untracked()) {
                            self.hot_cache.insert(cell);
                        }
                    }
                }
                RowChange::Updated => {}
            }
        }
    }
}

impl Drop for ConcurrentCellDb {
    fn drop(&mut self) {
        // NOTE: cached storage cells reference loaders which reference the cache
        self.hot_cache.clear();
    }
}

impl CellDb for ConcurrentCellDb {
    fn inc(&mut self, cell: &Cell) {
        self.pending.inc(cell);
    }

    fn dec(&mut self, cell: &Cell) {
        self.pending.dec(cell);
    }

    fn prepare_commit(&mut self) -> Result<(), StorageError> {
        let prepared = ok!(self.take_prepared());
        self.prepared = PreparedState::Ready(prepared);
        Ok(())
    }

    fn commit(&mut self, kv: &dyn KeyValue) -> Result<(), StorageError> {
        let prepared = ok!(self.take_prepared());

        if let Err(e) = write_commit(kv, &prepared, &self.meta) {
            self.prepared = PreparedState::Ready(prepared);
            return Err(e);
        }

        self.meta.clear();
        self.counters.apply(&prepared);
        self.update_hot_cache(&prepared);

        self.loader = CellLoader::with_hot_cache(kv.snapshot(), self.hot_cache.clone());
        tracing::debug!(
            hot_cache_len = self.hot_cache.len(),
            "switched cell loader to the new snapshot"
        );
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
        stats.named.insert("hot_cache_len", self.hot_cache.len() as u64);
        stats.named.insert(
            "prepare_in_flight",
            matches!(self.prepared, PreparedState::InFlight(_)) as u64,
        );
        stats
    }
}

/// Waitable result of [`ConcurrentCellDb::prepare_commit_async`].
#[derive(Clone)]
pub struct PrepareHandle {
    promise: Promise<Result<Arc<PreparedCommit>, StorageError>>,
}

impl PrepareHandle {
    fn resolved(result: Result<Arc<PreparedCommit>, StorageError>) -> Self {
        let promise = Promise::new();
        promise.set(result);
        Self { promise }
    }

    /// Returns `true` if the prepare has finished.
    pub fn is_ready(&self) -> bool {
        self.promise.is_ready()
    }

    /// Blocks the current thread until the prepare finishes.
    pub fn wait(&self) -> Result<(), StorageError> {
        self.join().map(|_| ())
    }

    fn join(&self) -> Result<Arc<PreparedCommit>, StorageError> {
        self.promise.wait_cloned()
    }
}

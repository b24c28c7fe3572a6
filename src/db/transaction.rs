use std::collections::BTreeMap;
use std::sync::Arc;

use smallvec::SmallVec;

use super::kv::{CellRow, KeyValue, KvSnapshot, Namespace, WriteBatch};
use super::storage_cell::{encode_cell_body, encode_subtree_body, parse_body_info};
use super::{CellDbConfig, DbStats, StorageError};
use crate::cell::{Cell, HashBytes, MAX_REF_COUNT};

/// Root reference changes accumulated since the last prepare.
#[derive(Default)]
pub(crate) struct PendingRoots {
    entries: ahash::HashMap<HashBytes, PendingRoot>,
}

struct PendingRoot {
    delta: i64,
    cell: Cell,
}

impl PendingRoots {
    pub fn inc(&mut self, cell: &Cell) {
        self.update(cell, 1);
    }

    pub fn dec(&mut self, cell: &Cell) {
        self.update(cell, -1);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn update(&mut self, cell: &Cell, delta: i64) {
        use std::collections::hash_map;

        match self.entries.entry(*cell.repr_hash()) {
            hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().delta += delta;
                if entry.get().delta == 0 {
                    entry.remove();
                }
            }
            hash_map::Entry::Vacant(entry) => {
                entry.insert(PendingRoot {
                    delta,
                    cell: cell.clone(),
                });
            }
        }
    }
}

/// Graph-related part of the stored row.
#[derive(Debug, Clone)]
pub(crate) struct StoredRow {
    pub refcount: i64,
    pub root_refs: i64,
    pub depth: u16,
    pub children: SmallVec<[HashBytes; MAX_REF_COUNT]>,
    pub is_subtree: bool,
}

/// Source of the current row states.
pub(crate) trait RowSource: Sync {
    fn fetch(&self, hash: &HashBytes) -> Result<Option<StoredRow>, StorageError>;
}

/// Reads rows from a store snapshot.
pub(crate) struct SnapshotRows {
    pub snapshot: Arc<dyn KvSnapshot>,
}

impl RowSource for SnapshotRows {
    fn fetch(&self, hash: &HashBytes) -> Result<Option<StoredRow>, StorageError> {
        let Some(value) = self.snapshot.get(Namespace::Cells, hash.as_slice())? else {
            return Ok(None);
        };
        let Some(row) = CellRow::decode(&value) else {
            return Err(StorageError::InvalidRow(*hash));
        };
        let info = ok!(parse_body_info(hash, row.body));
        Ok(Some(StoredRow {
            refcount: row.refcount,
            root_refs: row.root_refs,
            depth: info.depth,
            children: info.children,
            is_subtree: info.is_subtree,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PrepareOptions {
    pub compress_depth: u16,
    pub extra_threads: usize,
    pub parallel_fetch_threshold: usize,
    pub encode_bodies: bool,
}

impl PrepareOptions {
    pub fn new(config: &CellDbConfig, encode_bodies: bool) -> Self {
        Self {
            compress_depth: config.compress_depth,
            extra_threads: config.extra_threads,
            parallel_fetch_threshold: config.parallel_fetch_threshold.max(1),
            encode_bodies,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum RowChange {
    Created,
    Updated,
    Removed,
}

/// Net change of a single row.
pub(crate) struct RowUpdate {
    pub hash: HashBytes,
    pub refcount: i64,
    pub root_refs: i64,
    pub body: Option<Vec<u8>>,
    pub cell: Option<Cell>,
    pub change: RowChange,
}

/// Result of the prepare phase.
#[derive(Default)]
pub(crate) struct PreparedCommit {
    pub updates: Vec<RowUpdate>,
    pub cells_diff: i64,
    pub roots_diff: i64,
}

impl PreparedCommit {
    /// Appends merge operands for all changed rows.
    pub fn write_rows(&self, batch: &mut WriteBatch) {
        for update in &self.updates {
            let row = CellRow {
                refcount: update.refcount,
                root_refs: update.root_refs,
                body: update.body.as_deref().unwrap_or_default(),
            };
            batch.merge(Namespace::Cells, update.hash.as_slice(), row.to_vec());
        }
    }

    pub fn count(&self, change: RowChange) -> usize {
        self.updates.iter().filter(|x| x.change == change).count()
    }
}

struct Node {
    delta: i64,
    root_delta: i64,
    cell: Option<Cell>,
    row: Option<Option<StoredRow>>,
}

/// Converts root reference changes into row changes.
///
/// Cells are visited from the deepest to the shallowest, so all changes
/// from parents are known before the cell itself is processed.
pub(crate) fn prepare<S: RowSource>(
    pending: PendingRoots,
    source: &S,
    options: &PrepareOptions,
) -> Result<PreparedCommit, StorageError> {
    let mut nodes = ahash::HashMap::<HashBytes, Node>::default();
    let mut buckets = BTreeMap::<u16, Vec<HashBytes>>::new();

    for (hash, root) in pending.entries {
        let depth = root.cell.repr_depth();
        nodes.insert(hash, Node {
            delta: root.delta,
            root_delta: root.delta,
            cell: Some(root.cell),
            row: None,
        });
        buckets.entry(depth).or_default().push(hash);
    }

    let mut result = PreparedCommit::default();

    while let Some((depth, hashes)) = buckets.pop_last() {
        let missing = hashes
            .iter()
            .filter(|hash| matches!(nodes.get(*hash), Some(node) if node.row.is_none()))
            .copied()
            .collect::<Vec<_>>();

        let rows = ok!(fetch_rows(source, &missing, options));
        for (hash, row) in missing.iter().zip(rows) {
            if let Some(node) = nodes.get_mut(hash) {
                node.row = Some(row);
            }
        }

        for hash in hashes {
            let Some(node) = nodes.remove(&hash) else {
                continue;
            };
            let stored = node.row.flatten();

            let (old_refcount, old_root_refs) = match &stored {
                Some(row) => (row.refcount, row.root_refs),
                None => (0, 0),
            };
            let refcount = old_refcount + node.delta;
            let root_refs = old_root_refs + node.root_delta;
            if refcount < 0 || root_refs < 0 {
                tracing::error!(
                    %hash,
                    old_refcount,
                    refcount,
                    old_root_refs,
                    root_refs,
                    "cell refcount underflow"
                );
                return Err(StorageError::RefcountUnderflow { hash, refcount });
            }

            if node.delta == 0 && node.root_delta == 0 {
                continue;
            }

            let mut update = RowUpdate {
                hash,
                refcount: node.delta,
                root_refs: node.root_delta,
                body: None,
                cell: None,
                change: RowChange::Updated,
            };

            if old_refcount <= 0 && refcount > 0 {
                let Some(cell) = node.cell else {
                    // Only stored parents can reference a cell without a body
                    return Err(StorageError::NotFound(hash));
                };

                // NOTE: dead rows keep their body until compaction,
                // so a revived row must reuse the stored layout
                let compress = match &stored {
                    Some(row) => row.is_subtree,
                    None => options.compress_depth > 0 && depth <= options.compress_depth,
                };
                if options.encode_bodies {
                    let mut body = Vec::new();
                    if compress {
                        encode_subtree_body(cell.as_ref().untracked(), &mut body);
                    } else {
                        encode_cell_body(cell.as_ref().untracked(), &mut body);
                    }
                    update.body = Some(body);
                }

                if !compress {
                    for child in cell.as_ref().untracked().references().cloned() {
                        let child_hash = *child.repr_hash();
                        ok!(add_child(
                            &mut nodes,
                            &mut buckets,
                            source,
                            depth,
                            &child_hash,
                            1,
                            Some(child)
                        ));
                    }
                }

                update.cell = Some(cell);
                update.change = RowChange::Created;
                result.cells_diff += 1;
            } else if old_refcount > 0 && refcount == 0 {
                if let Some(row) = &stored {
                    if !row.is_subtree {
                        for child in &row.children {
                            ok!(add_child(
                                &mut nodes,
                                &mut buckets,
                                source,
                                depth,
                                child,
                                -1,
                                None
                            ));
                        }
                    }
                }

                update.change = RowChange::Removed;
                result.cells_diff -= 1;
            }

            match (old_root_refs > 0, root_refs > 0) {
                (false, true) => result.roots_diff += 1,
                (true, false) => result.roots_diff -= 1,
                _ => {}
            }

            result.updates.push(update);
        }
    }

    tracing::debug!(
        rows = result.updates.len(),
        created = result.count(RowChange::Created),
        removed = result.count(RowChange::Removed),
        "prepared commit"
    );
    Ok(result)
}

fn add_child<S: RowSource>(
    nodes: &mut ahash::HashMap<HashBytes, Node>,
    buckets: &mut BTreeMap<u16, Vec<HashBytes>>,
    source: &S,
    parent_depth: u16,
    hash: &HashBytes,
    delta: i64,
    cell: Option<Cell>,
) -> Result<(), StorageError> {
    if let Some(node) = nodes.get_mut(hash) {
        node.delta += delta;
        if node.cell.is_none() {
            node.cell = cell;
        }
        return Ok(());
    }

    let (depth, row) = match &cell {
        Some(cell) => (cell.repr_depth(), None),
        None => {
            let row = ok!(source.fetch(hash));
            let depth = row.as_ref().map(|row| row.depth).unwrap_or_default();
            (depth, Some(row))
        }
    };

    if depth >= parent_depth {
        tracing::error!(%hash, depth, parent_depth, "child is not deeper than its parent");
        return Err(StorageError::InvalidRow(*hash));
    }

    nodes.insert(*hash, Node {
        delta,
        root_delta: 0,
        cell,
        row,
    });
    buckets.entry(depth).or_default().push(*hash);
    Ok(())
}

fn fetch_rows<S: RowSource>(
    source: &S,
    hashes: &[HashBytes],
    options: &PrepareOptions,
) -> Result<Vec<Option<StoredRow>>, StorageError> {
    fn fetch_all<S: RowSource>(
        source: &S,
        hashes: &[HashBytes],
    ) -> Result<Vec<Option<StoredRow>>, StorageError> {
        hashes.iter().map(|hash| source.fetch(hash)).collect()
    }

    if options.extra_threads == 0 || hashes.len() < options.parallel_fetch_threshold {
        return fetch_all(source, hashes);
    }

    let chunk_size = hashes.len().div_ceil(options.extra_threads + 1);
    std::thread::scope(|scope| {
        let mut chunks = hashes.chunks(chunk_size);
        let first = chunks.next().unwrap_or_default();

        let handles = chunks
            .map(|chunk| scope.spawn(move || fetch_all(source, chunk)))
            .collect::<Vec<_>>();

        let mut result = ok!(fetch_all(source, first));
        for handle in handles {
            match handle.join() {
                Ok(rows) => result.extend(ok!(rows)),
                Err(e) => std::panic::resume_unwind(e),
            }
        }
        Ok(result)
    })
}

/// Uncommitted metadata changes.
#[derive(Default)]
pub(crate) struct MetaChanges {
    entries: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl MetaChanges {
    /// Returns `None` if the key was not changed.
    pub fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.entries.get(key).map(Option::as_deref)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.entries.insert(key.to_vec(), Some(value.to_vec()));
    }

    pub fn erase(&mut self, key: &[u8]) {
        self.entries.insert(key.to_vec(), None);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn take(&mut self) -> BTreeMap<Vec<u8>, Option<Vec<u8>>> {
        std::mem::take(&mut self.entries)
    }

    pub fn write(&self, batch: &mut WriteBatch) {
        for (key, value) in &self.entries {
            match value {
                Some(value) => batch.put(Namespace::Meta, key, value),
                None => batch.delete(Namespace::Meta, key),
            }
        }
    }
}

/// Writes the prepared rows and the metadata as a single batch.
pub(crate) fn write_commit(
    kv: &dyn KeyValue,
    prepared: &PreparedCommit,
    meta: &MetaChanges,
) -> Result<(), StorageError> {
    let mut batch = kv.begin_write_batch();
    prepared.write_rows(&mut batch);
    meta.write(&mut batch);

    let ops = batch.len();
    if ops > 0 {
        kv.commit_write_batch(batch)?;
    }

    tracing::debug!(
        ops,
        rows = prepared.updates.len(),
        meta = meta.len(),
        "committed cell db transaction"
    );
    Ok(())
}

/// Running totals of the cell database.
#[derive(Debug, Default, Clone)]
pub(crate) struct Counters {
    cells_total: i64,
    roots_total: i64,
    commits: u64,
    cells_created: u64,
    cells_removed: u64,
}

impl Counters {
    pub fn new(stats: &DbStats) -> Self {
        Self {
            cells_total: stats.cells_total as i64,
            roots_total: stats.roots_total as i64,
            ..Default::default()
        }
    }

    pub fn apply(&mut self, prepared: &PreparedCommit) {
        self.cells_total += prepared.cells_diff;
        self.roots_total += prepared.roots_diff;
        self.commits += 1;
        self.cells_created += prepared.count(RowChange::Created) as u64;
        self.cells_removed += prepared.count(RowChange::Removed) as u64;
    }

    pub fn to_stats(&self) -> DbStats {
        let mut stats = DbStats {
            cells_total: self.cells_total.max(0) as u64,
            roots_total: self.roots_total.max(0) as u64,
            named: Default::default(),
        };
        stats.named.insert("commits", self.commits);
        stats.named.insert("cells_created", self.cells_created);
        stats.named.insert("cells_removed", self.cells_removed);
        stats
    }
}

/// Counts alive cells and roots in the store.
pub(crate) fn scan_stats(snapshot: &dyn KvSnapshot) -> Result<DbStats, StorageError> {
    let mut stats = DbStats::default();
    let mut invalid = 0usize;
    snapshot.for_each(Namespace::Cells, &mut |_, value| {
        match CellRow::decode(value) {
            Some(row) => {
                stats.cells_total += (row.refcount > 0) as u64;
                stats.roots_total += (row.root_refs > 0) as u64;
            }
            None => invalid += 1,
        }
        true
    })?;

    if invalid > 0 {
        tracing::warn!(invalid, "found malformed cell rows");
    }
    Ok(stats)
}

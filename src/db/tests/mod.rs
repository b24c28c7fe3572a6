use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::*;
use crate::boc::Boc;
use crate::cell::{CellBuilder, CellType, DynCell, UsageTreeMode};
use crate::error::Error;
use crate::merkle::MerkleProof;
use crate::util::make_random_tree;

type Rows = ahash::HashMap<HashBytes, (i64, i64)>;

/// Computes `(refcount, root_refs)` for all alive cells.
fn expected_rows(roots: &[(&Cell, i64)]) -> Rows {
    let mut result = Rows::default();
    let mut visited = ahash::HashSet::default();
    let mut stack = Vec::<&DynCell>::new();

    for (root, count) in roots {
        if *count <= 0 {
            continue;
        }
        let entry = result.entry(*root.repr_hash()).or_default();
        entry.0 += count;
        entry.1 += count;
        stack.push(root.as_ref());
    }

    while let Some(cell) = stack.pop() {
        if !visited.insert(*cell.repr_hash()) {
            continue;
        }
        for child in cell.references() {
            result.entry(*child.repr_hash()).or_default().0 += 1;
            stack.push(child);
        }
    }

    result
}

fn alive_rows(kv: &dyn KeyValue) -> Rows {
    let mut result = Rows::default();
    kv.for_each(Namespace::Cells, &mut |key, value| {
        let row = CellRow::decode(value).unwrap();
        assert!(row.refcount >= 0 && row.root_refs >= 0);
        if row.refcount > 0 {
            result.insert(HashBytes::from_slice(key), (row.refcount, row.root_refs));
        }
        true
    })
    .unwrap();
    result
}

fn make_state(leaf_count: u32) -> Cell {
    fn make_node(start: u32, len: u32) -> Cell {
        let mut builder = CellBuilder::new();
        if len == 1 {
            builder.store_u32(start).unwrap();
            builder.store_u32(start * 10).unwrap();
        } else {
            builder.store_u8(len.trailing_zeros() as u8).unwrap();
            builder.store_u32(start).unwrap();
            let half = len / 2;
            builder.store_reference(make_node(start, half)).unwrap();
            builder.store_reference(make_node(start + half, half)).unwrap();
        }
        builder.build().unwrap()
    }

    assert!(leaf_count.is_power_of_two());
    make_node(0, leaf_count)
}

fn read_leaf(root: &DynCell, index: u32) -> Result<u32, Error> {
    let mut cell = root;
    loop {
        let mut slice = ok!(cell.as_slice());
        if cell.reference_count() == 0 {
            assert_eq!(ok!(slice.load_u32()), index);
            return slice.load_u32();
        }

        let height = ok!(slice.load_u8());
        let next = (index >> (height - 1)) & 1;
        cell = match cell.reference(next as u8) {
            Some(child) => child,
            None => return Err(Error::CellUnderflow),
        };
    }
}

fn make_cell(value: u32, refs: &[&Cell]) -> Cell {
    let mut builder = CellBuilder::new();
    builder.store_u32(value).unwrap();
    for child in refs {
        builder.store_reference((*child).clone()).unwrap();
    }
    builder.build().unwrap()
}

/// Store which fails to commit batches on demand.
#[derive(Default)]
struct FailingKv {
    inner: MemoryKv,
    fail: AtomicBool,
}

impl KeyValue for FailingKv {
    fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        self.inner.get(ns, key)
    }

    fn for_each(
        &self,
        ns: Namespace,
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError> {
        self.inner.for_each(ns, f)
    }

    fn snapshot(&self) -> Arc<dyn KvSnapshot> {
        self.inner.snapshot()
    }

    fn commit_write_batch(&self, batch: WriteBatch) -> Result<(), KvError> {
        if self.fail.load(Ordering::Acquire) {
            return Err(KvError::Backend("injected failure".to_owned()));
        }
        self.inner.commit_write_batch(batch)
    }
}

#[test]
fn refcount_conservation() {
    let kv = MemoryKv::new();
    let config = CellDbConfig {
        extra_threads: 2,
        parallel_fetch_threshold: 4,
        ..Default::default()
    };
    let mut db = SequentialCellDb::new(&kv, config).unwrap();

    let a = make_random_tree(1, 300);
    let b = make_random_tree(2, 300);

    db.inc(&a);
    db.inc(&b);
    db.commit(&kv).unwrap();
    assert_eq!(alive_rows(&kv), expected_rows(&[(&a, 1), (&b, 1)]));

    db.inc(&a);
    db.dec(&b);
    db.commit(&kv).unwrap();
    assert_eq!(alive_rows(&kv), expected_rows(&[(&a, 2)]));

    let stats = db.get_stats();
    assert_eq!(stats.cells_total as usize, expected_rows(&[(&a, 2)]).len());
    assert_eq!(stats.roots_total, 1);

    db.dec(&a);
    db.dec(&a);
    db.commit(&kv).unwrap();
    assert!(alive_rows(&kv).is_empty());
    assert_eq!(db.get_stats().cells_total, 0);
    assert_eq!(db.get_stats().roots_total, 0);

    // Dead rows stay until compaction
    assert!(kv.len(Namespace::Cells) > 0);
    kv.compact();
    assert_eq!(kv.len(Namespace::Cells), 0);
}

#[test]
fn revive_after_removal() {
    let kv = MemoryKv::new();
    let mut db = SequentialCellDb::new(&kv, CellDbConfig::default()).unwrap();

    let tree = make_random_tree(3, 100);
    db.inc(&tree);
    db.commit(&kv).unwrap();
    db.dec(&tree);
    db.commit(&kv).unwrap();
    assert!(alive_rows(&kv).is_empty());

    // Dead rows are not compacted yet, so their bodies are reused
    db.inc(&tree);
    db.commit(&kv).unwrap();
    assert_eq!(alive_rows(&kv), expected_rows(&[(&tree, 1)]));

    kv.compact();
    let loaded = db.load_root(tree.repr_hash()).unwrap();
    assert_eq!(Boc::encode(&loaded), Boc::encode(&tree));
}

#[test]
fn shared_subtrees() {
    let kv = MemoryKv::new();
    let mut db = SequentialCellDb::new(&kv, CellDbConfig::default()).unwrap();

    let leaf = make_cell(0, &[]);
    let x = make_cell(1, &[&leaf, &leaf]);
    let y = make_cell(2, &[&leaf, &x]);

    db.inc(&x);
    db.inc(&y);
    db.commit(&kv).unwrap();

    let rows = alive_rows(&kv);
    assert_eq!(rows[leaf.repr_hash()], (3, 0));
    assert_eq!(rows[x.repr_hash()], (2, 1));
    assert_eq!(rows[y.repr_hash()], (1, 1));

    db.dec(&x);
    db.commit(&kv).unwrap();

    let rows = alive_rows(&kv);
    assert_eq!(rows[leaf.repr_hash()], (3, 0));
    assert_eq!(rows[x.repr_hash()], (1, 0));

    assert_eq!(
        db.load_root(x.repr_hash()).unwrap_err(),
        StorageError::NotFound(*x.repr_hash())
    );
    assert_eq!(db.load_cell(x.repr_hash()).unwrap().as_ref(), x.as_ref());

    db.dec(&y);
    db.commit(&kv).unwrap();
    assert!(alive_rows(&kv).is_empty());
}

#[test]
fn lazy_loading() {
    let kv = MemoryKv::new();
    let mut db = SequentialCellDb::new(&kv, CellDbConfig::default()).unwrap();

    let tree = make_random_tree(4, 500);
    db.inc(&tree);
    db.commit(&kv).unwrap();

    let loaded = db.load_root(tree.repr_hash()).unwrap();
    assert_eq!(loaded.repr_depth(), tree.repr_depth());
    assert_eq!(loaded.reference_count(), tree.reference_count());

    let old_loader = db.loader().clone();

    db.dec(&tree);
    db.commit(&kv).unwrap();
    kv.compact();
    assert_eq!(
        db.load_cell(tree.repr_hash()).unwrap_err(),
        StorageError::NotFound(*tree.repr_hash())
    );

    // Loaded cells keep using their own snapshot
    assert_eq!(Boc::encode(&loaded), Boc::encode(&tree));

    db.set_loader(old_loader);
    let reloaded = db.load_root(tree.repr_hash()).unwrap();
    assert_eq!(reloaded.as_ref(), tree.as_ref());
}

#[test]
fn load_requires_alive_rows() {
    let kv = MemoryKv::new();
    let mut db = SequentialCellDb::new(&kv, CellDbConfig::default()).unwrap();

    let leaf = make_cell(0, &[]);
    let root = make_cell(1, &[&leaf]);
    db.inc(&root);
    db.commit(&kv).unwrap();

    assert!(db.load_root(root.repr_hash()).is_ok());
    assert!(db.load_cell(leaf.repr_hash()).is_ok());
    assert_eq!(
        db.load_root(leaf.repr_hash()).unwrap_err(),
        StorageError::NotFound(*leaf.repr_hash())
    );

    let unknown = HashBytes([0xaa; 32]);
    assert_eq!(
        db.load_cell(&unknown).unwrap_err(),
        StorageError::NotFound(unknown)
    );
}

#[test]
fn refcount_underflow() {
    let kv = MemoryKv::new();
    let mut db = SequentialCellDb::new(&kv, CellDbConfig::default()).unwrap();

    let cell = make_cell(123, &[]);
    db.dec(&cell);
    assert_eq!(
        db.prepare_commit().unwrap_err(),
        StorageError::RefcountUnderflow {
            hash: *cell.repr_hash(),
            refcount: -1,
        }
    );

    // Pending changes were consumed by the failed prepare
    db.commit(&kv).unwrap();
    assert_eq!(kv.len(Namespace::Cells), 0);

    db.inc(&cell);
    db.commit(&kv).unwrap();
    db.dec(&cell);
    db.dec(&cell);
    assert!(matches!(
        db.commit(&kv),
        Err(StorageError::RefcountUnderflow { .. })
    ));
    assert_eq!(alive_rows(&kv).len(), 1);
}

#[test]
fn proof_from_tracked_load() {
    let kv = MemoryKv::new();
    let mut db = SequentialCellDb::new(&kv, CellDbConfig::default()).unwrap();

    let state = make_state(16);
    db.inc(&state);
    db.commit(&kv).unwrap();

    let usage_tree = UsageTree::new(UsageTreeMode::OnDataAccess);
    let tracked = db
        .load_root_tracked(state.repr_hash(), &usage_tree)
        .unwrap();
    assert_eq!(read_leaf(tracked.as_ref(), 5), Ok(50));

    let proof = MerkleProof::create(tracked.as_ref(), &usage_tree)
        .build()
        .unwrap();
    assert_eq!(proof.hash, *state.repr_hash());

    let virtual_root = proof.virtualize();
    assert_eq!(virtual_root.repr_hash(), state.repr_hash());
    assert_eq!(read_leaf(virtual_root.as_ref(), 5), Ok(50));
    assert_eq!(read_leaf(virtual_root.as_ref(), 4), Ok(40));
    assert_eq!(
        read_leaf(virtual_root.as_ref(), 6),
        Err(Error::PrunedBranchAccess)
    );
}

#[test]
fn meta_is_committed_atomically() {
    let kv = FailingKv::default();
    let mut db = SequentialCellDb::new(&kv, CellDbConfig::default()).unwrap();

    let tree = make_random_tree(5, 50);
    db.inc(&tree);
    db.meta_set(b"last_root", tree.repr_hash().as_slice());
    db.meta_set(b"temp", b"value");
    db.meta_erase(b"temp");

    assert_eq!(
        db.meta_get(b"last_root").unwrap().as_deref(),
        Some(tree.repr_hash().as_slice())
    );
    assert_eq!(db.meta_get(b"temp").unwrap(), None);

    kv.fail.store(true, Ordering::Release);
    assert!(matches!(db.commit(&kv), Err(StorageError::Kv(_))));
    assert_eq!(kv.inner.len(Namespace::Cells), 0);
    assert_eq!(kv.inner.len(Namespace::Meta), 0);

    // Prepared changes are kept for the next attempt
    kv.fail.store(false, Ordering::Release);
    db.commit(&kv).unwrap();
    assert_eq!(alive_rows(&kv), expected_rows(&[(&tree, 1)]));
    assert_eq!(
        kv.get(Namespace::Meta, b"last_root").unwrap().as_deref(),
        Some(tree.repr_hash().as_slice())
    );
    assert!(kv.get(Namespace::Meta, b"temp").unwrap().is_none());

    db.meta_erase(b"last_root");
    db.commit(&kv).unwrap();
    assert_eq!(db.meta_get(b"last_root").unwrap(), None);
    assert_eq!(kv.inner.len(Namespace::Meta), 0);
}

#[test]
fn compressed_subtrees() {
    let kv = MemoryKv::new();
    let config = CellDbConfig {
        compress_depth: 2,
        ..Default::default()
    };
    let mut db = SequentialCellDb::new(&kv, config).unwrap();

    // Depths: root 4, then 3 and 2 for compressed subtrees
    let state = make_state(16);
    db.inc(&state);
    db.commit(&kv).unwrap();

    let rows = alive_rows(&kv);
    assert_eq!(rows.len(), 1 + 2 + 4);
    assert_eq!(rows[state.repr_hash()], (1, 1));
    for (_, (refcount, root_refs)) in rows.iter().filter(|(hash, _)| *hash != state.repr_hash()) {
        assert_eq!((*refcount, *root_refs), (1, 0));
    }

    let loaded = db.load_root(state.repr_hash()).unwrap();
    assert_eq!(Boc::encode(&loaded), Boc::encode(&state));
    assert_eq!(read_leaf(loaded.as_ref(), 13), Ok(130));

    db.dec(&state);
    db.commit(&kv).unwrap();
    assert!(alive_rows(&kv).is_empty());
    assert_eq!(kv.compact(), 7);
}

#[test]
fn concurrent_async_prepare() {
    let kv = MemoryKv::new();
    let mut db = ConcurrentCellDb::new(&kv, CellDbConfig::default()).unwrap();

    let a = make_random_tree(6, 400);
    let b = make_random_tree(7, 400);

    db.inc(&a);
    db.inc(&b);
    let handle = db.prepare_commit_async(&ThreadExecutor);
    handle.wait().unwrap();
    assert!(handle.is_ready());
    drop(handle);

    db.commit(&kv).unwrap();
    assert_eq!(alive_rows(&kv), expected_rows(&[(&a, 1), (&b, 1)]));

    // Created cells are served from the hot cache
    let stats = db.get_stats();
    assert!(stats.named["hot_cache_len"] > 0);
    assert!(db.load_root(a.repr_hash()).is_ok());

    db.dec(&a);
    let _handle = db.prepare_commit_async(&ThreadExecutor);

    // Changes after prepare belong to the next transaction
    db.dec(&b);
    db.commit(&kv).unwrap();
    assert_eq!(alive_rows(&kv), expected_rows(&[(&b, 1)]));
    assert_eq!(
        db.load_cell(a.repr_hash()).unwrap_err(),
        StorageError::NotFound(*a.repr_hash())
    );

    db.commit(&kv).unwrap();
    assert!(alive_rows(&kv).is_empty());
    assert_eq!(db.get_stats().cells_total, 0);
}

#[test]
fn loaders_keep_their_snapshots() {
    let kv = MemoryKv::new();
    let mut db = ConcurrentCellDb::new(&kv, CellDbConfig::default()).unwrap();

    let tree = make_state(8);
    let hash = *tree.repr_hash();
    let inner_hash = *tree.reference(0).unwrap().reference(0).unwrap().repr_hash();
    let empty_loader = db.loader().clone();

    db.inc(&tree);
    db.commit(&kv).unwrap();
    assert!(db.load_root(&hash).is_ok());
    assert!(db.hot_cache().get(&hash).is_some());

    // Cached cells are not visible through a snapshot without them
    assert_eq!(
        empty_loader.load_cell(&hash).unwrap_err(),
        StorageError::NotFound(hash)
    );
    assert_eq!(
        empty_loader.load_root(&hash).unwrap_err(),
        StorageError::NotFound(hash)
    );

    let loader_with_tree = db.loader().clone();

    db.dec(&tree);
    db.commit(&kv).unwrap();
    assert_eq!(db.load_cell(&hash).unwrap_err(), StorageError::NotFound(hash));

    // Reloading through the old snapshot puts cells back into the shared cache
    db.hot_cache().clear();
    let reloaded = loader_with_tree.load_root(&hash).unwrap();
    assert_eq!(reloaded.as_ref(), tree.as_ref());
    assert!(db.hot_cache().get(&hash).is_some());
    assert!(loader_with_tree.load_cell(&inner_hash).is_ok());

    // But removed cells stay removed for the current state
    assert_eq!(db.load_cell(&hash).unwrap_err(), StorageError::NotFound(hash));
    assert_eq!(db.load_root(&hash).unwrap_err(), StorageError::NotFound(hash));
    assert_eq!(
        db.load_cell(&inner_hash).unwrap_err(),
        StorageError::NotFound(inner_hash)
    );
}

#[test]
fn broken_references() {
    let kv = MemoryKv::new();
    let mut db = SequentialCellDb::new(&kv, CellDbConfig::default()).unwrap();

    let leaf = make_cell(0, &[]);
    let other = make_cell(1, &[]);
    let root = make_cell(2, &[&leaf, &other]);
    db.inc(&root);
    db.commit(&kv).unwrap();

    let leaf_key = leaf.repr_hash().as_slice();
    let leaf_row = kv.get(Namespace::Cells, leaf_key).unwrap().unwrap();
    let leaf_body = CellRow::decode(&leaf_row).unwrap().body.to_vec();

    let broken = StorageError::BrokenReference {
        parent: *root.repr_hash(),
        child: *leaf.repr_hash(),
    };
    let mut check = |row: Option<CellRow<'_>>| {
        let mut batch = WriteBatch::default();
        match row {
            Some(row) => batch.put(Namespace::Cells, leaf_key, &row.to_vec()),
            None => batch.delete(Namespace::Cells, leaf_key),
        }
        kv.commit_write_batch(batch).unwrap();

        db.set_loader(CellLoader::new(kv.snapshot()));
        assert_eq!(db.load_root(root.repr_hash()).unwrap_err(), broken);
        assert!(db.load_cell(other.repr_hash()).is_ok());
    };

    // Missing row
    check(None);
    // Dead row
    check(Some(CellRow {
        refcount: 0,
        root_refs: 0,
        body: &leaf_body,
    }));
    // Malformed body
    check(Some(CellRow {
        refcount: 1,
        root_refs: 0,
        body: &[0xff, 0x00],
    }));

    // Restored row makes the tree whole again
    let mut batch = WriteBatch::default();
    batch.put(Namespace::Cells, leaf_key, &leaf_row);
    kv.commit_write_batch(batch).unwrap();
    db.set_loader(CellLoader::new(kv.snapshot()));
    assert_eq!(
        db.load_root(root.repr_hash()).unwrap().as_ref(),
        root.as_ref()
    );
}

#[test]
fn concurrent_prepare_error() {
    let kv = MemoryKv::new();
    let mut db = ConcurrentCellDb::new(&kv, CellDbConfig::default()).unwrap();

    let cell = make_cell(1, &[]);
    db.dec(&cell);
    let handle = db.prepare_commit_async(&ThreadExecutor);
    assert!(matches!(
        handle.wait(),
        Err(StorageError::RefcountUnderflow { .. })
    ));
    assert!(matches!(
        db.commit(&kv),
        Err(StorageError::RefcountUnderflow { .. })
    ));

    db.commit(&kv).unwrap();
    assert_eq!(kv.len(Namespace::Cells), 0);
}

#[test]
fn in_memory_parity() {
    let kv = MemoryKv::new();
    let mut persistent = SequentialCellDb::new(&kv, CellDbConfig::default()).unwrap();
    let mut in_memory = InMemoryCellDb::default();

    let trees = [
        make_random_tree(8, 200),
        make_random_tree(9, 200),
        make_random_tree(10, 200),
    ];

    let steps: [&[(usize, i64)]; 3] = [&[(0, 1), (1, 2)], &[(1, -1), (2, 1)], &[(0, -1), (1, -1)]];
    for step in steps {
        for &(index, delta) in step {
            let db: [&mut dyn CellDb; 2] = [&mut persistent, &mut in_memory];
            for db in db {
                if delta > 0 {
                    db.inc(&trees[index]);
                } else {
                    db.dec(&trees[index]);
                }
            }
        }
        persistent.commit(&kv).unwrap();
        in_memory.commit(&kv).unwrap();

        let persistent_stats = persistent.get_stats();
        let in_memory_stats = in_memory.get_stats();
        assert_eq!(persistent_stats.cells_total, in_memory_stats.cells_total);
        assert_eq!(persistent_stats.roots_total, in_memory_stats.roots_total);

        for hash in alive_rows(&kv).keys() {
            assert_eq!(
                persistent.load_cell(hash).unwrap().as_ref(),
                in_memory.load_cell(hash).unwrap().as_ref()
            );
        }
    }

    assert_eq!(in_memory.get_stats().roots_total, 1);
    assert!(in_memory.load_root(trees[2].repr_hash()).is_ok());
    assert!(in_memory.load_cell(trees[0].repr_hash()).is_err());
}

#[test]
fn stats_survive_reopen() {
    let kv = MemoryKv::new();
    let mut db = SequentialCellDb::new(&kv, CellDbConfig::default()).unwrap();

    let tree = make_random_tree(11, 150);
    let leaf = make_cell(42, &[]);
    db.inc(&tree);
    db.inc(&leaf);
    db.commit(&kv).unwrap();

    let stats = db.get_stats();
    assert_eq!(stats.named["commits"], 1);
    assert_eq!(stats.roots_total, 2);

    let reopened = ConcurrentCellDb::new(&kv, CellDbConfig::default()).unwrap();
    let reopened_stats = reopened.get_stats();
    assert_eq!(reopened_stats.cells_total, stats.cells_total);
    assert_eq!(reopened_stats.roots_total, stats.roots_total);
    assert_eq!(reopened_stats.named["commits"], 0);
}

#[test]
fn cells_with_levels() {
    let kv = MemoryKv::new();
    let mut db = SequentialCellDb::new(&kv, CellDbConfig::default()).unwrap();

    let leaf = make_cell(7, &[]);
    let pruned = crate::merkle::make_pruned_branch(
        make_cell(8, &[&leaf]).as_ref(),
        0,
        Cell::empty_context(),
    )
    .unwrap();
    let root = make_cell(9, &[&leaf, &pruned]);

    db.inc(&root);
    db.commit(&kv).unwrap();

    let loaded = db.load_root(root.repr_hash()).unwrap();
    assert_eq!(loaded.level_mask(), root.level_mask());
    assert_eq!(loaded.hash(0), root.hash(0));
    assert_eq!(loaded.depth(0), root.depth(0));

    let loaded_pruned = loaded.reference(1).unwrap();
    assert_eq!(loaded_pruned.cell_type(), CellType::PrunedBranch);
    assert_eq!(loaded_pruned.repr_hash(), pruned.repr_hash());
}

#[cfg(feature = "serde")]
#[test]
fn config_from_json() {
    let config: CellDbConfig = serde_json::from_str(r#"{ "compress_depth": 3 }"#).unwrap();
    assert_eq!(config, CellDbConfig {
        compress_depth: 3,
        ..Default::default()
    });

    let json = serde_json::to_string(&CellDbConfig::default()).unwrap();
    let parsed: CellDbConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, CellDbConfig::default());
}

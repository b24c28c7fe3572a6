use super::*;
use crate::cell::EMPTY_CELL_HASH;
use crate::error::Error;
use crate::prelude::*;

const LEAF_COUNT: u32 = 16;

/// Builds a complete binary tree with one leaf per value.
///
/// Leaves contain `index: u32, value: u32`, inner nodes contain
/// `height: u8, first_index: u32`.
fn make_state(values: &[u32]) -> Cell {
    fn make_node(values: &[u32], start: u32, len: u32) -> Cell {
        let mut builder = CellBuilder::new();
        if len == 1 {
            builder.store_u32(start).unwrap();
            builder.store_u32(values[start as usize]).unwrap();
        } else {
            builder.store_u8(len.trailing_zeros() as u8).unwrap();
            builder.store_u32(start).unwrap();
            let half = len / 2;
            builder
                .store_reference(make_node(values, start, half))
                .unwrap();
            builder
                .store_reference(make_node(values, start + half, half))
                .unwrap();
        }
        builder.build().unwrap()
    }

    assert!(values.len().is_power_of_two());
    make_node(values, 0, values.len() as u32)
}

fn initial_values() -> Vec<u32> {
    (0..LEAF_COUNT).map(|i| i * 10).collect()
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

fn find_leaf(root: &DynCell, index: u32) -> &DynCell {
    let mut cell = root;
    while cell.reference_count() > 0 {
        let height = cell.as_slice().unwrap().load_u8().unwrap();
        let next = (index >> (height - 1)) & 1;
        cell = cell.reference(next as u8).unwrap();
    }
    cell
}

fn visit_all_cells(cell: &DynCell) -> ahash::HashSet<HashBytes> {
    let mut result = ahash::HashSet::default();
    let mut stack = vec![cell];
    while let Some(cell) = stack.pop() {
        if result.insert(*cell.repr_hash()) {
            stack.extend(cell.references());
        }
    }
    result
}

#[test]
fn correct_proof_store_load() {
    let proof = MerkleProof::default();
    let cell = CellBuilder::build_from(&proof).unwrap();

    let parsed = cell.as_ref().parse::<MerkleProof>().unwrap();
    assert_eq!(parsed, proof);
}

#[test]
fn test_proof() {
    let root = make_state(&initial_values());
    let target = find_leaf(root.as_ref(), 3);

    let merkle_proof = MerkleProof::create_for_cell(root.as_ref(), target.repr_hash())
        .build()
        .unwrap();
    assert_eq!(&merkle_proof.hash, root.repr_hash());
    assert_eq!(merkle_proof.depth, root.repr_depth());

    let virtual_root = merkle_proof.virtualize();
    println!("{}", virtual_root.display_tree());

    assert_eq!(root.as_ref().repr_hash(), virtual_root.repr_hash());
    assert_eq!(root.as_ref().repr_depth(), virtual_root.repr_depth());

    assert_eq!(read_leaf(virtual_root.as_ref(), 3), Ok(30));
    // Leaves are always included
    assert_eq!(read_leaf(virtual_root.as_ref(), 2), Ok(20));
    assert_eq!(
        read_leaf(virtual_root.as_ref(), 0),
        Err(Error::PrunedBranchAccess)
    );
    assert_eq!(
        read_leaf(virtual_root.as_ref(), 15),
        Err(Error::PrunedBranchAccess)
    );
}

#[test]
fn proof_for_unknown_cell() {
    let root = make_state(&initial_values());
    let unknown = HashBytes([0xaa; 32]);

    let res = MerkleProof::create_for_cell(root.as_ref(), &unknown).build();
    assert_eq!(res.unwrap_err(), Error::EmptyProof);
}

#[test]
#[cfg_attr(miri, ignore)] // takes too long to execute on miri
fn create_proof_for_deep_cell() {
    let mut cell = Cell::empty_cell();
    for i in 0..3000 {
        let mut builder = CellBuilder::new();
        builder.store_u32(i).unwrap();
        builder.store_reference(cell).unwrap();
        cell = builder.build().unwrap();
    }

    {
        let encoded = Boc::encode_base64(cell.as_ref());
        let decoded = Boc::decode_base64(encoded).unwrap();
        assert_eq!(decoded.as_ref(), cell.as_ref());
    }

    let proof = MerkleProof::create_for_cell(cell.as_ref(), EMPTY_CELL_HASH)
        .build()
        .unwrap();

    let encoded = Boc::encode_base64(CellBuilder::build_from(&proof).unwrap());
    let decoded = Boc::decode_base64(encoded)
        .unwrap()
        .as_ref()
        .parse::<MerkleProof>()
        .unwrap();

    assert_eq!(proof, decoded);
}

#[test]
fn create_proof_from_usage_tree() {
    let root = make_state(&initial_values());

    let usage_tree = UsageTree::new(UsageTreeMode::OnDataAccess);
    let tracked = usage_tree.track(&root);
    assert_eq!(read_leaf(tracked.as_ref(), 5), Ok(50));
    assert_eq!(read_leaf(tracked.as_ref(), 12), Ok(120));

    let merkle_proof = MerkleProof::create(tracked.as_ref(), &usage_tree)
        .build()
        .unwrap();

    let virtual_root = merkle_proof.virtualize();
    assert_eq!(virtual_root.repr_hash(), root.repr_hash());

    assert_eq!(read_leaf(virtual_root.as_ref(), 5), Ok(50));
    assert_eq!(read_leaf(virtual_root.as_ref(), 12), Ok(120));
    // Sibling leaves are not pruned
    assert_eq!(read_leaf(virtual_root.as_ref(), 4), Ok(40));
    assert_eq!(
        read_leaf(virtual_root.as_ref(), 6),
        Err(Error::PrunedBranchAccess)
    );
}

#[test]
fn proof_with_subtree() -> anyhow::Result<()> {
    let state = make_state(&initial_values());

    let some_other_cell = {
        let mut builder = CellBuilder::new();
        builder.store_u128(123123)?;
        builder.store_reference(Cell::empty_cell())?;
        builder.store_reference(Cell::empty_cell())?;
        builder.build()?
    };

    let root_cell = {
        let mut builder = CellBuilder::new();
        builder.store_u128(321321)?;
        builder.store_reference(some_other_cell)?;
        builder.store_reference(state.clone())?;
        builder.build()?
    };

    let mut usage_tree = UsageTree::new(UsageTreeMode::OnDataAccess).with_subtrees();
    let root_cell = usage_tree.track(&root_cell);

    {
        let mut root_cell = root_cell.as_ref().as_slice()?;
        root_cell.load_u32()?;

        assert!(usage_tree.add_subtree(state.as_ref()));
        assert!(!usage_tree.add_subtree(state.as_ref()));
    }

    let proof = MerkleProof::create(root_cell.as_ref(), usage_tree).build()?;
    let virtual_root = proof.virtualize();
    let mut virtual_cell = virtual_root.as_ref().as_slice()?;

    assert_eq!(virtual_cell.load_u64(), Ok(0));
    assert_eq!(virtual_cell.load_u64(), Ok(321321));

    let first_ref = virtual_cell.load_reference()?;
    assert_eq!(first_ref.cell_type(), CellType::PrunedBranch);
    assert_eq!(first_ref.as_slice().unwrap_err(), Error::PrunedBranchAccess);

    let second_ref = virtual_cell.load_reference()?;
    assert_eq!(second_ref.cell_type(), CellType::Ordinary);
    assert!(second_ref.descriptor().level_mask().is_empty());

    for i in 0..LEAF_COUNT {
        assert_eq!(read_leaf(second_ref, i)?, i * 10);
    }

    Ok(())
}

#[test]
fn closure_and_set_filters() {
    let root = make_state(&initial_values());
    let path = {
        let mut path = ahash::HashSet::default();
        let mut cell = root.as_ref();
        path.insert(*cell.repr_hash());
        while cell.reference_count() > 0 {
            cell = cell.reference(1).unwrap();
            path.insert(*cell.repr_hash());
        }
        path
    };

    let by_set = MerkleProof::create(root.as_ref(), &path).build().unwrap();
    let by_fn = MerkleProof::create(
        root.as_ref(),
        FilterFn(|hash: &HashBytes| {
            if path.contains(hash) {
                FilterAction::Include
            } else {
                FilterAction::Skip
            }
        }),
    )
    .build()
    .unwrap();
    assert_eq!(by_set, by_fn);

    let virtual_root = by_set.virtualize();
    assert_eq!(read_leaf(virtual_root.as_ref(), 15), Ok(150));
    assert_eq!(read_leaf(virtual_root.as_ref(), 14), Ok(140));
    assert_eq!(
        read_leaf(virtual_root.as_ref(), 0),
        Err(Error::PrunedBranchAccess)
    );

    // Skipping the root is not allowed for proofs
    let res = MerkleProof::create(root.as_ref(), FilterFn(|_: &HashBytes| FilterAction::Skip))
        .build();
    assert_eq!(res.unwrap_err(), Error::EmptyProof);
}

#[test]
fn virtualize_proof_cell() {
    let root = make_state(&initial_values());
    let target = find_leaf(root.as_ref(), 7);
    let proof = MerkleProof::create_for_cell(root.as_ref(), target.repr_hash())
        .build()
        .unwrap();

    let proof_cell = CellBuilder::build_from(&proof).unwrap();
    assert_eq!(proof_cell.cell_type(), CellType::MerkleProof);
    assert!(proof_cell.level_mask().is_empty());

    let virtual_root = MerkleProof::virtualize_cell(proof_cell.as_ref(), 1).unwrap();
    assert_eq!(virtual_root.repr_hash(), root.repr_hash());
    assert_eq!(read_leaf(virtual_root.as_ref(), 7), Ok(70));

    assert_eq!(
        MerkleProof::virtualize_cell(proof_cell.as_ref(), 0).unwrap_err(),
        Error::InvalidData
    );
    assert_eq!(
        MerkleProof::virtualize_cell(root.as_ref(), 1).unwrap_err(),
        Error::UnexpectedOrdinaryCell
    );
}

#[test]
fn combine_proofs() {
    let root = make_state(&initial_values());

    let make_proof = |index: u32| {
        let target = find_leaf(root.as_ref(), index);
        MerkleProof::create_for_cell(root.as_ref(), target.repr_hash())
            .build()
            .unwrap()
    };

    let left = make_proof(1);
    let right = make_proof(10);

    let combined = left.combine(&right).unwrap();
    let combined_fast = left.combine_fast(&right).unwrap();
    assert_eq!(combined, combined_fast);
    assert_eq!(combined, right.combine(&left).unwrap());

    let virtual_root = combined.virtualize();
    assert_eq!(virtual_root.repr_hash(), root.repr_hash());
    assert_eq!(read_leaf(virtual_root.as_ref(), 1), Ok(10));
    assert_eq!(read_leaf(virtual_root.as_ref(), 10), Ok(100));
    assert_eq!(
        read_leaf(virtual_root.as_ref(), 5),
        Err(Error::PrunedBranchAccess)
    );

    // Idempotence
    assert_eq!(left.combine(&left).unwrap(), left);
    assert_eq!(left.combine_fast(&left).unwrap(), left);
    assert_eq!(combined.combine(&left).unwrap(), combined);

    // Proofs of different trees
    let mut other_values = initial_values();
    other_values[0] = 1;
    let other_root = make_state(&other_values);
    let other = MerkleProof::create_for_cell(
        other_root.as_ref(),
        find_leaf(other_root.as_ref(), 1).repr_hash(),
    )
    .build()
    .unwrap();
    assert_eq!(left.combine(&other).unwrap_err(), Error::InvalidData);
    assert_eq!(left.combine_fast(&other).unwrap_err(), Error::InvalidData);
}

#[test]
fn combine_full_proof() {
    let root = make_state(&initial_values());
    let full = MerkleProof::create(root.as_ref(), visit_all_cells(root.as_ref()))
        .build()
        .unwrap();
    assert_eq!(full.cell.as_ref(), root.as_ref());

    let partial = MerkleProof::create_for_cell(
        root.as_ref(),
        find_leaf(root.as_ref(), 9).repr_hash(),
    )
    .build()
    .unwrap();

    assert_eq!(partial.combine(&full).unwrap(), full);
    assert_eq!(partial.combine_fast(&full).unwrap(), full);
}

#[cfg(feature = "serde")]
#[test]
fn parse_fixtures() {
    #[derive(serde::Deserialize)]
    struct Fixtures {
        merkle_proof: MerkleProof,
        merkle_update: MerkleUpdate,
    }

    let boc_merkle_proof = "te6ccgECBQEAARwACUYDcijLZ4hNbjcLQiThSx8fvxTaVufKbXsXRYbyiUZApXoADQEiccAJ2Y4sgpswmr6/odN0WmKosRtoIzobXRBE9uCeOA1nuXKSo06DG3E/cAAAdbacX3gRQHLHOx0TQAQCAdURYfZ8pYDdK5k1lnsEEJ4OmIYB/AiU4UX3zVZTToFyVwAAAYRmS/s2iLD7PlLAbpXMmss9gghPB0xDAP4ESnCi++arKadAuSuAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAACAsAMARaACLD7PlLAbpXMmss9gghPB0xDAP4ESnCi++arKadAuSuAQKEgBAYDWxHxKJVQ8mzl7cXFvP64eLF0kcXTFLiwZvYlkQrEFAAw=";
    let boc_merkle_update = "te6ccgECEAEAARwACooEmiQq0C+sMHHtQMrhM1KQs0bAR0to7UTxJ/BQaQGQ83mYWpNZrI3tjuzPRZkP0y+odW6SpuxZc6qHEJbPhzX/oAAFAAUIASEBwAIiA85AAwoiASAEDCIBIAUOAgEgBwYACQAAAAKgAAkAAAAAYCEBwAkiA85ACwooSAEBGK24YcgkheIaweTweCPOdGONsG1894aroQWmpQQGjHEAASIBIA0MKEgBAcoZQygrtOJrqvmwmN7NXJy91VsFFfgo/bXAJjbPwI+zAAIiASAPDihIAQGIedrQvLIQIcZHiObah2QWYzPcsgz02CKj0RfEEjv9NwABKEgBAf96V360Wpctur/NPJVfI6Mc5W43dmQzVmLGk0RxKb5RAAE=";

    let Fixtures {
        merkle_proof,
        merkle_update,
    } = serde_json::from_str(&format!(
        r#"{{"merkle_proof":"{boc_merkle_proof}","merkle_update":"{boc_merkle_update}"}}"#
    ))
    .unwrap();

    let cell = Boc::decode_base64(boc_merkle_proof).unwrap();
    let parsed = cell.parse::<MerkleProof>().unwrap();
    assert_eq!(parsed, merkle_proof);
    assert_eq!(merkle_proof.virtualize().repr_hash(), &merkle_proof.hash);

    let cell = Boc::decode_base64(boc_merkle_update).unwrap();
    let parsed = cell.parse::<MerkleUpdate>().unwrap();
    assert_eq!(parsed, merkle_update);
    assert_eq!(merkle_update.old.hash(0), &merkle_update.old_hash);
    assert_eq!(merkle_update.new.hash(0), &merkle_update.new_hash);
}

#[test]
fn correct_update_store_load() {
    let old = make_state(&initial_values());
    let mut values = initial_values();
    values[3] = 333;
    let new = make_state(&values);

    let update = MerkleUpdate::create(old.as_ref(), new.as_ref(), visit_all_cells(old.as_ref()))
        .build()
        .unwrap();

    let cell = CellBuilder::build_from(&update).unwrap();
    assert_eq!(cell.cell_type(), CellType::MerkleUpdate);

    let parsed = cell.as_ref().parse::<MerkleUpdate>().unwrap();
    assert_eq!(parsed, update);
    parsed.validate().unwrap();
}

#[test]
fn apply_update() {
    let old = make_state(&initial_values());
    let mut values = initial_values();
    values[0] = 1000;
    let new = make_state(&values);

    let update = MerkleUpdate::create(old.as_ref(), new.as_ref(), visit_all_cells(old.as_ref()))
        .build()
        .unwrap();
    assert_eq!(&update.old_hash, old.repr_hash());
    assert_eq!(&update.new_hash, new.repr_hash());

    update.validate().unwrap();
    update.may_apply(old.as_ref()).unwrap();
    assert_eq!(
        update.may_apply(new.as_ref()).unwrap_err(),
        Error::InvalidData
    );

    let applied = update.apply(&old).unwrap();
    assert_eq!(applied.as_ref(), new.as_ref());
    assert_eq!(read_leaf(applied.as_ref(), 0), Ok(1000));

    assert_eq!(update.apply(&new).unwrap_err(), Error::InvalidData);

    // One changed leaf, its sibling leaf and four inner nodes
    let stats = update.compute_stats();
    assert_eq!(
        stats,
        MerkleUpdateStats {
            new_cells: 6,
            new_bits: 4 * 40 + 2 * 64,
            old_cells: 3,
            old_bits: 3 * 40,
        }
    );
    assert_eq!(stats.cells_delta(), 3);
    assert_eq!(stats.bits_delta(), 168);
}

#[test]
fn apply_update_from_usage_tree() {
    let old = make_state(&initial_values());

    let usage_tree = UsageTree::new(UsageTreeMode::OnLoad);
    let tracked = usage_tree.track(&old);
    assert_eq!(read_leaf(tracked.as_ref(), 9), Ok(90));

    let mut values = initial_values();
    values[9] = 9;
    let new = make_state(&values);

    let update = MerkleUpdate::create(tracked.as_ref(), new.as_ref(), &usage_tree)
        .build()
        .unwrap();
    update.validate().unwrap();

    let applied = update.apply(&old).unwrap();
    assert_eq!(applied.repr_hash(), new.repr_hash());
}

#[test]
fn identity_update() {
    let state = make_state(&initial_values());
    let update = MerkleUpdate::create(state.as_ref(), state.as_ref(), visit_all_cells(state.as_ref()))
        .build()
        .unwrap();

    assert_eq!(update.old_hash, update.new_hash);
    update.validate().unwrap();
    assert_eq!(update.apply(&state).unwrap().as_ref(), state.as_ref());
    assert!(update
        .compute_removed_cells(state.as_ref())
        .unwrap()
        .is_empty());

    let stats = update.compute_stats();
    assert_eq!(stats.cells_delta(), 0);
    assert_eq!(stats.bits_delta(), 0);
}

#[test]
fn removed_cells() {
    let old = make_state(&initial_values());
    let mut values = initial_values();
    values[0] = 1000;
    let new = make_state(&values);

    let update = MerkleUpdate::create(old.as_ref(), new.as_ref(), visit_all_cells(old.as_ref()))
        .build()
        .unwrap();

    let removed = update.compute_removed_cells(old.as_ref()).unwrap();

    // The changed path and the direct children of its nodes
    assert_eq!(removed.len(), 9);
    assert!(removed.values().all(|&count| count == 1));
    assert!(removed.contains_key(find_leaf(old.as_ref(), 0).repr_hash()));
    assert!(removed.contains_key(old.repr_hash()));

    assert_eq!(
        update.compute_removed_cells(new.as_ref()).unwrap_err(),
        Error::InvalidData
    );

    // Everything is removed
    let empty = Cell::empty_cell();
    let update = MerkleUpdate::create(old.as_ref(), empty.as_ref(), visit_all_cells(old.as_ref()))
        .build()
        .unwrap();
    let removed = update.compute_removed_cells(old.as_ref()).unwrap();
    assert_eq!(removed.len(), visit_all_cells(old.as_ref()).len());
}

#[test]
fn combine_updates() {
    let a = make_state(&initial_values());

    let mut values = initial_values();
    values[0] = 1000;
    let b = make_state(&values);

    values[15] = 1500;
    let c = make_state(&values);

    let ab = MerkleUpdate::create(a.as_ref(), b.as_ref(), visit_all_cells(a.as_ref()))
        .build()
        .unwrap();
    let bc = MerkleUpdate::create(b.as_ref(), c.as_ref(), visit_all_cells(b.as_ref()))
        .build()
        .unwrap();

    let ac = ab.combine(&bc).unwrap();
    assert_eq!(&ac.old_hash, a.repr_hash());
    assert_eq!(&ac.new_hash, c.repr_hash());
    ac.validate().unwrap();

    let applied = ac.apply(&a).unwrap();
    assert_eq!(applied.as_ref(), c.as_ref());
    assert_eq!(read_leaf(applied.as_ref(), 0), Ok(1000));
    assert_eq!(read_leaf(applied.as_ref(), 15), Ok(1500));

    // Updates must be chained
    assert_eq!(ab.combine(&ab).unwrap_err(), Error::InvalidData);
    assert_eq!(bc.combine(&ab).unwrap_err(), Error::InvalidData);
}

#[test]
fn combine_with_identity_update() {
    let a = make_state(&initial_values());
    let mut values = initial_values();
    values[4] = 4;
    let b = make_state(&values);

    let ab = MerkleUpdate::create(a.as_ref(), b.as_ref(), visit_all_cells(a.as_ref()))
        .build()
        .unwrap();
    let bb = MerkleUpdate::create(b.as_ref(), b.as_ref(), visit_all_cells(b.as_ref()))
        .build()
        .unwrap();

    assert_eq!(ab.combine(&bb).unwrap(), ab);
}

use crate::cell::*;
use crate::error::Error;

/// Creates a pruned branch cell with the specified merkle depth.
///
/// The branch keeps one hash and one depth for each significant level
/// of the original cell and adds a new level at `merkle_depth`.
pub fn make_pruned_branch(
    cell: &DynCell,
    merkle_depth: u8,
    context: &dyn CellContext,
) -> Result<Cell, Error> {
    let descriptor = cell.descriptor();
    let original_mask = descriptor.level_mask();
    if merkle_depth >= LevelMask::MAX_LEVEL || original_mask.contains(merkle_depth + 1) {
        return Err(Error::InvalidCell);
    }

    let level_mask = LevelMask::new(original_mask.to_byte() | (1 << merkle_depth));

    let mut builder = CellBuilder::new();
    builder.set_exotic(true);

    ok!(builder.store_u8(CellType::PrunedBranch.to_byte()));
    ok!(builder.store_u8(level_mask.to_byte()));

    for level in 0..=LevelMask::MAX_LEVEL {
        if original_mask.contains(level) {
            ok!(builder.store_u256(cell.hash(level)));
        }
    }

    for level in 0..=LevelMask::MAX_LEVEL {
        if original_mask.contains(level) {
            ok!(builder.store_u16(cell.depth(level)));
        }
    }

    builder.build_ext(context)
}

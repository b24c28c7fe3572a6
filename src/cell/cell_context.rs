use sha2::digest::Digest;
use smallvec::SmallVec;

use crate::cell::cell_impl::{OrdinaryCell, PrunedBranch};
use crate::cell::{Cell, CellDescriptor, CellType, HashBytes, LevelMask, MAX_REF_COUNT};
use crate::error::Error;
use crate::util::unlikely;

/// Cell finalization hook.
pub trait CellContext: Send + Sync {
    /// Builds a new cell from cell parts.
    fn finalize_cell(&self, cell: CellParts<'_>) -> Result<Cell, Error>;
}

/// Context which just builds cells.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyCellContext;

impl CellContext for EmptyCellContext {
    fn finalize_cell(&self, cell: CellParts<'_>) -> Result<Cell, Error> {
        let hashes = ok!(cell.compute_hashes());
        if cell.descriptor.is_pruned_branch() {
            PrunedBranch::new(cell.descriptor, cell.bit_len, cell.data, hashes).map(Cell::new)
        } else {
            Ok(Cell::new(OrdinaryCell::new(
                cell.descriptor,
                cell.bit_len,
                cell.data,
                cell.references,
                hashes,
            )))
        }
    }
}

/// Partially assembled cell.
pub struct CellParts<'a> {
    /// Length of this cell's data in bits.
    pub bit_len: u16,

    /// Well-formed cell descriptor.
    pub descriptor: CellDescriptor,

    /// Bitwise OR of child level masks.
    pub children_mask: LevelMask,

    /// Array of child cells.
    ///
    /// NOTE: it is guaranteed that the length of the array is consistent
    /// with the descriptor.
    pub references: SmallVec<[Cell; MAX_REF_COUNT]>,

    /// Cell data slice (with a completion tag if the data is not aligned).
    pub data: &'a [u8],
}

impl CellParts<'_> {
    /// Validates cell and computes all hashes.
    ///
    /// Returns one `(hash, depth)` pair for each significant level,
    /// or exactly one pair (the representation hash) for pruned branches.
    pub fn compute_hashes(&self) -> Result<SmallVec<[(HashBytes, u16); 4]>, Error> {
        const HASH_BITS: usize = 256;
        const DEPTH_BITS: usize = 16;

        let mut descriptor = self.descriptor;
        let bit_len = self.bit_len as usize;
        let level_mask = descriptor.level_mask();
        let level = level_mask.level() as usize;

        let references = self.references.as_slice();
        if unlikely(references.len() != descriptor.reference_count() as usize) {
            return Err(Error::InvalidCell);
        }

        let (cell_type, computed_level_mask) = if unlikely(descriptor.is_exotic()) {
            let Some(&first_byte) = self.data.first() else {
                return Err(Error::InvalidCell);
            };

            match CellType::from_byte_exotic(first_byte) {
                // 8 bits type, 8 bits level mask, level x (hash, depth)
                Some(CellType::PrunedBranch) => {
                    if unlikely(level == 0) {
                        return Err(Error::InvalidCell);
                    }

                    let expected_bit_len = 8 + 8 + level * (HASH_BITS + DEPTH_BITS);
                    if unlikely(bit_len != expected_bit_len || !references.is_empty()) {
                        return Err(Error::InvalidCell);
                    }

                    let stored_mask = self.data.get(1).copied().unwrap_or_default();
                    if unlikely(level_mask != stored_mask) {
                        return Err(Error::InvalidCell);
                    }

                    (CellType::PrunedBranch, level_mask)
                }
                // 8 bits type, hash, depth
                Some(CellType::MerkleProof) => {
                    const EXPECTED_BIT_LEN: usize = 8 + HASH_BITS + DEPTH_BITS;
                    if unlikely(bit_len != EXPECTED_BIT_LEN || references.len() != 1) {
                        return Err(Error::InvalidCell);
                    }

                    (CellType::MerkleProof, self.children_mask.virtualize(1))
                }
                // 8 bits type, 2 x (hash, depth)
                Some(CellType::MerkleUpdate) => {
                    const EXPECTED_BIT_LEN: usize = 8 + 2 * (HASH_BITS + DEPTH_BITS);
                    if unlikely(bit_len != EXPECTED_BIT_LEN || references.len() != 2) {
                        return Err(Error::InvalidCell);
                    }

                    (CellType::MerkleUpdate, self.children_mask.virtualize(1))
                }
                // 8 bits type, hash
                Some(CellType::LibraryReference) => {
                    const EXPECTED_BIT_LEN: usize = 8 + HASH_BITS;
                    if unlikely(bit_len != EXPECTED_BIT_LEN || !references.is_empty()) {
                        return Err(Error::InvalidCell);
                    }

                    (CellType::LibraryReference, LevelMask::EMPTY)
                }
                _ => return Err(Error::InvalidCell),
            }
        } else {
            (CellType::Ordinary, self.children_mask)
        };

        if unlikely(computed_level_mask != level_mask) {
            return Err(Error::InvalidCell);
        }

        let level_offset = cell_type.is_merkle() as u8;
        let is_pruned = cell_type.is_pruned_branch();

        let mut hashes = SmallVec::<[(HashBytes, u16); 4]>::new();

        for level in 0..=LevelMask::MAX_LEVEL {
            // Skip insignificant hashes
            if !level_mask.contains(level) {
                continue;
            }
            // Pruned branches compute only the representation hash
            if is_pruned && level_mask.hash_index(level) != level_mask.level() {
                continue;
            }

            let mut hasher = sha2::Sha256::new();

            let level_mask = if is_pruned {
                level_mask
            } else {
                level_mask.apply(level)
            };

            descriptor.d1 &= !(CellDescriptor::LEVEL_MASK | CellDescriptor::STORE_HASHES_MASK);
            descriptor.d1 |= u8::from(level_mask) << 5;
            hasher.update([descriptor.d1, descriptor.d2]);

            match hashes.last() {
                None => hasher.update(self.data),
                Some((prev_hash, _)) => hasher.update(prev_hash.as_slice()),
            }

            let mut depth = 0;
            for child in references {
                let child_depth = child.as_ref().depth(level + level_offset);
                let next_depth = match child_depth.checked_add(1) {
                    Some(next_depth) => next_depth,
                    None => return Err(Error::DepthOverflow),
                };
                depth = std::cmp::max(depth, next_depth);

                hasher.update(child_depth.to_be_bytes());
            }

            for child in references {
                let child_hash = child.as_ref().hash(level + level_offset);
                hasher.update(child_hash.as_slice());
            }

            hashes.push((hasher.finalize().into(), depth));
        }

        debug_assert_eq!(hashes.len(), self.descriptor.hash_count() as usize);
        Ok(hashes)
    }
}

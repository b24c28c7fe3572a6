use std::sync::OnceLock;

use smallvec::SmallVec;

use crate::cell::{
    Cell, CellDescriptor, CellImpl, DynCell, HashBytes, LevelMask, EMPTY_CELL_HASH, MAX_REF_COUNT,
};
use crate::error::Error;

/// Fully materialized cell which owns its data and children.
///
/// Used for all cell types except pruned branches.
pub(crate) struct OrdinaryCell {
    descriptor: CellDescriptor,
    bit_len: u16,
    data: Box<[u8]>,
    references: SmallVec<[Cell; MAX_REF_COUNT]>,
    hashes: SmallVec<[(HashBytes, u16); 4]>,
}

impl OrdinaryCell {
    pub(crate) fn new(
        descriptor: CellDescriptor,
        bit_len: u16,
        data: &[u8],
        references: SmallVec<[Cell; MAX_REF_COUNT]>,
        hashes: SmallVec<[(HashBytes, u16); 4]>,
    ) -> Self {
        Self {
            descriptor,
            bit_len,
            data: Box::from(data),
            references,
            hashes,
        }
    }

    pub(crate) fn empty() -> Self {
        let mut hashes = SmallVec::new();
        hashes.push((*EMPTY_CELL_HASH, 0));
        Self {
            descriptor: CellDescriptor::new([0, 0]),
            bit_len: 0,
            data: Box::default(),
            references: SmallVec::new(),
            hashes,
        }
    }

    #[inline]
    fn hash_entry(&self, level: u8) -> &(HashBytes, u16) {
        let index = self.descriptor.level_mask().hash_index(level) as usize;
        // NOTE: `hashes` is never empty
        &self.hashes[std::cmp::min(index, self.hashes.len() - 1)]
    }
}

impl CellImpl for OrdinaryCell {
    fn descriptor(&self) -> CellDescriptor {
        self.descriptor
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn bit_len(&self) -> u16 {
        self.bit_len
    }

    fn reference(&self, index: u8) -> Option<&DynCell> {
        Some(self.references.get(index as usize)?.as_ref())
    }

    fn reference_cloned(&self, index: u8) -> Option<Cell> {
        self.references.get(index as usize).cloned()
    }

    fn untracked(&self) -> &DynCell {
        self
    }

    fn hash(&self, level: u8) -> &HashBytes {
        &self.hash_entry(level).0
    }

    fn depth(&self, level: u8) -> u16 {
        self.hash_entry(level).1
    }
}

/// Exotic cell which replaces a subtree with its hashes.
pub(crate) struct PrunedBranch {
    descriptor: CellDescriptor,
    bit_len: u16,
    data: Box<[u8]>,
    /// Stored hashes followed by the representation hash.
    hashes: SmallVec<[(HashBytes, u16); 4]>,
}

impl PrunedBranch {
    /// Wraps validated pruned branch data with the computed representation hash.
    pub(crate) fn new(
        descriptor: CellDescriptor,
        bit_len: u16,
        data: &[u8],
        computed: SmallVec<[(HashBytes, u16); 4]>,
    ) -> Result<Self, Error> {
        let level = descriptor.level_mask().level() as usize;
        let Some(repr) = computed.last() else {
            return Err(Error::InvalidCell);
        };

        let hashes_offset = 2;
        let depths_offset = hashes_offset + level * 32;
        if data.len() < depths_offset + level * 2 {
            return Err(Error::InvalidCell);
        }

        let mut hashes = SmallVec::with_capacity(level + 1);
        for i in 0..level {
            let hash_offset = hashes_offset + i * 32;
            let depth_offset = depths_offset + i * 2;
            let hash = HashBytes::from_slice(&data[hash_offset..hash_offset + 32]);
            let depth = u16::from_be_bytes([data[depth_offset], data[depth_offset + 1]]);
            hashes.push((hash, depth));
        }
        hashes.push(*repr);

        Ok(Self {
            descriptor,
            bit_len,
            data: Box::from(data),
            hashes,
        })
    }
}

impl CellImpl for PrunedBranch {
    fn descriptor(&self) -> CellDescriptor {
        self.descriptor
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn bit_len(&self) -> u16 {
        self.bit_len
    }

    fn reference(&self, _: u8) -> Option<&DynCell> {
        None
    }

    fn reference_cloned(&self, _: u8) -> Option<Cell> {
        None
    }

    fn untracked(&self) -> &DynCell {
        self
    }

    fn hash(&self, level: u8) -> &HashBytes {
        let index = self.descriptor.level_mask().hash_index(level) as usize;
        &self.hashes[std::cmp::min(index, self.hashes.len() - 1)].0
    }

    fn depth(&self, level: u8) -> u16 {
        let index = self.descriptor.level_mask().hash_index(level) as usize;
        self.hashes[std::cmp::min(index, self.hashes.len() - 1)].1
    }
}

/// A view of a cell with hashes capped at the specified level.
///
/// Children are virtualized lazily at the same level,
/// or at the next one below Merkle cells.
pub struct VirtualCell {
    cell: Cell,
    level: u8,
    children: [OnceLock<Cell>; MAX_REF_COUNT],
}

impl VirtualCell {
    /// Wraps the cell.
    pub fn new(cell: Cell, level: u8) -> Self {
        Self {
            cell,
            level,
            children: Default::default(),
        }
    }

    /// Returns the virtualization level.
    #[inline]
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Returns the wrapped cell.
    #[inline]
    pub fn inner(&self) -> &Cell {
        &self.cell
    }

    fn virtual_child(&self, index: u8) -> Option<&Cell> {
        let slot = self.children.get(index as usize)?;
        if let Some(child) = slot.get() {
            return Some(child);
        }

        let child = self.cell.as_ref().reference_cloned(index)?;
        let level = self.level + self.cell.as_ref().descriptor().is_merkle() as u8;
        Some(slot.get_or_init(|| child.virtualize(level)))
    }
}

impl CellImpl for VirtualCell {
    fn descriptor(&self) -> CellDescriptor {
        self.cell.as_ref().descriptor().virtualize(self.level)
    }

    fn data(&self) -> &[u8] {
        self.cell.as_ref().data()
    }

    fn bit_len(&self) -> u16 {
        self.cell.as_ref().bit_len()
    }

    fn reference(&self, index: u8) -> Option<&DynCell> {
        Some(self.virtual_child(index)?.as_ref())
    }

    fn reference_cloned(&self, index: u8) -> Option<Cell> {
        self.virtual_child(index).cloned()
    }

    fn untracked(&self) -> &DynCell {
        self
    }

    fn hash(&self, level: u8) -> &HashBytes {
        self.cell.as_ref().hash(std::cmp::min(level, self.level))
    }

    fn depth(&self, level: u8) -> u16 {
        self.cell.as_ref().depth(std::cmp::min(level, self.level))
    }
}

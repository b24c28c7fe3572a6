use super::{BocMode, BocTag};
use crate::cell::{CellDescriptor, DynCell, HashBytes, LevelMask};
use crate::util::number_of_bytes_to_fit;

/// Preparsed BOC header.
///
/// Cells are collected with a post-order DFS from each root and are
/// deduplicated by representation hash. Each cell gets a reversed index
/// which is strictly greater than the reversed indices of its children.
pub struct BocHeader<'a> {
    root_rev_indices: Vec<u32>,
    rev_indices: ahash::HashMap<&'a HashBytes, u32>,
    rev_cells: Vec<&'a DynCell>,
    should_cache: Vec<bool>,
    is_root: Vec<bool>,
    total_data_size: u64,
    reference_count: u64,
    cell_count: u32,
    mode: BocMode,
    tag: BocTag,
}

impl<'a> BocHeader<'a> {
    /// Creates an encoder with a single root.
    pub fn with_root(root: &'a DynCell) -> Self {
        let mut res = Self {
            root_rev_indices: Default::default(),
            rev_indices: Default::default(),
            rev_cells: Default::default(),
            should_cache: Default::default(),
            is_root: Default::default(),
            total_data_size: 0,
            reference_count: 0,
            cell_count: 0,
            mode: BocMode::empty(),
            tag: BocTag::Generic,
        };
        res.add_root(root);
        res
    }

    /// Adds an additional root to the bag.
    pub fn add_root(&mut self, root: &'a DynCell) {
        let root_rev_index = self.fill(root);
        self.is_root[root_rev_index as usize] = true;
        self.root_rev_indices.push(root_rev_index);
    }

    /// Sets serialization flags.
    #[inline]
    pub fn with_mode(mut self, mode: BocMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the magic number of the bag.
    ///
    /// Legacy tags require a single root and a cells index.
    #[inline]
    pub fn with_tag(mut self, tag: BocTag) -> Self {
        self.tag = tag;
        self
    }

    /// Toggles the trailing CRC32C checksum.
    #[inline]
    pub fn with_crc(mut self, include_crc: bool) -> Self {
        self.mode.set(BocMode::WITH_CRC32C, include_crc);
        self
    }

    /// Returns the number of unique cells.
    #[inline]
    pub fn cell_count(&self) -> u32 {
        self.cell_count
    }

    /// Returns the number of roots.
    #[inline]
    pub fn root_count(&self) -> usize {
        self.root_rev_indices.len()
    }

    /// Validates the combination of the tag and flags.
    pub fn check_mode(&self) -> Result<(), Error> {
        let mode = self.mode;
        if mode.contains(BocMode::WITH_CACHE_BITS) && !mode.contains(BocMode::WITH_INDEX) {
            return Err(Error::CacheBitsWithoutIndex);
        }

        match self.tag {
            BocTag::Generic => Ok(()),
            BocTag::Indexed | BocTag::IndexedCrc32 => {
                if self.root_rev_indices.len() != 1 {
                    return Err(Error::MultipleRootsNotSupported);
                }
                let expects_crc = self.tag == BocTag::IndexedCrc32;
                if !mode.contains(BocMode::WITH_INDEX)
                    || mode.contains(BocMode::WITH_CACHE_BITS)
                    || mode.contains(BocMode::WITH_CRC32C) != expects_crc
                {
                    return Err(Error::UnsupportedLegacyMode);
                }
                Ok(())
            }
        }
    }

    /// Writes the bag into the target buffer.
    pub fn encode(self, target: &mut Vec<u8>) -> Result<(), Error> {
        ok!(self.check_mode());
        self.encode_unchecked(target);
        Ok(())
    }

    /// Writes the bag into the target buffer without validating the mode.
    pub(crate) fn encode_unchecked(self, target: &mut Vec<u8>) {
        let mode = self.mode;
        let root_count = self.root_rev_indices.len();
        let cell_count = self.cell_count;

        let has_index = mode.contains(BocMode::WITH_INDEX);
        let has_crc = mode.contains(BocMode::WITH_CRC32C);
        let has_cache_bits = mode.contains(BocMode::WITH_CACHE_BITS);

        let ref_size = number_of_bytes_to_fit(cell_count as u64);

        // Count inline hashes
        let mut hashes_size = 0u64;
        for (rev_index, cell) in self.rev_cells.iter().enumerate() {
            if self.stores_hashes(rev_index, cell.descriptor()) {
                hashes_size += cell.descriptor().hash_count() as u64 * (32 + 2);
            }
        }

        let total_cells_size: u64 = self.total_data_size
            + (cell_count as u64 * 2) // all descriptor bytes
            + (ref_size as u64 * self.reference_count)
            + hashes_size;
        let max_offset = if has_cache_bits {
            total_cells_size << 1
        } else {
            total_cells_size
        };
        let offset_size = number_of_bytes_to_fit(max_offset);

        debug_assert!((1..=4).contains(&ref_size));
        debug_assert!((1..=8).contains(&offset_size));

        let flags = match self.tag {
            BocTag::Generic => {
                (ref_size as u8)
                    | (u8::from(has_index) * 0b1000_0000)
                    | (u8::from(has_crc) * 0b0100_0000)
                    | (u8::from(has_cache_bits) * 0b0010_0000)
            }
            BocTag::Indexed | BocTag::IndexedCrc32 => ref_size as u8,
        };
        let has_root_list = self.tag.supports_multiple_roots();

        // 4 bytes - BOC tag
        // 1 byte - flags
        // 1 byte - offset size
        // {ref_size} - cell count
        // {ref_size} - root count
        // {ref_size} - absent cell count
        // {offset_size} - total cells size
        // root_count * {ref_size} - root indices
        // has_index * cell_count * {offset_size} - cells index
        // {total_cells_size} - cells
        // has_crc * 4 - optional CRC32
        let total_size = 4
            + 2
            + (ref_size as u64) * (3 + has_root_list as u64 * root_count as u64)
            + (offset_size as u64)
            + has_index as u64 * cell_count as u64 * offset_size as u64
            + total_cells_size
            + u64::from(has_crc) * 4;
        target.reserve(total_size as usize);

        let start = target.len();

        target.extend_from_slice(&self.tag.to_bytes());
        target.extend_from_slice(&[flags, offset_size as u8]);
        target.extend_from_slice(&cell_count.to_be_bytes()[4 - ref_size..]);
        target.extend_from_slice(&(root_count as u32).to_be_bytes()[4 - ref_size..]);
        target.extend_from_slice(&[0; 4][4 - ref_size..]);
        target.extend_from_slice(&total_cells_size.to_be_bytes()[8 - offset_size..]);

        if has_root_list {
            for rev_index in &self.root_rev_indices {
                let root_index = cell_count - rev_index - 1;
                target.extend_from_slice(&root_index.to_be_bytes()[4 - ref_size..]);
            }
        }

        if has_index {
            let mut offset = 0u64;
            for (rev_index, cell) in self.rev_cells.iter().enumerate().rev() {
                let descriptor = cell.descriptor();
                offset += 2 + descriptor.byte_len() as u64;
                offset += descriptor.reference_count() as u64 * ref_size as u64;
                if self.stores_hashes(rev_index, descriptor) {
                    offset += descriptor.hash_count() as u64 * (32 + 2);
                }

                let entry = if has_cache_bits {
                    (offset << 1) | self.should_cache[rev_index] as u64
                } else {
                    offset
                };
                target.extend_from_slice(&entry.to_be_bytes()[8 - offset_size..]);
            }
        }

        for (rev_index, cell) in self.rev_cells.iter().enumerate().rev() {
            let descriptor = cell.descriptor();
            let store_hashes = self.stores_hashes(rev_index, descriptor);

            let mut d1 = descriptor.d1 & !CellDescriptor::STORE_HASHES_MASK;
            if store_hashes {
                d1 |= CellDescriptor::STORE_HASHES_MASK;
            }
            target.extend_from_slice(&[d1, descriptor.d2]);

            if store_hashes {
                write_hashes(*cell, descriptor.level_mask(), target);
            }

            target.extend_from_slice(cell.data());
            for child in cell.references() {
                match self.rev_indices.get(child.repr_hash()) {
                    Some(rev_index) => {
                        let index = cell_count - *rev_index - 1;
                        target.extend_from_slice(&index.to_be_bytes()[4 - ref_size..]);
                    }
                    None => debug_assert!(false, "child not found"),
                }
            }
        }

        if has_crc {
            let crc = crc32c::crc32c(&target[start..]);
            target.extend_from_slice(&crc.to_le_bytes());
        }

        debug_assert_eq!((target.len() - start) as u64, total_size);
    }

    fn stores_hashes(&self, rev_index: usize, descriptor: CellDescriptor) -> bool {
        if descriptor.is_pruned_branch() {
            return false;
        }
        if self.is_root[rev_index] && self.mode.contains(BocMode::WITH_TOP_HASH) {
            return true;
        }
        self.mode.contains(BocMode::WITH_INT_HASHES)
    }

    fn fill(&mut self, root: &'a DynCell) -> u32 {
        if let Some(index) = self.rev_indices.get(root.repr_hash()) {
            self.should_cache[*index as usize] = true;
            return *index;
        }

        let mut stack = vec![root.references()];
        while let Some(iter) = stack.last_mut() {
            match iter.next() {
                Some(child) => match self.rev_indices.get(child.repr_hash()) {
                    Some(index) => self.should_cache[*index as usize] = true,
                    None => stack.push(child.references()),
                },
                None => {
                    let cell = iter.cell();
                    stack.pop();
                    self.push_cell(cell);
                }
            }
        }

        self.cell_count - 1
    }

    fn push_cell(&mut self, cell: &'a DynCell) {
        self.rev_indices.insert(cell.repr_hash(), self.cell_count);
        self.rev_cells.push(cell);
        self.should_cache.push(false);
        self.is_root.push(false);

        let descriptor = cell.descriptor();
        self.total_data_size += descriptor.byte_len() as u64;
        self.reference_count += descriptor.reference_count() as u64;
        self.cell_count += 1;
    }
}

pub(crate) fn write_hashes(cell: &DynCell, mask: LevelMask, target: &mut Vec<u8>) {
    for level in 0..=LevelMask::MAX_LEVEL {
        if mask.contains(level) {
            target.extend_from_slice(cell.hash(level).as_slice());
        }
    }
    for level in 0..=LevelMask::MAX_LEVEL {
        if mask.contains(level) {
            target.extend_from_slice(&cell.depth(level).to_be_bytes());
        }
    }
}

/// Error type for BOC encoding related errors.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// Cache bits are stored in the cells index.
    #[error("cache bits require a cells index")]
    CacheBitsWithoutIndex,
    /// Legacy tags can only contain one root.
    #[error("multiple roots are not supported by this tag")]
    MultipleRootsNotSupported,
    /// Legacy tags have a fixed set of flags.
    #[error("flags are not compatible with the legacy tag")]
    UnsupportedLegacyMode,
    /// There is nothing to encode.
    #[error("no root cells")]
    NoRoots,
}

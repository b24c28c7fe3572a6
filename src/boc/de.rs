use smallvec::SmallVec;

use super::{BocMode, BocTag};
use crate::cell::{
    Cell, CellContext, CellDescriptor, CellParts, DynCell, LevelMask, MAX_REF_COUNT,
};
use crate::util::{read_be_uint, unlikely};

/// BOC deserialization options.
#[derive(Debug, Default, Clone)]
pub struct Options {
    /// The minimum allowed root count.
    pub min_roots: Option<usize>,
    /// The maximum allowed root count.
    pub max_roots: Option<usize>,
    /// Whether the input can continue after the end of the bag.
    ///
    /// Use [`BocHeader::total_size`] to split such inputs.
    pub allow_trailing_bytes: bool,
}

impl Options {
    /// Constructs decoder options to expect exactly the specified number of roots.
    pub const fn exact(number: usize) -> Self {
        Self {
            min_roots: Some(number),
            max_roots: Some(number),
            allow_trailing_bytes: false,
        }
    }
}

/// Fixed part of the BOC header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawHeader {
    pub tag: BocTag,
    pub has_index: bool,
    pub has_crc: bool,
    pub has_cache_bits: bool,
    pub ref_size: usize,
    pub offset_size: usize,
    pub cell_count: usize,
    pub root_count: usize,
    pub total_cells_size: u64,
    /// Offset of the root list.
    pub header_len: usize,
}

impl RawHeader {
    /// Parses the fixed part of the header.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let mut reader = BocReader::new(data);

        // 4 bytes - tag
        // 1 byte - flags
        // 1 byte - offset size
        let tag = ok!(reader.read_bytes(4));
        let tag = match BocTag::from_bytes([tag[0], tag[1], tag[2], tag[3]]) {
            Some(tag) => tag,
            None => return Err(Error::UnknownBocTag),
        };
        let [flags, offset_size] = match ok!(reader.read_bytes(2)) {
            &[flags, offset_size] => [flags, offset_size],
            _ => return Err(Error::InvalidHeader),
        };

        let has_index;
        let has_crc;
        let has_cache_bits;
        let ref_size;
        match tag {
            BocTag::Indexed => {
                has_index = true;
                has_crc = false;
                has_cache_bits = false;
                ref_size = flags as usize;
            }
            BocTag::IndexedCrc32 => {
                has_index = true;
                has_crc = true;
                has_cache_bits = false;
                ref_size = flags as usize;
            }
            BocTag::Generic => {
                if unlikely(flags & 0b0001_1000 != 0) {
                    return Err(Error::InvalidHeader);
                }
                has_index = flags & 0b1000_0000 != 0;
                has_crc = flags & 0b0100_0000 != 0;
                has_cache_bits = flags & 0b0010_0000 != 0;
                ref_size = (flags & 0b0000_0111) as usize;
            }
        }

        if unlikely(has_cache_bits && !has_index) {
            return Err(Error::InvalidHeader);
        }
        if unlikely(ref_size == 0 || ref_size > std::mem::size_of::<u32>()) {
            return Err(Error::InvalidRefSize);
        }

        let offset_size = offset_size as usize;
        if unlikely(offset_size == 0 || offset_size > std::mem::size_of::<u64>()) {
            return Err(Error::InvalidOffsetSize);
        }

        // {ref_size} bytes - cell count
        // {ref_size} bytes - root count
        // {ref_size} bytes - absent cell count
        // {offset_size} bytes - total cells size
        let cell_count = ok!(reader.read_be_uint(ref_size)) as usize;
        let root_count = ok!(reader.read_be_uint(ref_size)) as usize;
        let absent_count = ok!(reader.read_be_uint(ref_size)) as usize;
        let total_cells_size = ok!(reader.read_be_uint(offset_size));

        if unlikely(root_count == 0) {
            return Err(Error::RootCellNotFound);
        }
        if unlikely(!tag.supports_multiple_roots() && root_count > 1) {
            return Err(Error::UnexpectedMultipleRoots);
        }
        if unlikely(root_count.saturating_add(absent_count) > cell_count) {
            return Err(Error::TooManyRootCells);
        }
        if unlikely(absent_count > 0) {
            return Err(Error::AbsentCellsNotSupported);
        }

        const MIN_CELL_SIZE: u64 = 2; // [d1, d2]

        // NOTE: `cell_count` fits into `u32`, so none of these overflow
        let min_total_cell_size = (cell_count as u64) * (MIN_CELL_SIZE + ref_size as u64)
            - (root_count * ref_size) as u64;
        if unlikely(total_cells_size < min_total_cell_size) {
            return Err(Error::InvalidTotalSize);
        }

        // 2 bytes - descriptor
        // 4 * (2 + 32) - inline hashes and depths if presented
        // 128 - max data length
        // 4*{ref_size} - max references
        let max_cell_size = 2 + 4 * (2 + 32) + 128 + (MAX_REF_COUNT as u64) * ref_size as u64;
        if unlikely(total_cells_size > (cell_count as u64) * max_cell_size) {
            return Err(Error::InvalidTotalSize);
        }

        Ok(Self {
            tag,
            has_index,
            has_crc,
            has_cache_bits,
            ref_size,
            offset_size,
            cell_count,
            root_count,
            total_cells_size,
            header_len: reader.offset,
        })
    }

    /// Checks the number of roots against the decoder options.
    pub fn check_roots(&self, options: &Options) -> Result<(), Error> {
        if let Some(min_roots) = options.min_roots {
            if unlikely(self.root_count < min_roots) {
                return Err(Error::TooFewRootCells);
            }
        }
        if unlikely(self.root_count > options.max_roots.unwrap_or(MAX_ROOTS)) {
            return Err(Error::TooManyRootCells);
        }
        Ok(())
    }

    /// Size of the root list in bytes. Legacy tags have none.
    pub fn roots_len(&self) -> usize {
        if self.tag.supports_multiple_roots() {
            self.root_count * self.ref_size
        } else {
            0
        }
    }

    /// Offset of the cells index.
    pub fn index_offset(&self) -> usize {
        self.header_len + self.roots_len()
    }

    /// Offset of the first cell record.
    pub fn cells_offset(&self) -> usize {
        self.index_offset() + self.has_index as usize * self.cell_count * self.offset_size
    }

    /// Total size of the bag in bytes.
    pub fn total_size(&self) -> u64 {
        self.cells_offset() as u64 + self.total_cells_size + self.has_crc as u64 * 4
    }

    /// Reads root indices.
    pub fn read_roots(&self, data: &[u8]) -> Result<SmallVec<[u32; ROOTS_ON_STACK]>, Error> {
        let mut roots = SmallVec::with_capacity(self.root_count);
        if !self.tag.supports_multiple_roots() {
            roots.push(0);
            return Ok(roots);
        }

        let mut reader = BocReader::with_offset(data, self.header_len);
        for _ in 0..self.root_count {
            let root_index = ok!(reader.read_be_uint(self.ref_size));
            if unlikely(root_index >= self.cell_count as u64) {
                return Err(Error::RootOutOfBounds);
            }
            roots.push(root_index as u32);
        }
        Ok(roots)
    }

    /// Verifies the trailing checksum.
    ///
    /// NOTE: `data` must contain the whole bag.
    pub fn check_crc(&self, data: &[u8]) -> Result<(), Error> {
        if !self.has_crc {
            return Ok(());
        }

        let crc_offset = self.cells_offset() + self.total_cells_size as usize;
        let mut reader = BocReader::with_offset(data, crc_offset);
        let stored = ok!(reader.read_bytes(4));
        let stored = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);

        if crc32c::crc32c(&data[..crc_offset]) != stored {
            return Err(Error::InvalidChecksum);
        }
        Ok(())
    }

    /// Converts the header flags into encoder flags.
    ///
    /// Hash flags are not a part of the header and are
    /// derived from which cells store their hashes.
    pub fn mode(&self, roots_store_hashes: bool, others_store_hashes: bool) -> BocMode {
        let mut mode = BocMode::empty();
        mode.set(BocMode::WITH_INDEX, self.has_index);
        mode.set(BocMode::WITH_CRC32C, self.has_crc);
        mode.set(BocMode::WITH_CACHE_BITS, self.has_cache_bits);
        if others_store_hashes {
            mode |= BocMode::WITH_INT_HASHES;
        } else if roots_store_hashes {
            mode |= BocMode::WITH_TOP_HASH;
        }
        mode
    }

    /// Reads the cells index entry as an end offset relative to the first cell.
    pub fn read_index_entry(&self, data: &[u8], index: usize) -> Result<u64, Error> {
        let entry_offset = self.index_offset() + index * self.offset_size;
        let mut reader = BocReader::with_offset(data, entry_offset);
        let mut entry = ok!(reader.read_be_uint(self.offset_size));
        if self.has_cache_bits {
            entry >>= 1;
        }
        Ok(entry)
    }
}

/// Parsed BOC header.
pub struct BocHeader<'a> {
    header: RawHeader,
    mode: BocMode,
    cells: SmallVec<[&'a [u8]; CELLS_ON_STACK]>,
    roots: SmallVec<[u32; ROOTS_ON_STACK]>,
}

impl<'a> BocHeader<'a> {
    /// Computes the full size of the bag from its prefix.
    ///
    /// Returns [`Error::NeedMoreBytes`] if the prefix does not contain
    /// the whole fixed part of the header.
    pub fn total_size(prefix: &[u8]) -> Result<u64, Error> {
        RawHeader::parse(prefix).map(|header| header.total_size())
    }

    /// Decodes boc info from the specified bytes.
    pub fn decode(data: &'a [u8], options: &Options) -> Result<Self, Error> {
        let header = ok!(RawHeader::parse(data));
        ok!(header.check_roots(options));

        let total_size = header.total_size();
        if unlikely((data.len() as u64) < total_size) {
            return Err(Error::NeedMoreBytes((total_size - data.len() as u64) as usize));
        }
        if unlikely((data.len() as u64) > total_size && !options.allow_trailing_bytes) {
            return Err(Error::TrailingBytes);
        }

        ok!(header.check_crc(data));
        let roots = ok!(header.read_roots(data));

        let cells_offset = header.cells_offset();
        let cells_end = cells_offset + header.total_cells_size as usize;
        let cells_data = &data[..cells_end];

        let mut cells = SmallVec::new();
        if cells.try_reserve_exact(header.cell_count).is_err() {
            return Err(Error::InvalidTotalSize);
        }

        let mut roots_store_hashes = false;
        let mut others_store_hashes = false;

        let mut offset = cells_offset;
        for index in 0..header.cell_count {
            let record = match read_cell_record(cells_data, offset, header.ref_size) {
                Ok(record) => record,
                Err(Error::NeedMoreBytes(_)) => return Err(Error::InvalidTotalSize),
                Err(e) => return Err(e),
            };

            if !record.hashes.is_empty() {
                if roots.contains(&(index as u32)) {
                    roots_store_hashes = true;
                } else {
                    others_store_hashes = true;
                }
            }

            cells.push(&cells_data[offset..offset + record.len]);
            offset += record.len;

            if header.has_index {
                let entry = ok!(header.read_index_entry(data, index));
                if unlikely(entry != (offset - cells_offset) as u64) {
                    return Err(Error::InvalidIndex);
                }
            }
        }

        // Check that `total_cells_size` is correct
        if offset != cells_end {
            return Err(Error::InvalidTotalSize);
        }

        let mode = header.mode(roots_store_hashes, others_store_hashes);

        Ok(Self {
            header,
            mode,
            cells,
            roots,
        })
    }

    /// Assembles cell tree from slices using the specified context.
    pub fn finalize(&self, context: &dyn CellContext) -> Result<ProcessedCells, Error> {
        let ref_size = self.header.ref_size;
        let cell_count = self.cells.len();

        let mut res = Vec::<Cell>::new();
        if res.try_reserve_exact(cell_count).is_err() {
            return Err(Error::InvalidTotalSize);
        }

        for (index, raw) in self.cells.iter().enumerate().rev() {
            let record = ok!(read_cell_record(raw, 0, ref_size));

            let mut references = SmallVec::<[Cell; MAX_REF_COUNT]>::new();
            let mut children_mask = LevelMask::EMPTY;
            for chunk in record.references.chunks_exact(ref_size) {
                let child_index = read_be_uint(chunk) as usize;
                if unlikely(child_index >= cell_count) {
                    return Err(Error::InvalidRef);
                }
                if unlikely(child_index <= index) {
                    return Err(Error::InvalidRefOrder);
                }

                let child = res[cell_count - child_index - 1].clone();
                children_mask |= child.as_ref().level_mask();
                references.push(child);
            }

            let cell = ok!(record.finalize(children_mask, references, context));
            res.push(cell);
        }

        Ok(ProcessedCells(res))
    }

    /// Returns the root with the specified index.
    pub fn root(&self, index: usize, cells: &ProcessedCells) -> Option<Cell> {
        cells.get(*self.roots.get(index)?)
    }

    /// Magic number of the bag.
    pub fn tag(&self) -> BocTag {
        self.header.tag
    }

    /// Flags which reproduce this bag when encoding.
    pub fn mode(&self) -> BocMode {
        self.mode
    }

    /// Cell index size in bytes. Guaranteed to be 4 at max.
    pub fn ref_size(&self) -> usize {
        self.header.ref_size
    }

    /// Slices of the unique cells.
    pub fn cells(&self) -> &[&'a [u8]] {
        &self.cells
    }

    /// Root indices.
    pub fn roots(&self) -> &[u32] {
        &self.roots
    }
}

/// Array of processed cells.
pub struct ProcessedCells(Vec<Cell>);

impl ProcessedCells {
    /// Returns a processed cell by index.
    pub fn get(&self, index: u32) -> Option<Cell> {
        let index = self.0.len().checked_sub(index as usize + 1)?;
        self.0.get(index).cloned()
    }
}

/// Serialized cell: descriptor, optional hashes, data and child references.
pub(crate) struct CellRecord<'a> {
    pub descriptor: CellDescriptor,
    /// Inline hashes followed by inline depths.
    pub hashes: &'a [u8],
    pub data: &'a [u8],
    /// Packed child references of `ref_size` bytes each.
    pub references: &'a [u8],
    /// Full record length in bytes.
    pub len: usize,
}

impl CellRecord<'_> {
    pub fn bit_len(&self) -> u16 {
        let byte_len = self.data.len() as u16;
        if self.descriptor.is_aligned() {
            byte_len * 8
        } else if let Some(last) = self.data.last() {
            byte_len * 8 - last.trailing_zeros() as u16 - 1
        } else {
            0
        }
    }

    /// Builds a cell and compares its hashes with the stored ones.
    pub fn finalize(
        &self,
        children_mask: LevelMask,
        references: SmallVec<[Cell; MAX_REF_COUNT]>,
        context: &dyn CellContext,
    ) -> Result<Cell, Error> {
        let mut descriptor = self.descriptor;
        descriptor.d1 &= !CellDescriptor::STORE_HASHES_MASK;

        let parts = CellParts {
            bit_len: self.bit_len(),
            descriptor,
            children_mask,
            references,
            data: self.data,
        };
        let cell = match context.finalize_cell(parts) {
            Ok(cell) => cell,
            Err(_) => return Err(Error::InvalidCell),
        };

        if !self.hashes.is_empty() {
            ok!(check_stored_hashes(cell.as_ref(), self.hashes));
        }
        Ok(cell)
    }
}

/// Reads a single cell record at the specified offset.
pub(crate) fn read_cell_record(
    data: &[u8],
    offset: usize,
    ref_size: usize,
) -> Result<CellRecord<'_>, Error> {
    let mut reader = BocReader::with_offset(data, offset);

    let descriptor = match ok!(reader.read_bytes(2)) {
        &[d1, d2] => CellDescriptor::new([d1, d2]),
        _ => return Err(Error::InvalidCell),
    };
    if unlikely(descriptor.is_absent()) {
        return Err(Error::AbsentCellsNotSupported);
    }

    let ref_count = descriptor.reference_count() as usize;
    if unlikely(ref_count > MAX_REF_COUNT) {
        return Err(Error::InvalidRef);
    }

    let mut hashes_len = 0;
    if unlikely(descriptor.store_hashes()) {
        if descriptor.is_pruned_branch() {
            // Pruned branch with `store_hashes` is invalid
            return Err(Error::UnnormalizedCell);
        }
        hashes_len = (32 + 2) * descriptor.hash_count() as usize;
    }

    let hashes = ok!(reader.read_bytes(hashes_len));
    let cell_data = ok!(reader.read_bytes(descriptor.byte_len() as usize));
    let references = ok!(reader.read_bytes(ref_count * ref_size));

    if !descriptor.is_aligned() {
        // NOTE: unaligned descriptors always have at least one data byte
        if let Some(byte_with_tag) = cell_data.last() {
            if unlikely(byte_with_tag & 0x7f == 0) {
                return Err(Error::UnnormalizedCell);
            }
        }
    }

    Ok(CellRecord {
        descriptor,
        hashes,
        data: cell_data,
        references,
        len: reader.offset - offset,
    })
}

fn check_stored_hashes(cell: &DynCell, stored: &[u8]) -> Result<(), Error> {
    let mask = cell.level_mask();
    let hash_count = stored.len() / (32 + 2);

    let mut i = 0;
    for level in 0..=LevelMask::MAX_LEVEL {
        if !mask.contains(level) {
            continue;
        }
        if unlikely(i >= hash_count) {
            return Err(Error::InvalidCell);
        }

        let hash = &stored[i * 32..(i + 1) * 32];
        let depth_offset = hash_count * 32 + i * 2;
        let depth = u16::from_be_bytes([stored[depth_offset], stored[depth_offset + 1]]);
        if unlikely(cell.hash(level).as_slice() != hash || cell.depth(level) != depth) {
            return Err(Error::InvalidCell);
        }
        i += 1;
    }
    Ok(())
}

/// Bounds-checked cursor over the input.
pub(crate) struct BocReader<'a> {
    data: &'a [u8],
    pub offset: usize,
}

impl<'a> BocReader<'a> {
    #[inline(always)]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    #[inline(always)]
    pub const fn with_offset(data: &'a [u8], offset: usize) -> Self {
        Self { data, offset }
    }

    #[inline(always)]
    pub fn require(&self, len: usize) -> Result<(), Error> {
        let end = self.offset.saturating_add(len);
        if unlikely(end > self.data.len()) {
            Err(Error::NeedMoreBytes(end - self.data.len()))
        } else {
            Ok(())
        }
    }

    #[inline(always)]
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        ok!(self.require(len));
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    /// Reads a big-endian integer of 1..=8 bytes.
    #[inline(always)]
    pub fn read_be_uint(&mut self, size: usize) -> Result<u64, Error> {
        debug_assert!((1..=8).contains(&size));
        self.read_bytes(size).map(read_be_uint)
    }
}

const CELLS_ON_STACK: usize = 16;
pub(crate) const ROOTS_ON_STACK: usize = 2;

const MAX_ROOTS: usize = 32;

/// Error type for BOC decoding related errors.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// The input is a valid prefix which ends too early.
    #[error("need {0} more bytes")]
    NeedMoreBytes(usize),
    /// Invalid magic bytes.
    #[error("unknown BOC tag")]
    UnknownBocTag,
    /// Invalid BOC header.
    #[error("invalid header")]
    InvalidHeader,
    /// References size is greater than 4.
    #[error("ref index does not fit in `u32` type")]
    InvalidRefSize,
    /// Offset size is greater than 8.
    #[error("cell offset does not fit in `u64` type")]
    InvalidOffsetSize,
    /// Root cell not found.
    #[error("root cell not found")]
    RootCellNotFound,
    /// Specified BOC tag doesn't support multiple roots.
    #[error("unexpected multiple roots")]
    UnexpectedMultipleRoots,
    /// The number of roots in BOC is greater than expected.
    #[error("too many root cells")]
    TooManyRootCells,
    /// Absent cells are legacy therefore not supported.
    #[error("absent cells are not supported")]
    AbsentCellsNotSupported,
    /// The number of roots in BOC is less than expected.
    #[error("too few root cells")]
    TooFewRootCells,
    /// Total cells size mismatch.
    #[error("invalid total cells size")]
    InvalidTotalSize,
    /// Cells index does not match cell records.
    #[error("invalid cells index")]
    InvalidIndex,
    /// The input continues after the end of the bag.
    #[error("unexpected bytes after the end of the bag")]
    TrailingBytes,
    /// Invalid root cell index.
    #[error("root index out of bounds")]
    RootOutOfBounds,
    /// Invalid child reference.
    #[error("cell ref count not in range 0..=4")]
    InvalidRef,
    /// Suboptimal cells are treated as error.
    #[error("unnormalized cell")]
    UnnormalizedCell,
    /// Possible graph loop detected.
    #[error("invalid children order")]
    InvalidRefOrder,
    /// Failed to parse cell.
    #[error("invalid cell")]
    InvalidCell,
    /// Crc mismatch.
    #[error("invalid checksum")]
    InvalidChecksum,
}

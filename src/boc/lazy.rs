use std::sync::OnceLock;

use bytes::Bytes;
use smallvec::SmallVec;

use super::de::{read_cell_record, CellRecord, Error, RawHeader, ROOTS_ON_STACK};
use super::{BocMode, BocTag};
use crate::cell::{Cell, CellDescriptor, LevelMask, MAX_REF_COUNT};
use crate::util::{read_be_uint, unlikely};

/// Random-access BOC reader which builds cells on demand.
///
/// Uses the cells index when the bag has one. Otherwise cell offsets
/// are collected once by a linear scan on the first access.
/// Resolved cells are cached, so each cell is built at most once
/// (up to races between threads which resolve the same cell).
#[derive(Debug)]
pub struct LazyBoc {
    data: Bytes,
    header: RawHeader,
    roots: SmallVec<[u32; ROOTS_ON_STACK]>,
    offsets: OnceLock<Box<[usize]>>,
    mode: OnceLock<BocMode>,
    cells: Box<[OnceLock<Cell>]>,
}

impl LazyBoc {
    /// Validates the header, the total size and the checksum.
    ///
    /// Cells themselves are validated only when they are resolved.
    pub fn new(data: Bytes) -> Result<Self, Error> {
        let header = ok!(RawHeader::parse(&data));

        let total_size = header.total_size();
        if unlikely((data.len() as u64) < total_size) {
            return Err(Error::NeedMoreBytes((total_size - data.len() as u64) as usize));
        }
        if unlikely((data.len() as u64) > total_size) {
            return Err(Error::TrailingBytes);
        }

        let roots = ok!(header.read_roots(&data));
        ok!(header.check_crc(&data));

        let mut cells = Vec::new();
        if cells.try_reserve_exact(header.cell_count).is_err() {
            return Err(Error::InvalidTotalSize);
        }
        cells.resize_with(header.cell_count, OnceLock::new);

        Ok(Self {
            data,
            header,
            roots,
            offsets: OnceLock::new(),
            mode: OnceLock::new(),
            cells: cells.into_boxed_slice(),
        })
    }

    /// Magic number of the bag.
    pub fn tag(&self) -> BocTag {
        self.header.tag
    }

    /// Returns the encoder flags which reproduce this bag.
    ///
    /// Reads descriptors of all cells on the first call.
    pub fn mode(&self) -> Result<BocMode, Error> {
        if let Some(mode) = self.mode.get() {
            return Ok(*mode);
        }

        let cells_offset = self.header.cells_offset();
        let mut roots_store_hashes = false;
        let mut others_store_hashes = false;
        for index in 0..self.cells.len() {
            let start = if self.header.has_index {
                ok!(self.indexed_range(index)).0
            } else {
                ok!(self.scanned_offsets())[index]
            };
            let Some(&d1) = self.data.get(cells_offset + start) else {
                return Err(Error::InvalidTotalSize);
            };

            if d1 & CellDescriptor::STORE_HASHES_MASK != 0 {
                if self.roots.contains(&(index as u32)) {
                    roots_store_hashes = true;
                } else {
                    others_store_hashes = true;
                }
            }
        }

        let mode = self.header.mode(roots_store_hashes, others_store_hashes);
        Ok(*self.mode.get_or_init(|| mode))
    }

    /// Returns the number of roots.
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Returns the number of unique cells.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Returns the number of cells which were already built.
    pub fn loaded_count(&self) -> usize {
        self.cells.iter().filter(|cell| cell.get().is_some()).count()
    }

    /// Resolves the root with the specified index.
    pub fn get_root(&self, index: usize) -> Result<Cell, Error> {
        match self.roots.get(index) {
            Some(cell_index) => self.get_cell(*cell_index as usize),
            None => Err(Error::RootCellNotFound),
        }
    }

    /// Resolves the cell with the specified wire index.
    pub fn get_cell(&self, index: usize) -> Result<Cell, Error> {
        let cell_count = self.cells.len();
        if unlikely(index >= cell_count) {
            return Err(Error::InvalidRef);
        }
        if let Some(cell) = self.cells[index].get() {
            tracing::trace!(index, "lazy boc cache hit");
            return Ok(cell.clone());
        }

        let ref_size = self.header.ref_size;

        let mut stack = vec![index];
        while let Some(&current) = stack.last() {
            if self.cells[current].get().is_some() {
                stack.pop();
                continue;
            }

            let record = ok!(self.read_record(current));

            let mut has_missing = false;
            for chunk in record.references.chunks_exact(ref_size) {
                let child_index = read_be_uint(chunk) as usize;
                if unlikely(child_index >= cell_count) {
                    return Err(Error::InvalidRef);
                }
                if unlikely(child_index <= current) {
                    return Err(Error::InvalidRefOrder);
                }
                if self.cells[child_index].get().is_none() {
                    stack.push(child_index);
                    has_missing = true;
                }
            }
            if has_missing {
                continue;
            }

            let mut references = SmallVec::<[Cell; MAX_REF_COUNT]>::new();
            let mut children_mask = LevelMask::EMPTY;
            for chunk in record.references.chunks_exact(ref_size) {
                let Some(child) = self.cells[read_be_uint(chunk) as usize].get() else {
                    return Err(Error::InvalidCell);
                };
                children_mask |= child.as_ref().level_mask();
                references.push(child.clone());
            }

            let cell = ok!(record.finalize(children_mask, references, Cell::empty_context()));
            // Another thread could have resolved the same cell
            let _ = self.cells[current].set(cell);
            stack.pop();
        }

        match self.cells[index].get() {
            Some(cell) => Ok(cell.clone()),
            None => Err(Error::InvalidCell),
        }
    }

    fn read_record(&self, index: usize) -> Result<CellRecord<'_>, Error> {
        let cells_offset = self.header.cells_offset();
        let cells_end = cells_offset + self.header.total_cells_size as usize;
        let cells_data = &self.data[..cells_end];

        let (start, end) = if self.header.has_index {
            ok!(self.indexed_range(index))
        } else {
            let offsets = ok!(self.scanned_offsets());
            let start = offsets[index];
            let end = match offsets.get(index + 1) {
                Some(next) => *next,
                None => cells_end - cells_offset,
            };
            (start, end)
        };

        let record = match read_cell_record(cells_data, cells_offset + start, self.header.ref_size)
        {
            Ok(record) => record,
            Err(Error::NeedMoreBytes(_)) => return Err(Error::InvalidTotalSize),
            Err(e) => return Err(e),
        };
        if unlikely(start + record.len != end) {
            return Err(if self.header.has_index {
                Error::InvalidIndex
            } else {
                Error::InvalidTotalSize
            });
        }
        Ok(record)
    }

    /// Returns the cell range relative to the first cell record.
    fn indexed_range(&self, index: usize) -> Result<(usize, usize), Error> {
        let read_entry = |index: usize| -> Result<usize, Error> {
            let entry = ok!(self.header.read_index_entry(&self.data, index));
            if unlikely(entry > self.header.total_cells_size) {
                return Err(Error::InvalidIndex);
            }
            Ok(entry as usize)
        };

        let start = match index.checked_sub(1) {
            Some(prev) => ok!(read_entry(prev)),
            None => 0,
        };
        let end = ok!(read_entry(index));
        if unlikely(start >= end) {
            return Err(Error::InvalidIndex);
        }
        Ok((start, end))
    }

    fn scanned_offsets(&self) -> Result<&[usize], Error> {
        if let Some(offsets) = self.offsets.get() {
            return Ok(offsets);
        }

        let cells_offset = self.header.cells_offset();
        let cells_end = cells_offset + self.header.total_cells_size as usize;
        let cells_data = &self.data[..cells_end];

        let mut offsets = Vec::with_capacity(self.cells.len());
        let mut offset = cells_offset;
        for _ in 0..self.cells.len() {
            offsets.push(offset - cells_offset);
            let record = match read_cell_record(cells_data, offset, self.header.ref_size) {
                Ok(record) => record,
                Err(Error::NeedMoreBytes(_)) => return Err(Error::InvalidTotalSize),
                Err(e) => return Err(e),
            };
            offset += record.len;
        }
        if unlikely(offset != cells_end) {
            return Err(Error::InvalidTotalSize);
        }

        tracing::debug!(cells = offsets.len(), "scanned lazy boc offsets");
        Ok(self.offsets.get_or_init(|| offsets.into_boxed_slice()))
    }
}

use crate::cell::{Cell, DynCell, HashBytes, RefsIter};
use crate::error::Error;

/// A read-only view for a subrange of a cell.
#[derive(Clone, Copy)]
pub struct CellSlice<'a> {
    cell: &'a DynCell,
    bits_window_start: u16,
    bits_window_end: u16,
    refs_window_start: u8,
    refs_window_end: u8,
}

impl std::fmt::Debug for CellSlice<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellSlice")
            .field("cell", &self.cell.repr_hash())
            .field("bits", &(self.bits_window_start..self.bits_window_end))
            .field("refs", &(self.refs_window_start..self.refs_window_end))
            .finish()
    }
}

impl<'a> CellSlice<'a> {
    /// Constructs a new cell slice from the specified cell.
    ///
    /// Returns an error if the cell is not ordinary.
    pub fn new(cell: &'a DynCell) -> Result<Self, Error> {
        let descriptor = cell.descriptor();
        if descriptor.is_pruned_branch() {
            Err(Error::PrunedBranchAccess)
        } else if descriptor.is_exotic() {
            Err(Error::UnexpectedExoticCell)
        } else {
            Ok(Self::new_allow_exotic(cell))
        }
    }

    /// Constructs a new cell slice from the specified cell as is.
    pub fn new_allow_exotic(cell: &'a DynCell) -> Self {
        Self {
            bits_window_start: 0,
            bits_window_end: cell.bit_len(),
            refs_window_start: 0,
            refs_window_end: cell.reference_count(),
            cell,
        }
    }

    /// Returns a reference to the underlying cell.
    #[inline]
    pub const fn cell(&self) -> &'a DynCell {
        self.cell
    }

    /// Returns the number of remaining bits of data in the slice.
    #[inline]
    pub const fn size_bits(&self) -> u16 {
        self.bits_window_end.saturating_sub(self.bits_window_start)
    }

    /// Returns the number of remaining references in the slice.
    #[inline]
    pub const fn size_refs(&self) -> u8 {
        self.refs_window_end.saturating_sub(self.refs_window_start)
    }

    /// Returns whether there are no data bits left.
    #[inline]
    pub const fn is_data_empty(&self) -> bool {
        self.bits_window_start >= self.bits_window_end
    }

    /// Returns whether there are no references left.
    #[inline]
    pub const fn is_refs_empty(&self) -> bool {
        self.refs_window_start >= self.refs_window_end
    }

    /// Returns whether there are at least `bits` and `refs` remaining.
    #[inline]
    pub const fn has_remaining(&self, bits: u16, refs: u8) -> bool {
        self.bits_window_start + bits <= self.bits_window_end
            && self.refs_window_start + refs <= self.refs_window_end
    }

    /// Advances the data and references windows.
    pub fn skip_first(&mut self, bits: u16, refs: u8) -> Result<(), Error> {
        if !self.has_remaining(bits, refs) {
            return Err(Error::CellUnderflow);
        }
        self.bits_window_start += bits;
        self.refs_window_start += refs;
        Ok(())
    }

    /// Reads a bit at the specified offset without advancing the window.
    pub fn get_bit(&self, offset: u16) -> Result<bool, Error> {
        if self.bits_window_start + offset >= self.bits_window_end {
            return Err(Error::CellUnderflow);
        }
        let position = self.bits_window_start + offset;
        let data = self.cell.data();
        let byte = match data.get((position / 8) as usize) {
            Some(byte) => *byte,
            None => return Err(Error::CellUnderflow),
        };
        Ok(byte & (0x80 >> (position % 8)) != 0)
    }

    /// Reads `u8` at the specified offset without advancing the window.
    pub fn get_u8(&self, offset: u16) -> Result<u8, Error> {
        let mut buffer = [0u8; 1];
        ok!(self.get_raw(offset, &mut buffer, 8));
        Ok(buffer[0])
    }

    /// Reads `u16` at the specified offset without advancing the window.
    pub fn get_u16(&self, offset: u16) -> Result<u16, Error> {
        let mut buffer = [0u8; 2];
        ok!(self.get_raw(offset, &mut buffer, 16));
        Ok(u16::from_be_bytes(buffer))
    }

    /// Reads 32 bytes at the specified offset without advancing the window.
    pub fn get_u256(&self, offset: u16) -> Result<HashBytes, Error> {
        let mut buffer = HashBytes::ZERO;
        ok!(self.get_raw(offset, &mut buffer.0, 256));
        Ok(buffer)
    }

    /// Reads `bits` of data at the specified offset into the target buffer
    /// without advancing the window.
    ///
    /// Unused bits of the last byte are zeroed.
    pub fn get_raw<'b>(
        &self,
        offset: u16,
        target: &'b mut [u8],
        bits: u16,
    ) -> Result<&'b mut [u8], Error> {
        let byte_len = ((bits + 7) / 8) as usize;
        if self.bits_window_start + offset + bits > self.bits_window_end || target.len() < byte_len
        {
            return Err(Error::CellUnderflow);
        }
        let target = &mut target[..byte_len];
        if bits == 0 {
            return Ok(target);
        }

        let position = self.bits_window_start + offset;
        let q = (position / 8) as usize;
        let r = position % 8;
        let data = self.cell.data();

        if r == 0 {
            match data.get(q..q + byte_len) {
                Some(src) => target.copy_from_slice(src),
                None => return Err(Error::CellUnderflow),
            }
        } else {
            for (i, byte) in target.iter_mut().enumerate() {
                let hi = match data.get(q + i) {
                    Some(hi) => *hi,
                    None => return Err(Error::CellUnderflow),
                };
                let lo = data.get(q + i + 1).copied().unwrap_or_default();
                *byte = (hi << r) | (lo >> (8 - r));
            }
        }

        let rem = bits % 8;
        if rem != 0 {
            if let Some(last) = target.last_mut() {
                *last &= 0xff << (8 - rem);
            }
        }

        Ok(target)
    }

    /// Reads the specified number of bits into the target buffer
    /// and advances the window.
    pub fn load_raw<'b>(&mut self, target: &'b mut [u8], bits: u16) -> Result<&'b mut [u8], Error> {
        let res = ok!(self.get_raw(0, target, bits));
        self.bits_window_start += bits;
        Ok(res)
    }

    /// Reads one bit and advances the window.
    pub fn load_bit(&mut self) -> Result<bool, Error> {
        let bit = ok!(self.get_bit(0));
        self.bits_window_start += 1;
        Ok(bit)
    }

    /// Reads `u8` and advances the window.
    pub fn load_u8(&mut self) -> Result<u8, Error> {
        let value = ok!(self.get_u8(0));
        self.bits_window_start += 8;
        Ok(value)
    }

    /// Reads `u16` and advances the window.
    pub fn load_u16(&mut self) -> Result<u16, Error> {
        let value = ok!(self.get_u16(0));
        self.bits_window_start += 16;
        Ok(value)
    }

    /// Reads `u32` and advances the window.
    pub fn load_u32(&mut self) -> Result<u32, Error> {
        let mut buffer = [0u8; 4];
        ok!(self.load_raw(&mut buffer, 32));
        Ok(u32::from_be_bytes(buffer))
    }

    /// Reads `u64` and advances the window.
    pub fn load_u64(&mut self) -> Result<u64, Error> {
        let mut buffer = [0u8; 8];
        ok!(self.load_raw(&mut buffer, 64));
        Ok(u64::from_be_bytes(buffer))
    }

    /// Reads an unsigned integer of up to 64 bits and advances the window.
    pub fn load_uint(&mut self, bits: u16) -> Result<u64, Error> {
        if bits > 64 {
            return Err(Error::CellUnderflow);
        }
        if bits == 0 {
            return Ok(0);
        }
        let mut buffer = [0u8; 8];
        ok!(self.load_raw(&mut buffer, bits));
        Ok(u64::from_be_bytes(buffer) >> (64 - bits))
    }

    /// Reads 32 bytes and advances the window.
    pub fn load_u256(&mut self) -> Result<HashBytes, Error> {
        let value = ok!(self.get_u256(0));
        self.bits_window_start += 256;
        Ok(value)
    }

    /// Returns a reference to the Nth child cell (relative to this slice's refs window).
    pub fn get_reference(&self, index: u8) -> Result<&'a DynCell, Error> {
        if self.refs_window_start + index >= self.refs_window_end {
            return Err(Error::CellUnderflow);
        }
        match self.cell.reference(self.refs_window_start + index) {
            Some(cell) => Ok(cell),
            None => Err(Error::CellUnderflow),
        }
    }

    /// Returns the Nth child cell (relative to this slice's refs window).
    pub fn get_reference_cloned(&self, index: u8) -> Result<Cell, Error> {
        if self.refs_window_start + index >= self.refs_window_end {
            return Err(Error::CellUnderflow);
        }
        match self.cell.reference_cloned(self.refs_window_start + index) {
            Some(cell) => Ok(cell),
            None => Err(Error::CellUnderflow),
        }
    }

    /// Reads the next reference and advances the window.
    pub fn load_reference(&mut self) -> Result<&'a DynCell, Error> {
        let cell = ok!(self.get_reference(0));
        self.refs_window_start += 1;
        Ok(cell)
    }

    /// Reads the next reference as an owned cell and advances the window.
    pub fn load_reference_cloned(&mut self) -> Result<Cell, Error> {
        let cell = ok!(self.get_reference_cloned(0));
        self.refs_window_start += 1;
        Ok(cell)
    }

    /// Returns an iterator through the remaining references of the underlying cell.
    ///
    /// NOTE: the refs window is not taken into account.
    pub fn references(&self) -> RefsIter<'a> {
        self.cell.references()
    }
}

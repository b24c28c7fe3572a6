use smallvec::SmallVec;

use crate::cell::{
    Cell, CellContext, CellDescriptor, CellParts, CellSlice, CellType, DynCell, HashBytes,
    LevelMask, Store, MAX_BIT_LEN, MAX_REF_COUNT,
};
use crate::error::Error;

/// Builder for constructing cells with densely packed data.
#[derive(Clone)]
pub struct CellBuilder {
    data: [u8; 128],
    bit_len: u16,
    is_exotic: bool,
    references: SmallVec<[Cell; MAX_REF_COUNT]>,
}

impl Default for CellBuilder {
    #[inline]
    fn default() -> Self {
        Self {
            data: [0; 128],
            bit_len: 0,
            is_exotic: false,
            references: SmallVec::new(),
        }
    }
}

impl Eq for CellBuilder {}

impl PartialEq for CellBuilder {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.bit_len == other.bit_len
            && self.is_exotic == other.is_exotic
            && self.raw_data() == other.raw_data()
            && self.references.len() == other.references.len()
            && std::iter::zip(&self.references, &other.references)
                .all(|(a, b)| a.as_ref().repr_hash() == b.as_ref().repr_hash())
    }
}

impl std::fmt::Debug for CellBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellBuilder")
            .field("bit_len", &self.bit_len)
            .field("is_exotic", &self.is_exotic)
            .field("data", &hex::encode(self.raw_data()))
            .field("references", &self.references.len())
            .finish()
    }
}

impl CellBuilder {
    /// Builds a new cell from the specified data using the default cell context.
    #[inline]
    pub fn build_from<T: Store>(data: T) -> Result<Cell, Error> {
        Self::build_from_ext(data, Cell::empty_context())
    }

    /// Builds a new cell from the specified data using the provided cell context.
    pub fn build_from_ext<T: Store>(data: T, context: &dyn CellContext) -> Result<Cell, Error> {
        let mut builder = Self::new();
        ok!(data.store_into(&mut builder, context));
        builder.build_ext(context)
    }

    /// Creates an empty cell builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder from raw data bits.
    pub fn from_raw_data(value: &[u8], bits: u16) -> Result<Self, Error> {
        let mut res = Self::new();
        ok!(res.store_raw(value, bits));
        Ok(res)
    }

    /// Returns a slice which contains only the used data bytes.
    pub fn raw_data(&self) -> &[u8] {
        &self.data[..((self.bit_len + 7) / 8) as usize]
    }

    /// Returns the data size of this cell in bits.
    #[inline]
    pub fn size_bits(&self) -> u16 {
        self.bit_len
    }

    /// Returns the number of stored references.
    #[inline]
    pub fn size_refs(&self) -> u8 {
        self.references.len() as u8
    }

    /// Returns child cell references.
    #[inline]
    pub fn references(&self) -> &[Cell] {
        &self.references
    }

    /// Returns the remaining capacity in bits.
    #[inline]
    pub const fn spare_bits_capacity(&self) -> u16 {
        MAX_BIT_LEN - self.bit_len
    }

    /// Returns the remaining capacity in references.
    #[inline]
    pub fn spare_refs_capacity(&self) -> u8 {
        (MAX_REF_COUNT - self.references.len()) as u8
    }

    /// Returns true if there is enough remaining capacity to fit `bits` and `refs`.
    #[inline]
    pub fn has_capacity(&self, bits: u16, refs: u8) -> bool {
        self.bit_len + bits <= MAX_BIT_LEN && self.references.len() + refs as usize <= MAX_REF_COUNT
    }

    /// Returns whether this cell will be built as an exotic.
    #[inline]
    pub const fn is_exotic(&self) -> bool {
        self.is_exotic
    }

    /// Marks this cell as exotic.
    #[inline]
    pub fn set_exotic(&mut self, is_exotic: bool) {
        self.is_exotic = is_exotic;
    }

    /// Tries to store the specified number of zero bits.
    pub fn store_zeros(&mut self, bits: u16) -> Result<(), Error> {
        if self.bit_len + bits <= MAX_BIT_LEN {
            self.bit_len += bits;
            Ok(())
        } else {
            Err(Error::CellOverflow)
        }
    }

    /// Tries to store one bit.
    pub fn store_bit(&mut self, value: bool) -> Result<(), Error> {
        if self.bit_len >= MAX_BIT_LEN {
            return Err(Error::CellOverflow);
        }
        if value {
            let q = (self.bit_len / 8) as usize;
            let r = self.bit_len % 8;
            self.data[q] |= 1 << (7 - r);
        }
        self.bit_len += 1;
        Ok(())
    }

    /// Tries to store `u8` in the cell.
    #[inline]
    pub fn store_u8(&mut self, value: u8) -> Result<(), Error> {
        self.store_raw(&[value], 8)
    }

    /// Tries to store `u16` in the cell.
    #[inline]
    pub fn store_u16(&mut self, value: u16) -> Result<(), Error> {
        self.store_raw(&value.to_be_bytes(), 16)
    }

    /// Tries to store `u32` in the cell.
    #[inline]
    pub fn store_u32(&mut self, value: u32) -> Result<(), Error> {
        self.store_raw(&value.to_be_bytes(), 32)
    }

    /// Tries to store `u64` in the cell.
    #[inline]
    pub fn store_u64(&mut self, value: u64) -> Result<(), Error> {
        self.store_raw(&value.to_be_bytes(), 64)
    }

    /// Tries to store `u128` in the cell.
    #[inline]
    pub fn store_u128(&mut self, value: u128) -> Result<(), Error> {
        self.store_raw(&value.to_be_bytes(), 128)
    }

    /// Tries to store 32 bytes in the cell.
    #[inline]
    pub fn store_u256(&mut self, value: &HashBytes) -> Result<(), Error> {
        self.store_raw(value.as_slice(), 256)
    }

    /// Tries to store the lowest `bits` of `value` (up to 64 bits).
    pub fn store_uint(&mut self, value: u64, bits: u16) -> Result<(), Error> {
        if bits > 64 {
            return Err(Error::CellOverflow);
        }
        if bits == 0 {
            return Ok(());
        }
        let shifted = value << (64 - bits);
        self.store_raw(&shifted.to_be_bytes(), bits)
    }

    /// Tries to store the first `bits` of the `value` bytes.
    pub fn store_raw(&mut self, value: &[u8], bits: u16) -> Result<(), Error> {
        let byte_len = ((bits + 7) / 8) as usize;
        if self.bit_len + bits > MAX_BIT_LEN || value.len() < byte_len {
            return Err(Error::CellOverflow);
        }
        if bits == 0 {
            return Ok(());
        }

        let q = (self.bit_len / 8) as usize;
        let r = self.bit_len % 8;
        let value = &value[..byte_len];

        if r == 0 {
            self.data[q..q + byte_len].copy_from_slice(value);
        } else {
            // yyyxxxxx|xxx00000
            for (i, byte) in value.iter().enumerate() {
                self.data[q + i] |= byte >> r;
                if let Some(next) = self.data.get_mut(q + i + 1) {
                    *next = byte << (8 - r);
                }
            }
        }
        self.bit_len += bits;

        // Keep all bits after the end zeroed
        let end = self.bit_len as usize;
        let rem = end % 8;
        if rem != 0 {
            self.data[end / 8] &= 0xff << (8 - rem);
        }
        let tail_start = (end + 7) / 8;
        let tail_end = std::cmp::min(q + byte_len + 1, self.data.len());
        if tail_start < tail_end {
            self.data[tail_start..tail_end].fill(0);
        }

        Ok(())
    }

    /// Tries to store the remaining data bits of the slice.
    pub fn store_slice_data(&mut self, value: &CellSlice<'_>) -> Result<(), Error> {
        let bits = value.size_bits();
        if self.bit_len + bits > MAX_BIT_LEN {
            return Err(Error::CellOverflow);
        }
        let mut buffer = [0u8; 128];
        let data = ok!(value.get_raw(0, &mut buffer, bits));
        self.store_raw(data, bits)
    }

    /// Tries to store the data bits of another cell.
    pub fn store_cell_data(&mut self, value: &DynCell) -> Result<(), Error> {
        self.store_raw(value.data(), value.bit_len())
    }

    /// Tries to store a child in the cell.
    pub fn store_reference(&mut self, cell: Cell) -> Result<(), Error> {
        if self.references.len() < MAX_REF_COUNT {
            self.references.push(cell);
            Ok(())
        } else {
            Err(Error::CellOverflow)
        }
    }

    /// Replaces all references with the specified ones.
    pub fn set_references<I: IntoIterator<Item = Cell>>(&mut self, refs: I) -> Result<(), Error> {
        self.references.clear();
        for cell in refs {
            ok!(self.store_reference(cell));
        }
        Ok(())
    }

    /// Computes the level mask of the resulting cell.
    pub fn compute_level_mask(&self) -> LevelMask {
        let mut children_mask = LevelMask::EMPTY;
        for child in &self.references {
            children_mask |= child.as_ref().level_mask();
        }

        if !self.is_exotic {
            return children_mask;
        }

        match self.data.first().copied().and_then(CellType::from_byte_exotic) {
            Some(CellType::PrunedBranch) if self.bit_len >= 16 => LevelMask::new(self.data[1]),
            Some(CellType::MerkleProof | CellType::MerkleUpdate) => children_mask.virtualize(1),
            _ => LevelMask::EMPTY,
        }
    }

    /// Builds a new cell using the empty cell context.
    #[inline]
    pub fn build(self) -> Result<Cell, Error> {
        self.build_ext(Cell::empty_context())
    }

    /// Builds a new cell using the specified cell context.
    pub fn build_ext(mut self, context: &dyn CellContext) -> Result<Cell, Error> {
        debug_assert!(self.bit_len <= MAX_BIT_LEN);
        debug_assert!(self.references.len() <= MAX_REF_COUNT);

        let mut children_mask = LevelMask::EMPTY;
        for child in &self.references {
            children_mask |= child.as_ref().level_mask();
        }

        let level_mask = self.compute_level_mask();
        let d1 =
            CellDescriptor::compute_d1(level_mask, self.is_exotic, self.references.len() as u8);
        let d2 = CellDescriptor::compute_d2(self.bit_len);

        let rem = self.bit_len % 8;
        let last_byte = (self.bit_len / 8) as usize;
        if rem > 0 {
            // x0000000 - rem=1, tag_mask=01000000, data_mask=11000000
            // xxxxxxx0 - rem=7, tag_mask=00000001, data_mask=11111111
            let tag_mask: u8 = 1 << (7 - rem);
            let data_mask = !(tag_mask - 1);

            // xxxxyyyy & data_mask -> xxxxy000 | tag_mask -> xxxx1000
            let last_byte = &mut self.data[last_byte];
            *last_byte = (*last_byte & data_mask) | tag_mask;
        }

        let byte_len = ((self.bit_len + 7) / 8) as usize;
        let data = &self.data[..std::cmp::min(byte_len, 128)];

        context.finalize_cell(CellParts {
            bit_len: self.bit_len,
            descriptor: CellDescriptor { d1, d2 },
            children_mask,
            references: self.references,
            data,
        })
    }
}

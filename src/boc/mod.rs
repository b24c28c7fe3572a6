//! BOC (Bag Of Cells) implementation.

use crate::cell::{Cell, CellContext, DynCell};

pub use self::lazy::LazyBoc;

/// BOC decoder implementation.
pub mod de;
/// Lazy random-access BOC reader.
pub mod lazy;
/// BOC encoder implementation.
pub mod ser;

#[cfg(test)]
mod tests;

/// BOC file magic number.
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BocTag {
    /// Single root, cells index, no CRC32.
    Indexed,
    /// Single root, cells index, with CRC32.
    IndexedCrc32,
    /// Multiple roots, optional cells index, optional CRC32.
    #[default]
    Generic,
}

impl BocTag {
    const INDEXED: [u8; 4] = [0x68, 0xff, 0x65, 0xf3];
    const INDEXED_CRC32: [u8; 4] = [0xac, 0xc3, 0xa7, 0x28];
    const GENERIC: [u8; 4] = [0xb5, 0xee, 0x9c, 0x72];

    /// Tries to match bytes with BOC tag.
    pub const fn from_bytes(data: [u8; 4]) -> Option<Self> {
        match data {
            Self::GENERIC => Some(Self::Generic),
            Self::INDEXED_CRC32 => Some(Self::IndexedCrc32),
            Self::INDEXED => Some(Self::Indexed),
            _ => None,
        }
    }

    /// Converts BOC tag to bytes.
    pub const fn to_bytes(self) -> [u8; 4] {
        match self {
            Self::Indexed => Self::INDEXED,
            Self::IndexedCrc32 => Self::INDEXED_CRC32,
            Self::Generic => Self::GENERIC,
        }
    }

    /// Returns whether this tag allows more than one root.
    pub const fn supports_multiple_roots(self) -> bool {
        matches!(self, Self::Generic)
    }
}

bitflags::bitflags! {
    /// BOC serialization flags.
    #[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct BocMode: u8 {
        /// Write an offset index after the root list.
        const WITH_INDEX = 1;
        /// Append a CRC32C checksum of all preceding bytes.
        const WITH_CRC32C = 1 << 1;
        /// Store inline hashes for root cells.
        const WITH_TOP_HASH = 1 << 2;
        /// Store inline hashes for all non-root cells.
        const WITH_INT_HASHES = 1 << 3;
        /// Mark cells with more than one parent in the offset index.
        ///
        /// Requires [`BocMode::WITH_INDEX`].
        const WITH_CACHE_BITS = 1 << 4;
    }
}

/// BOC (Bag Of Cells) helper.
pub struct Boc;

impl Boc {
    /// Encodes the specified cell tree as BOC and
    /// returns the `base64` encoded bytes as a string.
    #[cfg(any(feature = "base64", test))]
    pub fn encode_base64<T>(cell: T) -> String
    where
        T: AsRef<DynCell>,
    {
        crate::util::encode_base64(Self::encode(cell))
    }

    /// Encodes the specified cell tree as BOC without index or checksum.
    pub fn encode<T>(cell: T) -> Vec<u8>
    where
        T: AsRef<DynCell>,
    {
        fn encode_impl(cell: &DynCell) -> Vec<u8> {
            let mut result = Vec::new();
            ser::BocHeader::with_root(cell).encode_unchecked(&mut result);
            result
        }
        encode_impl(cell.as_ref())
    }

    /// Encodes the specified cell tree as BOC with the specified flags.
    pub fn encode_ext<T>(cell: T, mode: BocMode) -> Result<Vec<u8>, ser::Error>
    where
        T: AsRef<DynCell>,
    {
        fn encode_ext_impl(cell: &DynCell, mode: BocMode) -> Result<Vec<u8>, ser::Error> {
            let mut result = Vec::new();
            ok!(ser::BocHeader::with_root(cell)
                .with_mode(mode)
                .encode(&mut result));
            Ok(result)
        }
        encode_ext_impl(cell.as_ref(), mode)
    }

    /// Encodes a pair of cell trees as BOC.
    pub fn encode_pair<T1, T2>((cell1, cell2): (T1, T2)) -> Vec<u8>
    where
        T1: AsRef<DynCell>,
        T2: AsRef<DynCell>,
    {
        fn encode_pair_impl(cell1: &DynCell, cell2: &DynCell) -> Vec<u8> {
            let mut result = Vec::new();
            let mut encoder = ser::BocHeader::with_root(cell1);
            encoder.add_root(cell2);
            encoder.encode_unchecked(&mut result);
            result
        }
        encode_pair_impl(cell1.as_ref(), cell2.as_ref())
    }

    /// Decodes a `base64` encoded BOC into a cell tree
    /// using an empty cell context.
    #[cfg(any(feature = "base64", test))]
    #[inline]
    pub fn decode_base64<T: AsRef<[u8]>>(data: T) -> Result<Cell, de::Error> {
        fn decode_base64_impl(data: &[u8]) -> Result<Cell, de::Error> {
            match crate::util::decode_base64(data) {
                Ok(data) => Boc::decode_ext(data.as_slice(), Cell::empty_context()),
                Err(_) => Err(de::Error::UnknownBocTag),
            }
        }
        decode_base64_impl(data.as_ref())
    }

    /// Decodes a cell tree using an empty cell context.
    #[inline]
    pub fn decode<T>(data: T) -> Result<Cell, de::Error>
    where
        T: AsRef<[u8]>,
    {
        fn decode_impl(data: &[u8]) -> Result<Cell, de::Error> {
            Boc::decode_ext(data, Cell::empty_context())
        }
        decode_impl(data.as_ref())
    }

    /// Decodes a pair of cell trees using an empty cell context.
    #[inline]
    pub fn decode_pair<T>(data: T) -> Result<(Cell, Cell), de::Error>
    where
        T: AsRef<[u8]>,
    {
        fn decode_pair_impl(data: &[u8]) -> Result<(Cell, Cell), de::Error> {
            let header = ok!(de::BocHeader::decode(data, &de::Options::exact(2)));
            let cells = ok!(header.finalize(Cell::empty_context()));
            match (header.root(0, &cells), header.root(1, &cells)) {
                (Some(first), Some(second)) => Ok((first, second)),
                _ => Err(de::Error::RootCellNotFound),
            }
        }
        decode_pair_impl(data.as_ref())
    }

    /// Decodes a cell tree using the specified cell context.
    pub fn decode_ext(data: &[u8], context: &dyn CellContext) -> Result<Cell, de::Error> {
        let header = ok!(de::BocHeader::decode(data, &de::Options::exact(1)));
        let cells = ok!(header.finalize(context));
        match header.root(0, &cells) {
            Some(root) => Ok(root),
            None => Err(de::Error::RootCellNotFound),
        }
    }

    /// Decodes all roots together with the layout needed to re-encode
    /// the bag into identical bytes.
    pub fn decode_all(data: &[u8], context: &dyn CellContext) -> Result<DecodedBoc, de::Error> {
        let header = ok!(de::BocHeader::decode(data, &de::Options::default()));
        let cells = ok!(header.finalize(context));

        let mut roots = Vec::with_capacity(header.roots().len());
        for i in 0..header.roots().len() {
            match header.root(i, &cells) {
                Some(root) => roots.push(root),
                None => return Err(de::Error::RootCellNotFound),
            }
        }

        Ok(DecodedBoc {
            roots,
            mode: header.mode(),
            tag: header.tag(),
        })
    }

    /// Serializes cell into an encoded BOC (as base64 for human readable serializers).
    #[cfg(feature = "serde")]
    pub fn serialize<S, T>(cell: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: AsRef<DynCell>,
    {
        let boc = Self::encode(cell);
        if serializer.is_human_readable() {
            serializer.serialize_str(&crate::util::encode_base64(boc))
        } else {
            serializer.serialize_bytes(&boc)
        }
    }

    /// Deserializes cell from an encoded BOC (from base64 for human readable deserializers).
    #[cfg(feature = "serde")]
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Cell, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        use serde::Deserialize;

        let boc = if deserializer.is_human_readable() {
            let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
            match crate::util::decode_base64(s.as_ref()) {
                Ok(boc) => boc,
                Err(_) => return Err(Error::custom("invalid base64 string")),
            }
        } else {
            <Vec<u8>>::deserialize(deserializer)?
        };

        match Self::decode(boc) {
            Ok(cell) => Ok(cell),
            Err(e) => Err(Error::custom(e)),
        }
    }
}

/// Roots of a decoded bag with its original layout.
#[derive(Debug, Clone)]
pub struct DecodedBoc {
    /// Root cells in the original order.
    pub roots: Vec<Cell>,
    /// Flags which were used to encode the bag.
    pub mode: BocMode,
    /// Magic number of the bag.
    pub tag: BocTag,
}

impl DecodedBoc {
    /// Returns the root with the specified index.
    pub fn get_root(&self, index: usize) -> Option<&Cell> {
        self.roots.get(index)
    }

    /// Encodes all roots using the original tag and flags.
    pub fn encode(&self) -> Result<Vec<u8>, ser::Error> {
        let mut roots = self.roots.iter();
        let Some(first) = roots.next() else {
            return Err(ser::Error::NoRoots);
        };

        let mut encoder = ser::BocHeader::with_root(first.as_ref());
        for root in roots {
            encoder.add_root(root.as_ref());
        }

        let mut result = Vec::new();
        ok!(encoder.with_mode(self.mode).with_tag(self.tag).encode(&mut result));
        Ok(result)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for DynCell {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Boc::serialize(self, serializer)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Cell {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Boc::serialize(self, serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Cell {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Boc::deserialize(deserializer)
    }
}

use std::sync::{Arc, OnceLock};

use smallvec::SmallVec;

use super::loader::CellLoader;
use super::StorageError;
use crate::boc::de::read_cell_record;
use crate::boc::ser::write_hashes;
use crate::boc::Boc;
use crate::cell::*;

/// Body of a single cell with references stored as hashes.
const BODY_CELL: u8 = 0;
/// Body of a whole subtree encoded as a BOC.
const BODY_SUBTREE: u8 = 1;

const HASH_LEN: usize = 32;
const HASHES_ITEM_LEN: usize = 32 + 2;

/// Appends a body of a single cell.
///
/// Layout: `[0][d1][d2][hashes][depths][data][child repr hashes]`.
/// Pruned branches don't store hashes since they are a part of the data.
pub(crate) fn encode_cell_body(cell: &DynCell, target: &mut Vec<u8>) {
    let descriptor = cell.descriptor();
    let store_hashes = !descriptor.is_pruned_branch();

    let mut d1 = descriptor.d1 & !CellDescriptor::STORE_HASHES_MASK;
    if store_hashes {
        d1 |= CellDescriptor::STORE_HASHES_MASK;
    }

    target.extend_from_slice(&[BODY_CELL, d1, descriptor.d2]);
    if store_hashes {
        write_hashes(cell, descriptor.level_mask(), target);
    }
    target.extend_from_slice(cell.data());
    for child in cell.references() {
        target.extend_from_slice(child.repr_hash().as_slice());
    }
}

/// Appends a body with the whole subtree of the cell.
///
/// Layout: `[1][repr depth: u16 BE][boc]`.
pub(crate) fn encode_subtree_body(cell: &DynCell, target: &mut Vec<u8>) {
    target.push(BODY_SUBTREE);
    target.extend_from_slice(&cell.repr_depth().to_be_bytes());
    target.extend_from_slice(&Boc::encode(cell));
}

/// Graph-related part of the stored body.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct BodyInfo {
    pub depth: u16,
    pub children: SmallVec<[HashBytes; MAX_REF_COUNT]>,
    pub is_subtree: bool,
}

/// Reads the depth and the child hashes without building the cell.
pub(crate) fn parse_body_info(hash: &HashBytes, body: &[u8]) -> Result<BodyInfo, StorageError> {
    match body.first() {
        Some(&BODY_CELL) => {
            let record = ok!(read_record(hash, body));

            let depth = if record.descriptor.store_hashes() {
                let count = record.hashes.len() / HASHES_ITEM_LEN;
                let repr_hash = &record.hashes[(count - 1) * HASH_LEN..count * HASH_LEN];
                if repr_hash != hash.as_slice() {
                    return Err(StorageError::InvalidRow(*hash));
                }

                let offset = count * HASH_LEN + (count - 1) * 2;
                u16::from_be_bytes([record.hashes[offset], record.hashes[offset + 1]])
            } else if record.descriptor.is_pruned_branch() {
                0
            } else {
                return Err(StorageError::InvalidRow(*hash));
            };

            let children = record
                .references
                .chunks_exact(HASH_LEN)
                .map(HashBytes::from_slice)
                .collect();

            Ok(BodyInfo {
                depth,
                children,
                is_subtree: false,
            })
        }
        Some(&BODY_SUBTREE) if body.len() > 3 => Ok(BodyInfo {
            depth: u16::from_be_bytes([body[1], body[2]]),
            children: SmallVec::new(),
            is_subtree: true,
        }),
        _ => Err(StorageError::InvalidRow(*hash)),
    }
}

/// Builds a cell from the stored body.
///
/// Children of single cell bodies are loaded lazily using the specified loader.
pub(crate) fn decode_body(
    loader: &Arc<CellLoader>,
    hash: &HashBytes,
    body: &[u8],
) -> Result<Cell, StorageError> {
    let cell = match body.first() {
        Some(&BODY_CELL) => ok!(decode_cell_body(loader, hash, body)),
        Some(&BODY_SUBTREE) if body.len() > 3 => match Boc::decode(&body[3..]) {
            Ok(cell) => cell,
            Err(_) => return Err(StorageError::InvalidRow(*hash)),
        },
        _ => return Err(StorageError::InvalidRow(*hash)),
    };

    if cell.repr_hash() != hash {
        return Err(StorageError::InvalidRow(*hash));
    }
    Ok(cell)
}

fn decode_cell_body(
    loader: &Arc<CellLoader>,
    hash: &HashBytes,
    body: &[u8],
) -> Result<Cell, StorageError> {
    let record = ok!(read_record(hash, body));
    let bit_len = record.bit_len();

    let mut descriptor = record.descriptor;
    descriptor.d1 &= !CellDescriptor::STORE_HASHES_MASK;

    if descriptor.is_pruned_branch() {
        // Pruned branches are small enough to be rebuilt
        let mut builder = match CellBuilder::from_raw_data(record.data, bit_len) {
            Ok(builder) => builder,
            Err(_) => return Err(StorageError::InvalidRow(*hash)),
        };
        builder.set_exotic(true);
        return builder.build().map_err(StorageError::Cell);
    }

    if !record.descriptor.store_hashes() {
        return Err(StorageError::InvalidRow(*hash));
    }

    let count = record.hashes.len() / HASHES_ITEM_LEN;
    let mut hashes = SmallVec::with_capacity(count);
    for i in 0..count {
        let hash = HashBytes::from_slice(&record.hashes[i * HASH_LEN..(i + 1) * HASH_LEN]);
        let offset = count * HASH_LEN + i * 2;
        let depth = u16::from_be_bytes([record.hashes[offset], record.hashes[offset + 1]]);
        hashes.push((hash, depth));
    }

    let reference_hashes: SmallVec<[HashBytes; MAX_REF_COUNT]> = record
        .references
        .chunks_exact(HASH_LEN)
        .map(HashBytes::from_slice)
        .collect();

    let depth = hashes.last().map(|(_, depth)| *depth).unwrap_or_default();
    for child in &reference_hashes {
        ok!(verify_child(loader, hash, child, depth));
    }

    Ok(Cell::new(StorageCell {
        loader: loader.clone(),
        descriptor,
        bit_len,
        data: Box::from(record.data),
        hashes,
        reference_hashes,
        references: Default::default(),
    }))
}

/// Checks that the child row is alive and its body is well-formed.
///
/// Children are loaded lazily through an infallible interface,
/// so all store inconsistencies must be found while loading the parent.
fn verify_child(
    loader: &CellLoader,
    parent: &HashBytes,
    child: &HashBytes,
    parent_depth: u16,
) -> Result<(), StorageError> {
    let broken = || StorageError::BrokenReference {
        parent: *parent,
        child: *child,
    };

    let row = match ok!(loader.load_row(child)) {
        Some(row) if row.refcount > 0 => row,
        _ => return Err(broken()),
    };
    match parse_body_info(child, &row.body) {
        Ok(info) if info.depth < parent_depth => Ok(()),
        _ => Err(broken()),
    }
}

fn read_record<'a>(
    hash: &HashBytes,
    body: &'a [u8],
) -> Result<crate::boc::de::CellRecord<'a>, StorageError> {
    match read_cell_record(body, 1, HASH_LEN) {
        Ok(record) if record.len + 1 == body.len() => Ok(record),
        _ => Err(StorageError::InvalidRow(*hash)),
    }
}

/// Cell which is loaded from the store.
///
/// Children are loaded on first access using the loader
/// which was used to load this cell. Child rows are verified when
/// the cell is loaded, so a lazy load can only fail if the backend
/// fails to read an immutable snapshot.
pub struct StorageCell {
    loader: Arc<CellLoader>,
    descriptor: CellDescriptor,
    bit_len: u16,
    data: Box<[u8]>,
    hashes: SmallVec<[(HashBytes, u16); 4]>,
    reference_hashes: SmallVec<[HashBytes; MAX_REF_COUNT]>,
    references: [OnceLock<Cell>; MAX_REF_COUNT],
}

impl StorageCell {
    /// Returns the representation hash of the child without loading it.
    pub fn reference_hash(&self, index: u8) -> Option<&HashBytes> {
        self.reference_hashes.get(index as usize)
    }

    fn load_reference(&self, index: u8) -> Option<&Cell> {
        let slot = self.references.get(index as usize)?;
        if let Some(cell) = slot.get() {
            return Some(cell);
        }

        let hash = self.reference_hashes.get(index as usize)?;
        match self.loader.load_cell(hash) {
            Ok(cell) => Some(slot.get_or_init(|| cell)),
            Err(e) => {
                tracing::error!(
                    parent = %self.repr_hash_entry().0,
                    child = %hash,
                    "failed to load child cell: {e}"
                );
                None
            }
        }
    }

    #[inline]
    fn repr_hash_entry(&self) -> &(HashBytes, u16) {
        // NOTE: `hashes` is never empty
        &self.hashes[self.hashes.len() - 1]
    }

    #[inline]
    fn hash_entry(&self, level: u8) -> &(HashBytes, u16) {
        let index = self.descriptor.level_mask().hash_index(level) as usize;
        &self.hashes[std::cmp::min(index, self.hashes.len() - 1)]
    }
}

impl CellImpl for StorageCell {
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
        Some(self.load_reference(index)?.as_ref())
    }

    fn reference_cloned(&self, index: u8) -> Option<Cell> {
        self.load_reference(index).cloned()
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

use std::sync::Arc;

use super::KvError;

/// Key space of the store.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Namespace {
    /// Cell rows keyed by the representation hash.
    Cells,
    /// Arbitrary metadata.
    Meta,
}

impl Namespace {
    /// All namespaces.
    pub const ALL: [Self; 2] = [Self::Cells, Self::Meta];

    /// Returns the name of the namespace (a column family name for RocksDB).
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cells => "cells",
            Self::Meta => "meta",
        }
    }
}

/// Read-only consistent view of the store.
pub trait KvSnapshot: Send + Sync {
    /// Reads a value by key.
    fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Iterates over all entries of the namespace in key order.
    ///
    /// Iteration stops when `f` returns `false`.
    fn for_each(
        &self,
        ns: Namespace,
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError>;
}

/// Sorted byte key-value store with snapshots, atomic batches
/// and the cell rows merge operator.
pub trait KeyValue: Send + Sync {
    /// Reads the latest value by key.
    fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Iterates over the latest entries of the namespace in key order.
    fn for_each(
        &self,
        ns: Namespace,
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError>;

    /// Returns a consistent view of the current state.
    fn snapshot(&self) -> Arc<dyn KvSnapshot>;

    /// Creates an empty write batch.
    fn begin_write_batch(&self) -> WriteBatch {
        WriteBatch::default()
    }

    /// Atomically applies all batch operations.
    fn commit_write_batch(&self, batch: WriteBatch) -> Result<(), KvError>;
}

impl<T: KeyValue + ?Sized> KeyValue for Arc<T> {
    #[inline]
    fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        T::get(self, ns, key)
    }

    #[inline]
    fn for_each(
        &self,
        ns: Namespace,
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError> {
        T::for_each(self, ns, f)
    }

    #[inline]
    fn snapshot(&self) -> Arc<dyn KvSnapshot> {
        T::snapshot(self)
    }

    #[inline]
    fn begin_write_batch(&self) -> WriteBatch {
        T::begin_write_batch(self)
    }

    #[inline]
    fn commit_write_batch(&self, batch: WriteBatch) -> Result<(), KvError> {
        T::commit_write_batch(self, batch)
    }
}

/// A single write batch operation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BatchOp {
    /// Replaces the value.
    Put {
        /// Target namespace.
        ns: Namespace,
        /// Entry key.
        key: Vec<u8>,
        /// New value.
        value: Vec<u8>,
    },
    /// Merges the operand into the existing value.
    Merge {
        /// Target namespace.
        ns: Namespace,
        /// Entry key.
        key: Vec<u8>,
        /// Merge operand.
        value: Vec<u8>,
    },
    /// Removes the value.
    Delete {
        /// Target namespace.
        ns: Namespace,
        /// Entry key.
        key: Vec<u8>,
    },
}

/// Ordered list of operations which are applied atomically.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Adds a put operation.
    pub fn put(&mut self, ns: Namespace, key: &[u8], value: &[u8]) {
        self.ops.push(BatchOp::Put {
            ns,
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    /// Adds a merge operation.
    pub fn merge(&mut self, ns: Namespace, key: &[u8], value: Vec<u8>) {
        self.ops.push(BatchOp::Merge {
            ns,
            key: key.to_vec(),
            value,
        });
    }

    /// Adds a delete operation.
    pub fn delete(&mut self, ns: Namespace, key: &[u8]) {
        self.ops.push(BatchOp::Delete {
            ns,
            key: key.to_vec(),
        });
    }

    /// Returns the number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` if the batch contains no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns an iterator over the operations.
    pub fn iter(&self) -> std::slice::Iter<'_, BatchOp> {
        self.ops.iter()
    }
}

impl IntoIterator for WriteBatch {
    type Item = BatchOp;
    type IntoIter = std::vec::IntoIter<BatchOp>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// Stored cell row: `[refcount: i64 LE][root_refs: i64 LE][body]`.
///
/// The same layout is used for merge operands, where counters are diffs
/// and an empty body means "keep the existing one".
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CellRow<'a> {
    /// The total number of references to the cell (including roots).
    pub refcount: i64,
    /// The number of references to the cell as a root.
    pub root_refs: i64,
    /// Encoded cell body.
    pub body: &'a [u8],
}

impl<'a> CellRow<'a> {
    /// Size of the counters prefix.
    pub const HEADER_LEN: usize = 16;

    /// Parses a row or a merge operand.
    pub fn decode(value: &'a [u8]) -> Option<Self> {
        if value.len() < Self::HEADER_LEN {
            return None;
        }
        let (refcount, rest) = value.split_at(8);
        let (root_refs, body) = rest.split_at(8);
        Some(Self {
            refcount: i64::from_le_bytes(refcount.try_into().ok()?),
            root_refs: i64::from_le_bytes(root_refs.try_into().ok()?),
            body,
        })
    }

    /// Appends the encoded row to the target buffer.
    pub fn encode_to(&self, target: &mut Vec<u8>) {
        target.reserve(Self::HEADER_LEN + self.body.len());
        target.extend_from_slice(&self.refcount.to_le_bytes());
        target.extend_from_slice(&self.root_refs.to_le_bytes());
        target.extend_from_slice(self.body);
    }

    /// Returns the encoded row.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut result = Vec::new();
        self.encode_to(&mut result);
        result
    }
}

/// Associative merge operator for cell rows.
///
/// Sums counters and keeps the first non-empty body.
/// Returns `None` if some operand is malformed.
pub fn merge_cell_rows<'a, I>(existing: Option<&[u8]>, operands: I) -> Option<Vec<u8>>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut result = match existing {
        Some(value) => match CellRow::decode(value) {
            Some(row) => row,
            None => {
                tracing::error!(len = value.len(), "malformed cell row");
                return None;
            }
        },
        None => CellRow {
            refcount: 0,
            root_refs: 0,
            body: &[],
        },
    };

    let mut operand_body: &[u8] = &[];
    for operand in operands {
        let Some(row) = CellRow::decode(operand) else {
            tracing::error!(len = operand.len(), "malformed cell row operand");
            return None;
        };
        result.refcount = result.refcount.wrapping_add(row.refcount);
        result.root_refs = result.root_refs.wrapping_add(row.root_refs);
        if result.body.is_empty() && operand_body.is_empty() {
            operand_body = row.body;
        }
    }

    let body = if result.body.is_empty() {
        operand_body
    } else {
        result.body
    };

    let mut target = Vec::new();
    CellRow {
        refcount: result.refcount,
        root_refs: result.root_refs,
        body,
    }
    .encode_to(&mut target);
    Some(target)
}

/// Compaction filter for cell rows.
///
/// Returns `false` for rows which are no longer referenced.
/// Malformed rows are kept.
pub fn keep_cell_row(value: &[u8]) -> bool {
    match CellRow::decode(value) {
        Some(row) => row.refcount > 0,
        None => true,
    }
}

//! Bag-of-cells storage engine.
//!
//! ## `Cell` vs `CellSlice` vs `CellBuilder`
//!
//! - [`Cell`] is an immutable tree and provides only basic methods for accessing
//!   nodes and some meta info.
//!
//! - [`CellSlice`] is a read-only view for a part of some cell. It can only
//!   be obtained from an existing cell. A cell contains **up to 1023 bits** and
//!   **up to 4 references**. Minimal data unit is bit, so a cell slice is similar
//!   to a couple of ranges (bit range and refs range).
//!
//! - [`CellBuilder`] is used to create a new cell. It is used as an append-only
//!   data structure and is the only way to create a new cell with the provided data.
//!   Cell creation depends on a context (e.g. message creation in a wallet or a
//!   TVM execution with gas tracking), so [`CellBuilder::build_ext`] accepts
//!   a [`CellContext`] parameter which can be used to track and modify cells creation.
//!
//! ## BOC
//!
//! BOC (Bag Of Cells) is a format for representing a tree of cells as bytes.
//! [`Boc`] type is used to convert between bytes and **cells** of the same family.
//! [`LazyBoc`] resolves cells on demand without materializing the whole bag.
//!
//! ## Merkle stuff
//!
//! - Pruned branch is a "building block" of merkle structures. A single pruned branch
//!   cell replaces a whole subtree and contains just the hash of its root cell hash.
//!
//! - [`MerkleProof`] contains a subset of original tree of cells. In most cases
//!   it is created from [`UsageTree`] of some visited cells. Merkle proof is used
//!   to proof that something was presented in the origin tree and provide some additional
//!   context.
//!
//! - [`MerkleUpdate`] describes a difference between two trees of cells. It can be
//!   applied to old cell to create a new cell.
//!
//! ## Storage
//!
//! [`db`] keeps cells in a key-value store keyed by their representation hash,
//! with a persisted reference counter per row and a two-phase commit.
//!
//! [`Cell`]: cell::Cell
//! [`CellSlice`]: cell::CellSlice
//! [`CellBuilder`]: cell::CellBuilder
//! [`CellBuilder::build_ext`]: cell::CellBuilder::build_ext
//! [`CellContext`]: cell::CellContext
//! [`Boc`]: boc::Boc
//! [`LazyBoc`]: boc::LazyBoc
//! [`MerkleProof`]: merkle::MerkleProof
//! [`MerkleUpdate`]: merkle::MerkleUpdate
//! [`UsageTree`]: cell::UsageTree

#![warn(missing_docs)]

/// Prevents using `From::from` for plain error conversion.
macro_rules! ok {
    ($e:expr $(,)?) => {
        match $e {
            core::result::Result::Ok(val) => val,
            core::result::Result::Err(err) => return core::result::Result::Err(err),
        }
    };
}

pub mod boc;
pub mod cell;
pub mod db;
pub mod error;
pub mod merkle;
pub mod prelude;
pub mod util;

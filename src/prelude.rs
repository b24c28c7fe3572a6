//! The `cellar` prelude.
//!
//! This brings into scope a number of traits and commonly used types.

pub use crate::boc::{Boc, BocMode, BocTag, LazyBoc};
pub use crate::cell::{
    Cell, CellBuilder, CellContext, CellDescriptor, CellImpl, CellSlice, CellType, DynCell,
    HashBytes, LevelMask, LoadCell, Store, UsageTree, UsageTreeMode,
};
pub use crate::db::{CellDb, CellDbConfig, KeyValue};
pub use crate::merkle::{MerkleFilter, MerkleProof, MerkleUpdate};

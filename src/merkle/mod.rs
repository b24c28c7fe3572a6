//! Merkle proofs and updates.

use std::collections::HashSet;
use std::hash::BuildHasher;

use crate::cell::{HashBytes, UsageTree, UsageTreeWithSubtrees};

pub use self::proof::{MerkleProof, MerkleProofBuilder, MerkleProofExtBuilder};
pub use self::pruned_branch::make_pruned_branch;
pub use self::update::{MerkleUpdate, MerkleUpdateBuilder, MerkleUpdateStats};

mod combine;
mod proof;
mod pruned_branch;
mod update;

#[cfg(test)]
mod tests;

/// A cell tree filter that controls which cells will be included
/// in the Merkle proof.
pub trait MerkleFilter {
    /// Returns how the cell with the specified representation hash
    /// must be handled.
    fn check(&self, cell: &HashBytes) -> FilterAction;
}

/// Cell filter action.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FilterAction {
    /// Replace the cell with a pruned branch (if it has references).
    Skip,
    /// Include the cell and check its children.
    Include,
    /// Include the cell with its whole subtree as is.
    IncludeSubtree,
}

impl<T: MerkleFilter + ?Sized> MerkleFilter for &T {
    #[inline]
    fn check(&self, cell: &HashBytes) -> FilterAction {
        <T as MerkleFilter>::check(self, cell)
    }
}

impl<T: MerkleFilter + ?Sized> MerkleFilter for Box<T> {
    #[inline]
    fn check(&self, cell: &HashBytes) -> FilterAction {
        <T as MerkleFilter>::check(self, cell)
    }
}

impl MerkleFilter for UsageTree {
    fn check(&self, cell: &HashBytes) -> FilterAction {
        if self.contains(cell) {
            FilterAction::Include
        } else {
            FilterAction::Skip
        }
    }
}

impl MerkleFilter for UsageTreeWithSubtrees {
    fn check(&self, cell: &HashBytes) -> FilterAction {
        if self.contains_subtree(cell) {
            FilterAction::IncludeSubtree
        } else if self.contains_direct(cell) {
            FilterAction::Include
        } else {
            FilterAction::Skip
        }
    }
}

impl<S: BuildHasher> MerkleFilter for HashSet<HashBytes, S> {
    fn check(&self, cell: &HashBytes) -> FilterAction {
        if self.contains(cell) {
            FilterAction::Include
        } else {
            FilterAction::Skip
        }
    }
}

impl<S: BuildHasher> MerkleFilter for HashSet<&HashBytes, S> {
    fn check(&self, cell: &HashBytes) -> FilterAction {
        if self.contains(cell) {
            FilterAction::Include
        } else {
            FilterAction::Skip
        }
    }
}

/// Closure-based filter.
///
/// ```
/// # use cellar::prelude::*;
/// # use cellar::merkle::{FilterAction, FilterFn};
/// let keep_all = FilterFn(|_: &HashBytes| FilterAction::Include);
/// let proof = MerkleProof::create(Cell::empty_cell_ref(), keep_all).build();
/// assert!(proof.is_ok());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FilterFn<F>(pub F);

impl<F> MerkleFilter for FilterFn<F>
where
    F: Fn(&HashBytes) -> FilterAction,
{
    #[inline]
    fn check(&self, cell: &HashBytes) -> FilterAction {
        (self.0)(cell)
    }
}

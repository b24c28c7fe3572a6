use smallvec::SmallVec;

use super::MerkleProof;
use crate::cell::*;
use crate::error::Error;
use crate::util::unlikely;

impl MerkleProof {
    /// Merges two proofs of the same tree into a proof which contains
    /// the cells of both, using an empty cell context.
    pub fn combine(&self, other: &Self) -> Result<Self, Error> {
        self.combine_ext(other, Cell::empty_context())
    }

    /// Merges two proofs of the same tree using the specified cell context.
    ///
    /// Both trees are walked in lock step.
    pub fn combine_ext(&self, other: &Self, context: &dyn CellContext) -> Result<Self, Error> {
        self.combine_impl(other, false, context)
    }

    /// Same as [`combine`], but reuses identical subtrees and subtrees
    /// without pruned branches instead of rebuilding them.
    ///
    /// [`combine`]: Self::combine
    pub fn combine_fast(&self, other: &Self) -> Result<Self, Error> {
        self.combine_fast_ext(other, Cell::empty_context())
    }

    /// Same as [`combine_ext`], but reuses identical subtrees and subtrees
    /// without pruned branches instead of rebuilding them.
    ///
    /// [`combine_ext`]: Self::combine_ext
    pub fn combine_fast_ext(&self, other: &Self, context: &dyn CellContext) -> Result<Self, Error> {
        self.combine_impl(other, true, context)
    }

    fn combine_impl(
        &self,
        other: &Self,
        fast: bool,
        context: &dyn CellContext,
    ) -> Result<Self, Error> {
        if self.hash != other.hash || self.depth != other.depth {
            return Err(Error::InvalidData);
        }

        let cell = ok!(Combiner {
            fast,
            context,
            cache: Default::default(),
        }
        .run(&self.cell, &other.cell, 0));

        Ok(Self {
            hash: self.hash,
            depth: self.depth,
            cell,
        })
    }
}

struct Combiner<'a> {
    fast: bool,
    context: &'a dyn CellContext,
    cache: ahash::HashMap<(HashBytes, HashBytes, u8), Cell>,
}

impl Combiner<'_> {
    fn run(&mut self, left: &Cell, right: &Cell, merkle_depth: u8) -> Result<Cell, Error> {
        struct Frame {
            left: Cell,
            right: Cell,
            merkle_depth: u8,
            children_depth: u8,
            index: u8,
            children: SmallVec<[Cell; MAX_REF_COUNT]>,
        }

        impl Frame {
            fn new(left: Cell, right: Cell, merkle_depth: u8) -> Self {
                let children_depth = merkle_depth + left.as_ref().descriptor().is_merkle() as u8;
                Self {
                    left,
                    right,
                    merkle_depth,
                    children_depth,
                    index: 0,
                    children: SmallVec::new(),
                }
            }
        }

        if let Some(cell) = ok!(self.try_resolve(left, right, merkle_depth)) {
            return Ok(cell);
        }

        let mut stack = vec![Frame::new(left.clone(), right.clone(), merkle_depth)];

        while let Some(last) = stack.last_mut() {
            let index = last.index;
            if index < last.left.as_ref().reference_count() {
                last.index += 1;

                let (Some(left), Some(right)) = (
                    last.left.as_ref().reference_cloned(index),
                    last.right.as_ref().reference_cloned(index),
                ) else {
                    return Err(Error::InvalidCell);
                };

                let children_depth = last.children_depth;
                match ok!(self.try_resolve(&left, &right, children_depth)) {
                    Some(cell) => last.children.push(cell),
                    None => stack.push(Frame::new(left, right, children_depth)),
                }
                continue;
            }

            let Some(last) = stack.pop() else {
                break;
            };

            let mut builder = CellBuilder::new();
            builder.set_exotic(last.left.as_ref().is_exotic());
            ok!(builder.store_cell_data(last.left.as_ref()));
            ok!(builder.set_references(last.children));
            let cell = ok!(builder.build_ext(self.context));

            self.cache.insert(
                (
                    *last.left.as_ref().repr_hash(),
                    *last.right.as_ref().repr_hash(),
                    last.merkle_depth,
                ),
                cell.clone(),
            );

            match stack.last_mut() {
                Some(parent) => parent.children.push(cell),
                None => return Ok(cell),
            }
        }

        Err(Error::InvalidCell)
    }

    /// Returns the merged cell if it can be chosen without descending.
    fn try_resolve(
        &self,
        left: &Cell,
        right: &Cell,
        merkle_depth: u8,
    ) -> Result<Option<Cell>, Error> {
        let l = left.as_ref();
        let r = right.as_ref();

        // Both sides must describe the same original cell
        if unlikely(l.hash(merkle_depth) != r.hash(merkle_depth)) {
            return Err(Error::InvalidData);
        }

        if is_pruned_at(l, merkle_depth) {
            return Ok(Some(right.clone()));
        }
        if is_pruned_at(r, merkle_depth) {
            return Ok(Some(left.clone()));
        }

        if self.fast {
            if l.repr_hash() == r.repr_hash() {
                return Ok(Some(left.clone()));
            }
            if !l.level_mask().contains(merkle_depth + 1) {
                return Ok(Some(left.clone()));
            }
            if !r.level_mask().contains(merkle_depth + 1) {
                return Ok(Some(right.clone()));
            }
        }

        if let Some(cell) = self
            .cache
            .get(&(*l.repr_hash(), *r.repr_hash(), merkle_depth))
        {
            return Ok(Some(cell.clone()));
        }

        if unlikely(
            l.reference_count() != r.reference_count()
                || l.is_exotic() != r.is_exotic()
                || l.bit_len() != r.bit_len()
                || l.data() != r.data(),
        ) {
            return Err(Error::InvalidData);
        }

        if l.reference_count() == 0 {
            return Ok(Some(left.clone()));
        }

        Ok(None)
    }
}

fn is_pruned_at(cell: &DynCell, merkle_depth: u8) -> bool {
    cell.cell_type() == CellType::PrunedBranch && cell.level_mask().contains(merkle_depth + 1)
}

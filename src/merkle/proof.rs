use smallvec::SmallVec;

use super::{make_pruned_branch, FilterAction, MerkleFilter};
use crate::cell::*;
use crate::error::Error;
use crate::util::unlikely;

/// Parsed Merkle proof representation.
///
/// NOTE: Serialized into `MerkleProof` cell.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MerkleProof {
    /// Representation hash of the original cell.
    pub hash: HashBytes,
    /// Representation depth of the origin cell.
    pub depth: u16,
    /// Partially pruned tree with the contents of the original cell.
    #[cfg_attr(feature = "serde", serde(with = "crate::boc::Boc"))]
    pub cell: Cell,
}

impl Eq for MerkleProof {}

impl PartialEq for MerkleProof {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.depth == other.depth
            && self.cell.as_ref() == other.cell.as_ref()
    }
}

impl Default for MerkleProof {
    fn default() -> Self {
        Self {
            hash: *EMPTY_CELL_HASH,
            depth: 0,
            cell: Cell::empty_cell(),
        }
    }
}

impl<'a> LoadCell<'a> for MerkleProof {
    fn load_from_cell(cell: &'a DynCell) -> Result<Self, Error> {
        if unlikely(!cell.is_exotic()) {
            return Err(Error::UnexpectedOrdinaryCell);
        }

        let mut s = cell.as_slice_allow_exotic();
        if s.size_bits() != Self::BITS || s.size_refs() != Self::REFS {
            return Err(Error::CellUnderflow);
        }

        if ok!(s.load_u8()) != CellType::MerkleProof.to_byte() {
            return Err(Error::InvalidCell);
        }

        let res = Self {
            hash: ok!(s.load_u256()),
            depth: ok!(s.load_u16()),
            cell: ok!(s.load_reference_cloned()),
        };

        if res.cell.as_ref().hash(0) == &res.hash && res.cell.as_ref().depth(0) == res.depth {
            Ok(res)
        } else {
            Err(Error::InvalidCell)
        }
    }
}

impl Store for MerkleProof {
    fn store_into(&self, b: &mut CellBuilder, _: &dyn CellContext) -> Result<(), Error> {
        if !b.has_capacity(Self::BITS, Self::REFS) {
            return Err(Error::CellOverflow);
        }

        b.set_exotic(true);
        ok!(b.store_u8(CellType::MerkleProof.to_byte()));
        ok!(b.store_u256(&self.hash));
        ok!(b.store_u16(self.depth));
        b.store_reference(self.cell.clone())
    }
}

impl MerkleProof {
    /// The number of data bits that the Merkle proof occupies.
    pub const BITS: u16 = 8 + 256 + 16;
    /// The number of references that the Merkle proof occupies.
    pub const REFS: u8 = 1;

    /// Starts building a Merkle proof for the specified root,
    /// using cells determined by filter.
    pub fn create<'a, F>(root: &'a DynCell, f: F) -> MerkleProofBuilder<'a, F>
    where
        F: MerkleFilter + 'a,
    {
        MerkleProofBuilder::new(root, f)
    }

    /// Create a Merkle proof for the single cell with the specified
    /// representation hash.
    ///
    /// Only ancestors of the first occurrence are included in the proof.
    ///
    /// Proof creation will fail if the specified child is not found.
    pub fn create_for_cell<'a>(
        root: &'a DynCell,
        child_hash: &'a HashBytes,
    ) -> MerkleProofBuilder<'a, impl MerkleFilter + 'a> {
        struct RootOrChild<'a> {
            cells: ahash::HashSet<&'a HashBytes>,
            child_hash: &'a HashBytes,
        }

        impl MerkleFilter for RootOrChild<'_> {
            fn check(&self, cell: &HashBytes) -> FilterAction {
                if self.cells.contains(cell) || cell == self.child_hash {
                    FilterAction::Include
                } else {
                    FilterAction::Skip
                }
            }
        }

        let root = root.untracked();

        let mut visited = ahash::HashSet::<&HashBytes>::default();
        let mut stack = Vec::new();
        if root.repr_hash() != child_hash {
            stack.push(root.references());
        }

        while let Some(last_cells) = stack.last_mut() {
            match last_cells.next() {
                Some(child) if child.repr_hash() == child_hash => break,
                Some(child) => {
                    if visited.insert(child.repr_hash()) {
                        stack.push(child.references());
                    }
                }
                None => {
                    stack.pop();
                }
            }
        }

        let mut cells = ahash::HashSet::with_capacity_and_hasher(stack.len(), Default::default());
        for item in stack {
            cells.insert(item.cell().repr_hash());
        }

        MerkleProofBuilder::new(root, RootOrChild { cells, child_hash })
    }

    /// Returns the proof contents as seen from the original tree.
    ///
    /// Hashes of the returned cell match the hashes of the original cell.
    pub fn virtualize(&self) -> Cell {
        self.cell.virtualize(0)
    }

    /// Unwraps the contents of the serialized proof cell, which is located
    /// at the specified merkle depth (1 for a top-level proof).
    pub fn virtualize_cell(proof: &DynCell, level: u8) -> Result<Cell, Error> {
        if unlikely(level == 0 || level > LevelMask::MAX_LEVEL + 1) {
            return Err(Error::InvalidData);
        }
        match proof.cell_type() {
            CellType::MerkleProof => {}
            CellType::Ordinary => return Err(Error::UnexpectedOrdinaryCell),
            _ => return Err(Error::UnexpectedExoticCell),
        }

        match proof.reference_cloned(0) {
            Some(child) => Ok(child.virtualize(level - 1)),
            None => Err(Error::InvalidCell),
        }
    }
}

/// Helper struct to build a Merkle proof.
pub struct MerkleProofBuilder<'a, F> {
    root: &'a DynCell,
    filter: F,
    allow_different_root: bool,
}

impl<'a, F> MerkleProofBuilder<'a, F>
where
    F: MerkleFilter,
{
    /// Creates a new Merkle proof builder for the tree with the specified root,
    /// using cells determined by filter.
    pub fn new(root: &'a DynCell, f: F) -> Self {
        Self {
            root: root.untracked(),
            filter: f,
            allow_different_root: false,
        }
    }

    /// Allows the root cell to be skipped by the filter.
    ///
    /// The root is always included in the proof in that case.
    pub fn allow_different_root(mut self, allow: bool) -> Self {
        self.allow_different_root = allow;
        self
    }

    /// Extends the builder to additionally save all hashes
    /// of cells not included in Merkle proof.
    pub fn track_pruned_branches(self) -> MerkleProofExtBuilder<'a, F> {
        MerkleProofExtBuilder {
            root: self.root,
            filter: self.filter,
            allow_different_root: self.allow_different_root,
        }
    }

    /// Builds a Merkle proof using the specified cell context.
    pub fn build_ext(self, context: &dyn CellContext) -> Result<MerkleProof, Error> {
        let root = self.root;
        let cell = ok!(self.build_raw_ext(context));
        Ok(MerkleProof {
            hash: *root.repr_hash(),
            depth: root.repr_depth(),
            cell,
        })
    }

    /// Builds a Merkle proof using an empty cell context.
    pub fn build(self) -> Result<MerkleProof, Error> {
        self.build_ext(Cell::empty_context())
    }

    /// Builds a Merkle proof child cell using the specified cell context.
    pub fn build_raw_ext(self, context: &dyn CellContext) -> Result<Cell, Error> {
        BuilderImpl {
            root: self.root,
            filter: &self.filter,
            cells: Default::default(),
            pruned_branches: None,
            context,
            allow_different_root: self.allow_different_root,
        }
        .build()
    }
}

/// Helper struct to build a Merkle proof and keep track of all pruned cells.
pub struct MerkleProofExtBuilder<'a, F> {
    root: &'a DynCell,
    filter: F,
    allow_different_root: bool,
}

impl<'a, F> MerkleProofExtBuilder<'a, F>
where
    F: MerkleFilter,
{
    /// Allows the root cell to be skipped by the filter.
    pub fn allow_different_root(mut self, allow: bool) -> Self {
        self.allow_different_root = allow;
        self
    }

    /// Builds a Merkle proof child cell using the specified cell context.
    ///
    /// Returns the proof cell and representation hashes of all pruned cells.
    pub fn build_raw_ext(
        self,
        context: &dyn CellContext,
    ) -> Result<(Cell, ahash::HashSet<&'a HashBytes>), Error> {
        let mut builder = BuilderImpl {
            root: self.root,
            filter: &self.filter,
            cells: Default::default(),
            pruned_branches: Some(Default::default()),
            context,
            allow_different_root: self.allow_different_root,
        };
        let cell = ok!(builder.build());
        let pruned_branches = builder.pruned_branches.unwrap_or_default();
        Ok((cell, pruned_branches))
    }
}

struct BuilderImpl<'a, 'b> {
    root: &'a DynCell,
    filter: &'b dyn MerkleFilter,
    cells: ahash::HashMap<(&'a HashBytes, u8), Cell>,
    pruned_branches: Option<ahash::HashSet<&'a HashBytes>>,
    context: &'b dyn CellContext,
    allow_different_root: bool,
}

impl<'a> BuilderImpl<'a, '_> {
    fn build(&mut self) -> Result<Cell, Error> {
        struct Node<'a> {
            references: RefsIter<'a>,
            descriptor: CellDescriptor,
            merkle_depth: u8,
            children: SmallVec<[Cell; MAX_REF_COUNT]>,
        }

        if !self.allow_different_root
            && self.filter.check(self.root.repr_hash()) == FilterAction::Skip
        {
            return Err(Error::EmptyProof);
        }

        let mut stack = Vec::with_capacity(self.root.repr_depth() as usize + 1);

        // Push root node
        let root_descriptor = self.root.descriptor();
        stack.push(Node {
            references: self.root.references(),
            descriptor: root_descriptor,
            merkle_depth: root_descriptor.is_merkle() as u8,
            children: SmallVec::new(),
        });

        while let Some(last) = stack.last_mut() {
            if let Some(child) = last.references.next() {
                // Process children if they are left
                let child_repr_hash = child.repr_hash();
                let child = if let Some(child) =
                    self.cells.get(&(child_repr_hash, last.merkle_depth))
                {
                    // Reuse processed cells
                    child.clone()
                } else {
                    let descriptor = child.descriptor();

                    match self.filter.check(child_repr_hash) {
                        // Replace all skipped subtrees with pruned branch cells
                        FilterAction::Skip if descriptor.reference_count() > 0 => {
                            let pruned =
                                ok!(make_pruned_branch_cold(child, last.merkle_depth, self.context));

                            if let Some(pruned_branches) = &mut self.pruned_branches {
                                pruned_branches.insert(child_repr_hash);
                            }

                            self.cells
                                .insert((child_repr_hash, last.merkle_depth), pruned.clone());
                            pruned
                        }
                        // Included subtrees and leaves are used as is
                        FilterAction::IncludeSubtree | FilterAction::Skip => {
                            match last.references.peek_prev_cloned() {
                                Some(child) => child,
                                None => return Err(Error::InvalidCell),
                            }
                        }
                        // All other cells will be included in a different branch
                        FilterAction::Include => {
                            let merkle_depth = last.merkle_depth + descriptor.is_merkle() as u8;

                            stack.push(Node {
                                references: child.references(),
                                descriptor,
                                merkle_depth,
                                children: SmallVec::new(),
                            });
                            continue;
                        }
                    }
                };

                last.children.push(child);
            } else if let Some(last) = stack.pop() {
                // Build a new cell if there are no child nodes left to process
                let cell = last.references.cell();

                let mut builder = CellBuilder::new();
                builder.set_exotic(last.descriptor.is_exotic());
                ok!(builder.store_cell_data(cell));
                ok!(builder.set_references(last.children));
                let proof_cell = ok!(builder.build_ext(self.context));

                // Save this cell as processed cell
                let parent_merkle_depth = last.merkle_depth - last.descriptor.is_merkle() as u8;
                self.cells
                    .insert((cell.repr_hash(), parent_merkle_depth), proof_cell.clone());

                match stack.last_mut() {
                    // Append this cell to the ancestor
                    Some(last) => last.children.push(proof_cell),
                    // Or return it as a result (for the root node)
                    None => return Ok(proof_cell),
                }
            }
        }

        // Something is wrong if we are here
        Err(Error::InvalidCell)
    }
}

#[cold]
fn make_pruned_branch_cold(
    cell: &DynCell,
    merkle_depth: u8,
    context: &dyn CellContext,
) -> Result<Cell, Error> {
    make_pruned_branch(cell, merkle_depth, context)
}

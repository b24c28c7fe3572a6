use std::collections::hash_map;

use super::{make_pruned_branch, FilterAction, MerkleFilter, MerkleProofBuilder};
use crate::cell::*;
use crate::error::Error;
use crate::util::unlikely;

/// Parsed Merkle update representation.
///
/// NOTE: Serialized into `MerkleUpdate` cell.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MerkleUpdate {
    /// Representation hash of the original cell.
    pub old_hash: HashBytes,
    /// Representation hash of the updated cell.
    pub new_hash: HashBytes,
    /// Representation depth of the original cell.
    pub old_depth: u16,
    /// Representation depth of the updated cell.
    pub new_depth: u16,
    /// Partially pruned tree with unchanged cells of the origin cell.
    #[cfg_attr(feature = "serde", serde(with = "crate::boc::Boc"))]
    pub old: Cell,
    /// Partially pruned tree with all cells that are not in the original cell.
    #[cfg_attr(feature = "serde", serde(with = "crate::boc::Boc"))]
    pub new: Cell,
}

impl Eq for MerkleUpdate {}
impl PartialEq for MerkleUpdate {
    fn eq(&self, other: &Self) -> bool {
        self.old_hash == other.old_hash
            && self.new_hash == other.new_hash
            && self.old_depth == other.old_depth
            && self.new_depth == other.new_depth
            && self.old.as_ref() == other.old.as_ref()
            && self.new.as_ref() == other.new.as_ref()
    }
}

impl Default for MerkleUpdate {
    fn default() -> Self {
        let empty_cell = Cell::empty_cell();
        Self {
            old_hash: *EMPTY_CELL_HASH,
            new_hash: *EMPTY_CELL_HASH,
            old_depth: 0,
            new_depth: 0,
            old: empty_cell.clone(),
            new: empty_cell,
        }
    }
}

impl<'a> LoadCell<'a> for MerkleUpdate {
    fn load_from_cell(cell: &'a DynCell) -> Result<Self, Error> {
        if unlikely(!cell.is_exotic()) {
            return Err(Error::UnexpectedOrdinaryCell);
        }

        let mut s = cell.as_slice_allow_exotic();
        if s.size_bits() != Self::BITS || s.size_refs() != Self::REFS {
            return Err(Error::CellUnderflow);
        }

        if ok!(s.load_u8()) != CellType::MerkleUpdate.to_byte() {
            return Err(Error::InvalidCell);
        }

        let res = Self {
            old_hash: ok!(s.load_u256()),
            new_hash: ok!(s.load_u256()),
            old_depth: ok!(s.load_u16()),
            new_depth: ok!(s.load_u16()),
            old: ok!(s.load_reference_cloned()),
            new: ok!(s.load_reference_cloned()),
        };
        debug_assert!(s.is_data_empty() && s.is_refs_empty());

        if res.old.as_ref().hash(0) == &res.old_hash
            && res.old.as_ref().depth(0) == res.old_depth
            && res.new.as_ref().hash(0) == &res.new_hash
            && res.new.as_ref().depth(0) == res.new_depth
        {
            Ok(res)
        } else {
            Err(Error::InvalidCell)
        }
    }
}

impl Store for MerkleUpdate {
    fn store_into(&self, b: &mut CellBuilder, _: &dyn CellContext) -> Result<(), Error> {
        if !b.has_capacity(Self::BITS, Self::REFS) {
            return Err(Error::CellOverflow);
        }

        b.set_exotic(true);
        ok!(b.store_u8(CellType::MerkleUpdate.to_byte()));
        ok!(b.store_u256(&self.old_hash));
        ok!(b.store_u256(&self.new_hash));
        ok!(b.store_u32(((self.old_depth as u32) << 16) | self.new_depth as u32));
        ok!(b.store_reference(self.old.clone()));
        b.store_reference(self.new.clone())
    }
}

/// Size statistics of a Merkle update.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct MerkleUpdateStats {
    /// Unique cells of the updated tree which are not in the original tree.
    pub new_cells: u64,
    /// Total data bits of `new_cells`.
    pub new_bits: u64,
    /// Unique cells of the original tree which are required to apply the update.
    pub old_cells: u64,
    /// Total data bits of `old_cells`.
    pub old_bits: u64,
}

impl MerkleUpdateStats {
    /// Difference between the number of added and touched cells.
    pub fn cells_delta(&self) -> i64 {
        self.new_cells as i64 - self.old_cells as i64
    }

    /// Difference between the number of added and touched bits.
    pub fn bits_delta(&self) -> i64 {
        self.new_bits as i64 - self.old_bits as i64
    }
}

impl MerkleUpdate {
    /// The number of data bits that the Merkle update occupies.
    pub const BITS: u16 = 8 + (256 + 16) * 2;
    /// The number of references that the Merkle update occupies.
    pub const REFS: u8 = 2;

    /// Starts building a Merkle update between the specified cells,
    /// using old cells determined by filter.
    pub fn create<'a, F>(old: &'a DynCell, new: &'a DynCell, f: F) -> MerkleUpdateBuilder<'a, F>
    where
        F: MerkleFilter + 'a,
    {
        MerkleUpdateBuilder::new(old, new, f)
    }

    /// Checks that all cells which are reused by the new tree
    /// are presented in the old tree.
    pub fn validate(&self) -> Result<(), Error> {
        if self.old.as_ref().hash(0) != &self.old_hash
            || self.old.as_ref().depth(0) != self.old_depth
            || self.new.as_ref().hash(0) != &self.new_hash
            || self.new.as_ref().depth(0) != self.new_depth
        {
            return Err(Error::InvalidCell);
        }

        self.find_old_cells().map(|_| ())
    }

    /// Checks whether this update can be applied to the specified cell.
    pub fn may_apply(&self, old: &DynCell) -> Result<(), Error> {
        if old.repr_hash() != &self.old_hash {
            return Err(Error::InvalidData);
        }
        self.validate()
    }

    /// Tries to apply this Merkle update to the specified cell,
    /// producing a new cell and using an empty cell context.
    pub fn apply(&self, old: &Cell) -> Result<Cell, Error> {
        self.apply_ext(old, Cell::empty_context())
    }

    /// Tries to apply this Merkle update to the specified cell,
    /// producing a new cell and using the specified cell context.
    pub fn apply_ext(&self, old: &Cell, context: &dyn CellContext) -> Result<Cell, Error> {
        if old.as_ref().repr_hash() != &self.old_hash {
            return Err(Error::InvalidData);
        }

        if self.old_hash == self.new_hash {
            return Ok(old.clone());
        }

        struct Applier<'a> {
            old_cells: ahash::HashMap<HashBytes, Cell>,
            new_cells: ahash::HashMap<HashBytes, Cell>,
            context: &'a dyn CellContext,
        }

        impl Applier<'_> {
            fn run(&mut self, cell: &DynCell, merkle_depth: u8) -> Result<Cell, Error> {
                let descriptor = cell.descriptor();
                let child_merkle_depth = merkle_depth + descriptor.is_merkle() as u8;

                // Start building a new cell
                let mut result = CellBuilder::new();
                result.set_exotic(descriptor.is_exotic());

                // Build all child cells
                for child in cell.references().cloned() {
                    let child_descriptor = child.as_ref().descriptor();

                    let child = if child_descriptor.is_pruned_branch()
                        && child_descriptor
                            .level_mask()
                            .contains(child_merkle_depth + 1)
                    {
                        // Replace pruned branches with old cells
                        match self.old_cells.get(child.as_ref().hash(child_merkle_depth)) {
                            Some(cell) => cell.clone(),
                            None => return Err(Error::InvalidData),
                        }
                    } else if child_descriptor.reference_count() == 0 {
                        child
                    } else {
                        // Build a child cell if it hasn't been built before
                        let child_hash = child.as_ref().repr_hash();
                        if let Some(child) = self.new_cells.get(child_hash) {
                            child.clone()
                        } else {
                            let new_child = ok!(self.run(child.as_ref(), child_merkle_depth));
                            self.new_cells.insert(*child_hash, new_child.clone());
                            new_child
                        }
                    };

                    ok!(result.store_reference(child));
                }

                ok!(result.store_cell_data(cell));

                result.build_ext(self.context)
            }
        }

        // Collect and check old cells tree
        let old_cell_hashes = ok!(self.find_old_cells());

        // Collect old cells
        let old_cells = {
            let mut visited = ahash::HashSet::default();
            let mut old_cells = ahash::HashMap::default();

            let old_ref = old.as_ref();
            visited.insert(old_ref.repr_hash());
            old_cells.insert(*old_ref.hash(0), old.clone());

            let mut merkle_depth = old_ref.descriptor().is_merkle() as u8;
            let mut stack = vec![old_ref.references()];

            while let Some(iter) = stack.last_mut() {
                if let Some(child) = iter.next() {
                    if !visited.insert(child.repr_hash()) {
                        continue;
                    }

                    let hash = child.hash(merkle_depth);
                    if !old_cell_hashes.contains(hash) {
                        // Skip new cells
                        continue;
                    }

                    // Store an owned cell with original merkle depth
                    if let Some(owned) = iter.peek_prev_cloned() {
                        old_cells.insert(*hash, owned);
                    }

                    // Increase the current merkle depth if needed
                    merkle_depth += child.descriptor().is_merkle() as u8;
                    // And proceed to processing this child
                    stack.push(child.references());
                } else {
                    // Decrease the current merkle depth if needed
                    merkle_depth -= iter.cell().descriptor().is_merkle() as u8;
                    // And return to the previous depth
                    stack.pop();
                }
            }

            old_cells
        };

        // Apply changed cells
        let new = ok!(Applier {
            old_cells,
            new_cells: Default::default(),
            context,
        }
        .run(self.new.as_ref(), 0));

        if new.as_ref().repr_hash() == &self.new_hash {
            Ok(new)
        } else {
            Err(Error::InvalidData)
        }
    }

    /// Merges this update (`A -> B`) with the next one (`B -> C`)
    /// into a single update (`A -> C`), using an empty cell context.
    pub fn combine(&self, next: &Self) -> Result<Self, Error> {
        self.combine_ext(next, Cell::empty_context())
    }

    /// Merges this update (`A -> B`) with the next one (`B -> C`)
    /// into a single update (`A -> C`), using the specified cell context.
    pub fn combine_ext(&self, next: &Self, context: &dyn CellContext) -> Result<Self, Error> {
        if self.new_hash != next.old_hash {
            return Err(Error::InvalidData);
        }
        if next.old_hash == next.new_hash {
            return Ok(self.clone());
        }
        if self.old_hash == self.new_hash {
            return Ok(next.clone());
        }

        ok!(self.validate());
        ok!(next.validate());

        // All cells of B which are presented in `self.new`
        let b_cells = collect_nodes(&self.new, false);

        // Substitute cells of B, reused by C, with their versions from `self.new`.
        // Cells which are not there are cells of A.
        let new = ok!(Substitution {
            nodes: &b_cells,
            context,
            cache: Default::default(),
        }
        .run(&next.new));

        // Expand pruned cells of A with the parts of A which were required by `next`
        let a_cells = collect_nodes(&next.old, true);
        let old = ok!(Substitution {
            nodes: &a_cells,
            context,
            cache: Default::default(),
        }
        .run(&self.old));

        let result = Self {
            old_hash: self.old_hash,
            new_hash: next.new_hash,
            old_depth: self.old_depth,
            new_depth: next.new_depth,
            old,
            new,
        };
        tracing::debug!(
            old_hash = %result.old_hash,
            new_hash = %result.new_hash,
            "combined merkle updates"
        );
        Ok(result)
    }

    /// Computes the removed cells diff using the original cell.
    pub fn compute_removed_cells<'a>(
        &self,
        old: &'a DynCell,
    ) -> Result<ahash::HashMap<&'a HashBytes, u32>, Error> {
        if old.repr_hash() != &self.old_hash || self.old.hash(0) != old.repr_hash() {
            return Err(Error::InvalidData);
        }

        if self.old_hash == self.new_hash {
            // No cells were removed
            return Ok(Default::default());
        }

        let mut new_cells = ahash::HashSet::default();

        // Compute a list of all hashes in the `new` merkle update tree
        {
            let mut visited = ahash::HashSet::default();
            let mut merkle_depth = self.new.descriptor().is_merkle() as u8;
            let mut stack = vec![self.new.references()];

            visited.insert(self.new.repr_hash());
            new_cells.insert(self.new.hash(0));

            'outer: while let Some(iter) = stack.last_mut() {
                for child in &mut *iter {
                    if !visited.insert(child.repr_hash()) {
                        continue;
                    }

                    // Track new cells
                    new_cells.insert(child.hash(merkle_depth));

                    // Unchanged cells (as pruned branches) must be presented in the old tree
                    let descriptor = child.descriptor();
                    if descriptor.is_pruned_branch() {
                        continue;
                    }

                    // Increase the current merkle depth if needed
                    merkle_depth += descriptor.is_merkle() as u8;
                    // And proceed to processing this child
                    stack.push(child.references());
                    continue 'outer;
                }

                merkle_depth -= iter.cell().descriptor().is_merkle() as u8;
                stack.pop();
            }

            debug_assert_eq!(merkle_depth, 0);
        }

        // Traverse old cells
        let mut result = ahash::HashMap::default();
        result.insert(old.repr_hash(), 1);

        let mut stack = Vec::new();
        if !new_cells.contains(old.repr_hash()) {
            stack.push(old.references());
        }

        'outer: while let Some(iter) = stack.last_mut() {
            for child in &mut *iter {
                let hash = child.repr_hash();
                match result.entry(hash) {
                    hash_map::Entry::Occupied(mut entry) => {
                        *entry.get_mut() += 1;
                        continue;
                    }
                    hash_map::Entry::Vacant(entry) => {
                        entry.insert(1);
                    }
                }

                // Skip empty or used subtrees
                if child.reference_count() == 0 || new_cells.contains(hash) {
                    continue;
                }

                stack.push(child.references());
                continue 'outer;
            }
            stack.pop();
        }

        Ok(result)
    }

    /// Computes size statistics of the cells which are stored in the update.
    ///
    /// Pruned branches are not counted.
    pub fn compute_stats(&self) -> MerkleUpdateStats {
        let (new_cells, new_bits) = count_unpruned(self.new.as_ref());
        let (old_cells, old_bits) = count_unpruned(self.old.as_ref());
        MerkleUpdateStats {
            new_cells,
            new_bits,
            old_cells,
            old_bits,
        }
    }

    fn find_old_cells(&self) -> Result<ahash::HashSet<&HashBytes>, Error> {
        let mut visited = ahash::HashSet::default();
        let mut old_cells = ahash::HashSet::default();

        // Traverse old cells
        let mut merkle_depth = 0u8;

        // Insert root
        visited.insert(self.old.repr_hash());
        old_cells.insert(self.old.hash(merkle_depth));
        merkle_depth += self.old.descriptor().is_merkle() as u8;
        let mut stack = vec![self.old.references()];

        'outer: while let Some(iter) = stack.last_mut() {
            for child in &mut *iter {
                if !visited.insert(child.repr_hash()) {
                    continue;
                }

                // Store cell with original merkle depth
                old_cells.insert(child.hash(merkle_depth));

                // Skip children for pruned branches
                let descriptor = child.descriptor();
                if descriptor.is_pruned_branch() {
                    continue;
                }

                // Increase the current merkle depth if needed
                merkle_depth += descriptor.is_merkle() as u8;
                // And proceed to processing this child
                stack.push(child.references());
                continue 'outer;
            }

            // Decrease the current merkle depth if needed
            merkle_depth -= iter.cell().descriptor().is_merkle() as u8;
            // And return to the previous depth
            stack.pop();
        }

        debug_assert_eq!(merkle_depth, 0);

        // Traverse new cells

        // Insert root
        visited.clear();
        visited.insert(self.new.repr_hash());
        stack.push(self.new.references());
        merkle_depth += self.new.descriptor().is_merkle() as u8;

        'outer: while let Some(iter) = stack.last_mut() {
            for child in &mut *iter {
                // Skip visited cells
                if !visited.insert(child.repr_hash()) {
                    continue;
                }

                // Unchanged cells (as pruned branches) must be presented in the old tree
                let descriptor = child.descriptor();
                if descriptor.is_pruned_branch() {
                    if descriptor.level_mask().contains(merkle_depth + 1)
                        && !old_cells.contains(child.hash(merkle_depth))
                    {
                        return Err(Error::InvalidData);
                    }
                } else {
                    // Increase the current merkle depth if needed
                    merkle_depth += descriptor.is_merkle() as u8;
                    // And proceed to processing this child
                    stack.push(child.references());
                    continue 'outer;
                }
            }

            // Decrease the current merkle depth if needed
            merkle_depth -= iter.cell().descriptor().is_merkle() as u8;
            // And return to the previous depth
            stack.pop();
        }

        debug_assert_eq!(merkle_depth, 0);

        // Done
        Ok(old_cells)
    }
}

/// Collects proof nodes by their original hash at merkle depth 0.
///
/// With `expanded_only` pruned branches are skipped.
fn collect_nodes(root: &Cell, expanded_only: bool) -> ahash::HashMap<HashBytes, Cell> {
    let mut result = ahash::HashMap::default();
    let mut visited = ahash::HashSet::default();

    let root_ref = root.as_ref();
    let root_descriptor = root_ref.descriptor();
    if root_descriptor.is_merkle() || root_descriptor.is_pruned_branch() {
        return result;
    }
    visited.insert(root_ref.repr_hash());
    result.insert(*root_ref.hash(0), root.clone());

    let mut stack = vec![root_ref.references()];
    while let Some(iter) = stack.last_mut() {
        let Some(child) = iter.next() else {
            stack.pop();
            continue;
        };
        if !visited.insert(child.repr_hash()) {
            continue;
        }

        let descriptor = child.descriptor();
        // Nested merkle structures are kept as is
        if descriptor.is_merkle() {
            continue;
        }

        let is_pruned = descriptor.is_pruned_branch() && descriptor.level_mask().contains(1);
        if !(is_pruned && expanded_only) {
            if let Some(owned) = iter.peek_prev_cloned() {
                result.entry(*child.hash(0)).or_insert(owned);
            }
        }
        if !is_pruned {
            stack.push(child.references());
        }
    }

    result
}

/// Rebuilds a proof tree replacing pruned branches at merkle depth 0
/// with the nodes from the specified map.
struct Substitution<'a> {
    nodes: &'a ahash::HashMap<HashBytes, Cell>,
    context: &'a dyn CellContext,
    cache: ahash::HashMap<HashBytes, Cell>,
}

impl Substitution<'_> {
    fn run(&mut self, cell: &Cell) -> Result<Cell, Error> {
        let cell_ref = cell.as_ref();
        let descriptor = cell_ref.descriptor();

        if descriptor.is_pruned_branch() {
            if descriptor.level_mask().contains(1) {
                if let Some(node) = self.nodes.get(cell_ref.hash(0)) {
                    return Ok(node.clone());
                }
            }
            return Ok(cell.clone());
        }

        // Substitution is only done for the outer tree
        if descriptor.is_merkle() || !cell_ref.level_mask().contains(1) {
            return Ok(cell.clone());
        }

        if let Some(cached) = self.cache.get(cell_ref.repr_hash()) {
            return Ok(cached.clone());
        }

        let mut builder = CellBuilder::new();
        builder.set_exotic(descriptor.is_exotic());
        ok!(builder.store_cell_data(cell_ref));
        for child in cell_ref.references().cloned() {
            let child = ok!(self.run(&child));
            ok!(builder.store_reference(child));
        }
        let result = ok!(builder.build_ext(self.context));

        self.cache.insert(*cell_ref.repr_hash(), result.clone());
        Ok(result)
    }
}

fn count_unpruned(root: &DynCell) -> (u64, u64) {
    let mut visited = ahash::HashSet::default();
    let mut cells = 0u64;
    let mut bits = 0u64;

    let mut stack = vec![root];
    while let Some(cell) = stack.pop() {
        if !visited.insert(cell.repr_hash()) {
            continue;
        }
        if cell.descriptor().is_pruned_branch() {
            continue;
        }

        cells += 1;
        bits += cell.bit_len() as u64;
        stack.extend(cell.references());
    }

    (cells, bits)
}

/// Helper struct to build a Merkle update.
pub struct MerkleUpdateBuilder<'a, F> {
    old: &'a DynCell,
    new: &'a DynCell,
    filter: F,
}

impl<'a, F> MerkleUpdateBuilder<'a, F>
where
    F: MerkleFilter,
{
    /// Creates a new Merkle update between the specified cells,
    /// using old cells determined by filter.
    pub fn new(old: &'a DynCell, new: &'a DynCell, f: F) -> Self {
        Self {
            old: old.untracked(),
            new: new.untracked(),
            filter: f,
        }
    }

    /// Builds a Merkle update using the specified cell context.
    pub fn build_ext(self, context: &dyn CellContext) -> Result<MerkleUpdate, Error> {
        BuilderImpl {
            old: self.old,
            new: self.new,
            filter: &self.filter,
            context,
        }
        .build()
    }

    /// Builds a Merkle update using an empty cell context.
    pub fn build(self) -> Result<MerkleUpdate, Error> {
        self.build_ext(Cell::empty_context())
    }
}

struct BuilderImpl<'a, 'b> {
    old: &'a DynCell,
    new: &'a DynCell,
    filter: &'b dyn MerkleFilter,
    context: &'b dyn CellContext,
}

impl BuilderImpl<'_, '_> {
    fn build(self) -> Result<MerkleUpdate, Error> {
        struct Resolver<'a> {
            pruned_branches: ahash::HashSet<&'a HashBytes>,
            visited: ahash::HashMap<&'a HashBytes, bool>,
            filter: &'a dyn MerkleFilter,
            changed_cells: ahash::HashSet<&'a HashBytes>,
        }

        impl<'a> Resolver<'a> {
            fn fill(&mut self, cell: &'a DynCell, mut skip_filter: bool) -> bool {
                let repr_hash = cell.repr_hash();

                // Skip visited cells
                if let Some(&result) = self.visited.get(repr_hash) {
                    return result;
                }

                let is_pruned = self.pruned_branches.contains(repr_hash);
                let process_children = if skip_filter {
                    true
                } else {
                    match self.filter.check(repr_hash) {
                        FilterAction::Skip => false,
                        FilterAction::Include => true,
                        FilterAction::IncludeSubtree => {
                            skip_filter = true;
                            true
                        }
                    }
                };

                let mut result = false;
                if process_children {
                    for child in cell.references() {
                        result |= self.fill(child, skip_filter);
                    }

                    if result {
                        self.changed_cells.insert(repr_hash);
                    }
                }

                result |= is_pruned;

                self.visited.insert(repr_hash, result);

                result
            }
        }

        struct InvertedFilter<F>(F);

        impl<F: MerkleFilter> MerkleFilter for InvertedFilter<F> {
            #[inline]
            fn check(&self, cell: &HashBytes) -> FilterAction {
                if self.0.check(cell) == FilterAction::Skip {
                    FilterAction::Include
                } else {
                    FilterAction::Skip
                }
            }
        }

        let old_hash = self.old.repr_hash();
        let old_depth = self.old.repr_depth();
        let new_hash = self.new.repr_hash();
        let new_depth = self.new.repr_depth();

        // Handle the simplest case with empty Merkle update
        if old_hash == new_hash {
            let pruned = ok!(make_pruned_branch(self.old, 0, self.context));
            return Ok(MerkleUpdate {
                old_hash: *old_hash,
                new_hash: *old_hash,
                old_depth,
                new_depth: old_depth,
                old: pruned.clone(),
                new: pruned,
            });
        }

        // Create Merkle proof cell which contains only new cells
        let (new, pruned_branches) = ok! {
            MerkleProofBuilder::<_>::new(
                self.new,
                InvertedFilter(self.filter)
            )
            .track_pruned_branches()
            .allow_different_root(true)
            .build_raw_ext(self.context)
        };

        let changed_cells = {
            // Prepare cell diff resolver
            let mut resolver = Resolver {
                pruned_branches,
                visited: Default::default(),
                filter: self.filter,
                changed_cells: Default::default(),
            };

            // Find all changed cells in the old cell tree
            if resolver.fill(self.old, false) {
                resolver.changed_cells.insert(old_hash);
            }

            resolver.changed_cells
        };

        // Create Merkle proof cell which contains only changed cells
        let old = ok! {
            MerkleProofBuilder::<_>::new(self.old, changed_cells)
                .allow_different_root(true)
                .build_raw_ext(self.context)
        };

        tracing::trace!(%old_hash, %new_hash, "built merkle update");

        // Done
        Ok(MerkleUpdate {
            old_hash: *old_hash,
            new_hash: *new_hash,
            old_depth,
            new_depth,
            old,
            new,
        })
    }
}

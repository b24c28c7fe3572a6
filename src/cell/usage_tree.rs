use std::sync::{Arc, OnceLock, Weak};

use crate::cell::{Cell, CellDescriptor, CellImpl, DynCell, HashBytes, MAX_REF_COUNT};

/// Rule for including cells in the usage tree.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub enum UsageTreeMode {
    /// Include cell on load.
    #[default]
    OnLoad,
    /// Include cell only when accessing references or data.
    OnDataAccess,
}

/// Usage tree for a family of cells.
///
/// Can be shared between threads: the visited set is a concurrent map.
pub struct UsageTree {
    state: Arc<UsageTreeState>,
}

impl UsageTree {
    /// Creates a usage tree with the specified tracking mode.
    pub fn new(mode: UsageTreeMode) -> Self {
        Self {
            state: Arc::new(UsageTreeState {
                mode,
                visited: Default::default(),
            }),
        }
    }

    /// Returns the tracking mode.
    #[inline]
    pub fn mode(&self) -> UsageTreeMode {
        self.state.mode
    }

    /// Returns a weak handle which can be used to wrap cells.
    pub fn root_node(&self) -> UsageTreeNode {
        UsageTreeNode {
            state: Arc::downgrade(&self.state),
        }
    }

    /// Wraps the specified cell in a usage cell to keep track
    /// of the data or links being accessed.
    pub fn track(&self, cell: &Cell) -> Cell {
        self.state.insert(cell, UsageTreeMode::OnLoad);
        UsageCell::create(cell.clone(), &self.root_node())
    }

    /// Returns `true` if the cell with the specified representation hash
    /// is present in this usage tree.
    pub fn contains(&self, repr_hash: &HashBytes) -> bool {
        self.state
            .visited
            .read(repr_hash, |_, cell| cell.include)
            .unwrap_or_default()
    }

    /// Returns the number of included cells.
    pub fn len(&self) -> usize {
        let mut result = 0;
        self.state.visited.scan(|_, cell| result += cell.include as usize);
        result
    }

    /// Returns `true` if no cells were included.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extends the usage tree with a set of whole subtrees.
    pub fn with_subtrees(self) -> UsageTreeWithSubtrees {
        UsageTreeWithSubtrees {
            state: self.state,
            subtrees: Default::default(),
        }
    }
}

/// Usage tree with a set of subtrees which are included as is.
pub struct UsageTreeWithSubtrees {
    state: Arc<UsageTreeState>,
    subtrees: ahash::HashSet<HashBytes>,
}

impl UsageTreeWithSubtrees {
    /// Wraps the specified cell in a usage cell to keep track
    /// of the data or links being accessed.
    pub fn track(&self, cell: &Cell) -> Cell {
        self.state.insert(cell, UsageTreeMode::OnLoad);
        UsageCell::create(
            cell.clone(),
            &UsageTreeNode {
                state: Arc::downgrade(&self.state),
            },
        )
    }

    /// Returns `true` if the cell with the specified representation hash
    /// is present in this usage tree.
    pub fn contains_direct(&self, repr_hash: &HashBytes) -> bool {
        self.state
            .visited
            .read(repr_hash, |_, cell| cell.include)
            .unwrap_or_default()
    }

    /// Returns `true` if the cell with the specified representation hash
    /// is a root of one of the included subtrees.
    pub fn contains_subtree(&self, repr_hash: &HashBytes) -> bool {
        self.subtrees.contains(repr_hash)
    }

    /// Adds a subtree root. Returns `false` if it was already added.
    pub fn add_subtree(&mut self, root: &DynCell) -> bool {
        self.subtrees.insert(*root.repr_hash())
    }
}

/// Weak handle to the usage tree state.
#[derive(Clone)]
pub struct UsageTreeNode {
    state: Weak<UsageTreeState>,
}

impl UsageTreeNode {
    /// Returns `true` if the usage tree is still alive.
    pub fn is_alive(&self) -> bool {
        self.state.strong_count() > 0
    }
}

struct UsageTreeState {
    mode: UsageTreeMode,
    visited: scc::HashMap<HashBytes, VisitedCell, ahash::RandomState>,
}

impl UsageTreeState {
    fn insert(&self, cell: &Cell, ctx: UsageTreeMode) {
        let repr_hash = cell.as_ref().repr_hash();
        let include = self.mode == ctx;

        match self.visited.entry(*repr_hash) {
            scc::hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().include |= include;
            }
            scc::hash_map::Entry::Vacant(entry) => {
                entry.insert_entry(VisitedCell {
                    include,
                    _cell: cell.clone(),
                });
            }
        }
    }
}

struct VisitedCell {
    include: bool,
    _cell: Cell,
}

/// Cell wrapper which records accesses into the usage tree.
pub struct UsageCell {
    cell: Cell,
    usage_tree: Weak<UsageTreeState>,
    children: [OnceLock<Cell>; MAX_REF_COUNT],
}

impl UsageCell {
    /// Wraps the cell without recording it.
    pub fn create(cell: Cell, node: &UsageTreeNode) -> Cell {
        Cell::new(Self {
            cell,
            usage_tree: node.state.clone(),
            children: Default::default(),
        })
    }

    fn load_reference(&self, index: u8) -> Option<&Cell> {
        let slot = self.children.get(index as usize)?;
        if let Some(child) = slot.get() {
            return Some(child);
        }

        let child = self.cell.as_ref().reference_cloned(index)?;
        if let Some(usage_tree) = self.usage_tree.upgrade() {
            usage_tree.insert(&child, UsageTreeMode::OnLoad);
        }

        Some(slot.get_or_init(|| {
            Cell::new(UsageCell {
                cell: child,
                usage_tree: self.usage_tree.clone(),
                children: Default::default(),
            })
        }))
    }
}

impl CellImpl for UsageCell {
    fn descriptor(&self) -> CellDescriptor {
        self.cell.as_ref().descriptor()
    }

    fn data(&self) -> &[u8] {
        if let Some(usage_tree) = self.usage_tree.upgrade() {
            usage_tree.insert(&self.cell, UsageTreeMode::OnDataAccess);
        }
        self.cell.as_ref().data()
    }

    fn bit_len(&self) -> u16 {
        self.cell.as_ref().bit_len()
    }

    fn reference(&self, index: u8) -> Option<&DynCell> {
        Some(self.load_reference(index)?.as_ref())
    }

    fn reference_cloned(&self, index: u8) -> Option<Cell> {
        self.load_reference(index).cloned()
    }

    fn untracked(&self) -> &DynCell {
        self.cell.as_ref().untracked()
    }

    fn hash(&self, level: u8) -> &HashBytes {
        self.cell.as_ref().hash(level)
    }

    fn depth(&self, level: u8) -> u16 {
        self.cell.as_ref().depth(level)
    }
}

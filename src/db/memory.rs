use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::kv::{keep_cell_row, merge_cell_rows, BatchOp, KeyValue, KvSnapshot, Namespace, WriteBatch};
use super::KvError;

/// In-memory key-value store.
///
/// Snapshots share the state with the store until the next commit,
/// which copies the tables if some snapshot is still alive.
#[derive(Default)]
pub struct MemoryKv {
    tables: RwLock<Arc<Tables>>,
}

impl MemoryKv {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes all cell rows which are no longer referenced.
    ///
    /// Returns the number of removed rows.
    pub fn compact(&self) -> usize {
        let mut tables = self.tables.write();
        let tables = Arc::make_mut(&mut tables);

        let before = tables.cells.len();
        tables.cells.retain(|_, value| keep_cell_row(value));
        let removed = before - tables.cells.len();

        tracing::debug!(removed, "compacted cell rows");
        removed
    }

    /// Returns the number of stored entries in the namespace.
    pub fn len(&self, ns: Namespace) -> usize {
        self.tables.read().table(ns).len()
    }

    fn current(&self) -> Arc<Tables> {
        self.tables.read().clone()
    }
}

impl KeyValue for MemoryKv {
    fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.tables.read().table(ns).get(key).cloned())
    }

    fn for_each(
        &self,
        ns: Namespace,
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError> {
        self.current().for_each(ns, f)
    }

    fn snapshot(&self) -> Arc<dyn KvSnapshot> {
        self.current()
    }

    fn commit_write_batch(&self, batch: WriteBatch) -> Result<(), KvError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tables = self.tables.write();

        // NOTE: a failed batch must leave no traces
        let mut updated = Tables::clone(&tables);
        for op in batch {
            match op {
                BatchOp::Put { ns, key, value } => {
                    updated.table_mut(ns).insert(key, value);
                }
                BatchOp::Delete { ns, key } => {
                    updated.table_mut(ns).remove(&key);
                }
                BatchOp::Merge { ns, key, value } => {
                    if ns != Namespace::Cells {
                        return Err(KvError::Backend(format!(
                            "merge operator is not defined for `{}`",
                            ns.name()
                        )));
                    }

                    let table = updated.table_mut(ns);
                    let existing = table.get(&key).map(Vec::as_slice);
                    let Some(merged) = merge_cell_rows(existing, [value.as_slice()]) else {
                        return Err(KvError::Backend("failed to merge cell row".to_owned()));
                    };
                    table.insert(key, merged);
                }
            }
        }

        *tables = Arc::new(updated);
        Ok(())
    }
}

#[derive(Default, Clone)]
struct Tables {
    cells: BTreeMap<Vec<u8>, Vec<u8>>,
    meta: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Tables {
    fn table(&self, ns: Namespace) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        match ns {
            Namespace::Cells => &self.cells,
            Namespace::Meta => &self.meta,
        }
    }

    fn table_mut(&mut self, ns: Namespace) -> &mut BTreeMap<Vec<u8>, Vec<u8>> {
        match ns {
            Namespace::Cells => &mut self.cells,
            Namespace::Meta => &mut self.meta,
        }
    }
}

impl KvSnapshot for Tables {
    fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.table(ns).get(key).cloned())
    }

    fn for_each(
        &self,
        ns: Namespace,
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError> {
        for (key, value) in self.table(ns) {
            if !f(key, value) {
                break;
            }
        }
        Ok(())
    }
}

//! RocksDB key-value backend.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, CompactionDecision, DBCompactionStyle, IteratorMode,
    MergeOperands, Options, Snapshot, DB,
};

use super::kv::{keep_cell_row, merge_cell_rows, BatchOp, KeyValue, KvSnapshot, Namespace, WriteBatch};
use super::KvError;

/// RocksDB settings.
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RocksKvConfig {
    /// Limit of simultaneously opened files, `-1` means unlimited.
    pub max_open_files: i32,
    /// One of `level`, `universal`, `fifo` or `none`.
    pub compaction_style: String,
    /// Collect internal RocksDB statistics.
    pub enable_statistics: bool,
    /// Create the database if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for RocksKvConfig {
    fn default() -> Self {
        Self {
            max_open_files: 1024,
            compaction_style: "level".to_owned(),
            enable_statistics: false,
            create_if_missing: true,
        }
    }
}

/// Converts string to a compaction style variant.
pub fn compaction_style_from_str(s: &str) -> Result<Option<DBCompactionStyle>, KvError> {
    match s.to_lowercase().as_str() {
        "level" => Ok(Some(DBCompactionStyle::Level)),
        "universal" => Ok(Some(DBCompactionStyle::Universal)),
        "fifo" => Ok(Some(DBCompactionStyle::Fifo)),
        "none" => Ok(None),
        _ => Err(KvError::InvalidConfig(format!("unknown compaction style `{s}`"))),
    }
}

/// Key-value store on top of RocksDB.
///
/// Each namespace is stored in its own column family. The cells column family
/// uses [`merge_cell_rows`] as a merge operator and [`keep_cell_row`]
/// as a compaction filter.
#[derive(Clone)]
pub struct RocksKv {
    db: Arc<DB>,
}

impl RocksKv {
    /// Opens or creates a database at the specified path.
    pub fn open<P: AsRef<Path>>(path: P, config: &RocksKvConfig) -> Result<Self, KvError> {
        let mut options = Options::default();
        options.create_if_missing(config.create_if_missing);
        options.create_missing_column_families(true);
        options.set_max_open_files(config.max_open_files);
        if let Some(style) = ok!(compaction_style_from_str(&config.compaction_style)) {
            options.set_compaction_style(style);
        }
        if config.enable_statistics {
            options.enable_statistics();
        }

        let mut cells_options = options.clone();
        cells_options.set_merge_operator_associative(
            "cell_rows_merge",
            |_: &[u8], existing: Option<&[u8]>, operands: &MergeOperands| {
                merge_cell_rows(existing, operands.iter())
            },
        );
        cells_options.set_compaction_filter("cell_rows_gc", |_: u32, _: &[u8], value: &[u8]| {
            if keep_cell_row(value) {
                CompactionDecision::Keep
            } else {
                CompactionDecision::Remove
            }
        });

        let column_families = [
            ColumnFamilyDescriptor::new(Namespace::Cells.name(), cells_options),
            ColumnFamilyDescriptor::new(Namespace::Meta.name(), options.clone()),
        ];

        let db = DB::open_cf_descriptors(&options, path.as_ref(), column_families)?;
        tracing::debug!(path = %path.as_ref().display(), "opened rocksdb");

        Ok(Self { db: Arc::new(db) })
    }

    /// Runs a manual compaction of the cells column family.
    ///
    /// Dead cell rows are removed by the compaction filter.
    pub fn compact(&self) -> Result<(), KvError> {
        let cf = ok!(cf_handle(&self.db, Namespace::Cells));
        self.db.compact_range_cf(cf, None::<&[u8]>, None::<&[u8]>);
        Ok(())
    }

    /// Returns the underlying database.
    pub fn raw(&self) -> &Arc<DB> {
        &self.db
    }
}

impl KeyValue for RocksKv {
    fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        let cf = ok!(cf_handle(&self.db, ns));
        Ok(self.db.get_cf(cf, key)?)
    }

    fn for_each(
        &self,
        ns: Namespace,
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError> {
        let cf = ok!(cf_handle(&self.db, ns));
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            if !f(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Arc<dyn KvSnapshot> {
        let snapshot = self.db.snapshot();

        // SAFETY: the snapshot is dropped before the database handle
        // since fields are dropped in declaration order.
        let snapshot = unsafe { std::mem::transmute::<Snapshot<'_>, Snapshot<'static>>(snapshot) };

        Arc::new(RocksSnapshot {
            snapshot,
            db: self.db.clone(),
        })
    }

    fn commit_write_batch(&self, batch: WriteBatch) -> Result<(), KvError> {
        let mut raw = rocksdb::WriteBatch::default();
        for op in batch {
            match op {
                BatchOp::Put { ns, key, value } => {
                    raw.put_cf(ok!(cf_handle(&self.db, ns)), key, value);
                }
                BatchOp::Merge { ns, key, value } => {
                    raw.merge_cf(ok!(cf_handle(&self.db, ns)), key, value);
                }
                BatchOp::Delete { ns, key } => {
                    raw.delete_cf(ok!(cf_handle(&self.db, ns)), key);
                }
            }
        }
        Ok(self.db.write(raw)?)
    }
}

struct RocksSnapshot {
    snapshot: Snapshot<'static>,
    db: Arc<DB>,
}

impl KvSnapshot for RocksSnapshot {
    fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        let cf = ok!(cf_handle(&self.db, ns));
        Ok(self.snapshot.get_cf(cf, key)?)
    }

    fn for_each(
        &self,
        ns: Namespace,
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError> {
        let cf = ok!(cf_handle(&self.db, ns));
        for item in self.snapshot.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            if !f(&key, &value) {
                break;
            }
        }
        Ok(())
    }
}

fn cf_handle(db: &DB, ns: Namespace) -> Result<&ColumnFamily, KvError> {
    db.cf_handle(ns.name())
        .ok_or(KvError::ColumnFamilyNotFound(ns.name()))
}

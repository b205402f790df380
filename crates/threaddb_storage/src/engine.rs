//! The storage engine: table catalog, commit log and transactions.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::frame::{decode_frames, encode_frame, LogOp, LogRecord, TableSnapshot};
use crate::memory::InMemoryBackend;
use crate::table::{Table, TableDef};
use crate::transaction::{Transaction, TxMode};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An embedded, transactional table store.
///
/// The engine keeps every table in memory and persists changes as frames
/// in an append-only commit log. Opening an engine replays the log.
///
/// Transactions run as closures. Read-only transactions never block.
/// Read-write transactions are serialized, and their writes become
/// visible atomically when the closure returns `Ok`. A closure returning
/// `Err` discards every write it made.
///
/// Opening a read-write transaction from inside another read-write
/// transaction's closure deadlocks.
///
/// # Example
///
/// ```rust
/// use threaddb_storage::{Engine, TableDef, TxMode, StorageError};
/// use serde_json::json;
///
/// let engine = Engine::in_memory().unwrap();
/// engine.create_table(TableDef::keyed("people", "_id")).unwrap();
///
/// engine
///     .transaction(TxMode::ReadWrite, &["people"], |txn| {
///         txn.put("people", json!({"_id": "ada", "name": "Ada"}))?;
///         Ok::<_, StorageError>(())
///     })
///     .unwrap();
///
/// let name = engine
///     .transaction(TxMode::ReadOnly, &["people"], |txn| {
///         Ok::<_, StorageError>(txn.get("people", "ada")?.map(|v| v["name"].clone()))
///     })
///     .unwrap();
/// assert_eq!(name, Some(json!("Ada")));
/// ```
pub struct Engine {
    backend: Mutex<Box<dyn StorageBackend>>,
    tables: RwLock<BTreeMap<String, Arc<Table>>>,
    writer: Mutex<()>,
    open: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("tables", &self.table_names())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Opens an engine over a backend, replaying its commit log.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] if the log cannot be replayed.
    pub fn open(backend: Box<dyn StorageBackend>) -> StorageResult<Self> {
        let records = decode_frames(&backend.contents()?)?;
        let mut tables = BTreeMap::new();
        let count = records.len();
        for record in records {
            replay(&mut tables, record)?;
        }
        tracing::debug!(records = count, tables = tables.len(), "commit log replayed");

        Ok(Self {
            backend: Mutex::new(backend),
            tables: RwLock::new(
                tables
                    .into_iter()
                    .map(|(name, table)| (name, Arc::new(table)))
                    .collect(),
            ),
            writer: Mutex::new(()),
            open: AtomicBool::new(true),
        })
    }

    /// Opens an ephemeral engine.
    pub fn in_memory() -> StorageResult<Self> {
        Self::open(Box::new(InMemoryBackend::new()))
    }

    /// Opens an engine persisted in the file at `path`.
    pub fn open_path(path: &Path) -> StorageResult<Self> {
        Self::open(Box::new(FileBackend::open(path)?))
    }

    /// Returns true until [`Engine::close`] is called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Flushes the log and rejects further transactions.
    pub fn close(&self) -> StorageResult<()> {
        let _writer = self.writer.lock();
        if self.open.swap(false, Ordering::AcqRel) {
            self.backend.lock().flush()?;
        }
        Ok(())
    }

    /// Names of every table.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Returns true if the table exists.
    #[must_use]
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    /// Definition of a table.
    #[must_use]
    pub fn table_def(&self, name: &str) -> Option<TableDef> {
        self.tables.read().get(name).map(|t| t.def().clone())
    }

    /// Creates a table.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TableExists`] if the name is taken.
    pub fn create_table(&self, def: TableDef) -> StorageResult<()> {
        let _writer = self.lock_writer()?;
        if self.has_table(&def.name) {
            return Err(StorageError::TableExists(def.name));
        }
        self.append(&LogRecord::CreateTable(def.clone()))?;
        self.tables
            .write()
            .insert(def.name.clone(), Arc::new(Table::new(def)));
        Ok(())
    }

    /// Creates the table, or redefines it if its definition changed.
    /// Returns true if anything was written.
    pub fn ensure_table(&self, def: TableDef) -> StorageResult<bool> {
        let _writer = self.lock_writer()?;
        let existing = self.tables.read().get(&def.name).cloned();
        let table = match existing {
            Some(current) if *current.def() == def => return Ok(false),
            Some(current) => {
                let mut table = (*current).clone();
                table.redefine(def.clone())?;
                table
            }
            None => Table::new(def.clone()),
        };
        self.append(&LogRecord::CreateTable(def.clone()))?;
        self.tables.write().insert(def.name, Arc::new(table));
        Ok(true)
    }

    /// Drops a table and all of its rows.
    pub fn drop_table(&self, name: &str) -> StorageResult<()> {
        let _writer = self.lock_writer()?;
        if !self.has_table(name) {
            return Err(StorageError::TableNotFound(name.to_string()));
        }
        self.append(&LogRecord::DropTable(name.to_string()))?;
        self.tables.write().remove(name);
        Ok(())
    }

    /// Runs `f` in a transaction scoped to `tables`.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or a storage error converted into `E`
    /// if the engine is closed, a table does not exist, or the commit
    /// could not be written.
    pub fn transaction<T, E, F>(&self, mode: TxMode, tables: &[&str], f: F) -> Result<T, E>
    where
        E: From<StorageError>,
        F: FnOnce(&mut Transaction) -> Result<T, E>,
    {
        let _writer = match mode {
            TxMode::ReadWrite => Some(self.lock_writer()?),
            TxMode::ReadOnly => {
                self.ensure_open()?;
                None
            }
        };

        let snapshot = {
            let catalog = self.tables.read();
            let mut snapshot = BTreeMap::new();
            for name in tables {
                let table = catalog
                    .get(*name)
                    .ok_or_else(|| StorageError::TableNotFound((*name).to_string()))?;
                snapshot.insert((*name).to_string(), Arc::clone(table));
            }
            snapshot
        };

        let mut txn = Transaction::new(mode, snapshot);
        let value = f(&mut txn)?;

        if mode == TxMode::ReadWrite {
            let (ops, mut scoped, dirty) = txn.into_parts();
            if !ops.is_empty() {
                self.append(&LogRecord::Commit(ops))?;
                let mut catalog = self.tables.write();
                for name in dirty {
                    if let Some(table) = scoped.remove(&name) {
                        catalog.insert(name, table);
                    }
                }
            }
        }
        Ok(value)
    }

    /// Rewrites the commit log as a single snapshot of every table.
    pub fn compact(&self) -> StorageResult<()> {
        let _writer = self.lock_writer()?;
        let snapshot = {
            let catalog = self.tables.read();
            let mut images = Vec::with_capacity(catalog.len());
            for table in catalog.values() {
                let mut rows = Vec::with_capacity(table.len());
                for (key, value) in table.rows() {
                    let text = serde_json::to_string(value)
                        .map_err(|e| StorageError::encoding(e.to_string()))?;
                    rows.push((key.clone(), text));
                }
                images.push(TableSnapshot {
                    def: table.def().clone(),
                    next_seq: table.next_seq(),
                    rows,
                });
            }
            images
        };
        let frame = encode_frame(&LogRecord::Snapshot(snapshot))?;
        let mut backend = self.backend.lock();
        let before = backend.len()?;
        backend.replace(&frame)?;
        tracing::info!(before, after = frame.len(), "commit log compacted");
        Ok(())
    }

    fn lock_writer(&self) -> StorageResult<parking_lot::MutexGuard<'_, ()>> {
        let guard = self.writer.lock();
        self.ensure_open()?;
        Ok(guard)
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StorageError::Closed)
        }
    }

    fn append(&self, record: &LogRecord) -> StorageResult<()> {
        let frame = encode_frame(record)?;
        let mut backend = self.backend.lock();
        backend.append(&frame)?;
        backend.flush()
    }
}

fn replay(tables: &mut BTreeMap<String, Table>, record: LogRecord) -> StorageResult<()> {
    match record {
        LogRecord::CreateTable(def) => match tables.get_mut(&def.name) {
            Some(table) => table.redefine(def)?,
            None => {
                tables.insert(def.name.clone(), Table::new(def));
            }
        },
        LogRecord::DropTable(name) => {
            tables.remove(&name);
        }
        LogRecord::Commit(ops) => {
            for op in ops {
                apply_op(tables, op)?;
            }
        }
        LogRecord::Snapshot(images) => {
            tables.clear();
            for image in images {
                let mut table = Table::new(image.def.clone());
                table.set_next_seq(image.next_seq);
                for (key, text) in image.rows {
                    table.insert_unchecked(key, parse_row(&text)?);
                }
                tables.insert(image.def.name, table);
            }
        }
    }
    Ok(())
}

fn apply_op(tables: &mut BTreeMap<String, Table>, op: LogOp) -> StorageResult<()> {
    let name = match &op {
        LogOp::Put { table, .. } | LogOp::Delete { table, .. } | LogOp::Clear { table } => {
            table.clone()
        }
    };
    let table = tables
        .get_mut(&name)
        .ok_or_else(|| StorageError::corrupted(format!("commit references unknown table {name}")))?;
    match op {
        LogOp::Put { key, value, .. } => {
            table.insert_unchecked(key, parse_row(&value)?);
        }
        LogOp::Delete { key, .. } => {
            table.remove(&key);
        }
        LogOp::Clear { .. } => table.clear(),
    }
    Ok(())
}

fn parse_row(text: &str) -> StorageResult<serde_json::Value> {
    serde_json::from_str(text).map_err(|e| StorageError::corrupted(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::IndexDef;
    use serde_json::json;

    fn put(engine: &Engine, table: &str, value: serde_json::Value) {
        engine
            .transaction(TxMode::ReadWrite, &[table], |txn| {
                txn.put(table, value)?;
                Ok::<_, StorageError>(())
            })
            .unwrap();
    }

    #[test]
    fn failed_closure_discards_writes() {
        let engine = Engine::in_memory().unwrap();
        engine.create_table(TableDef::keyed("people", "_id")).unwrap();

        let result: StorageResult<()> =
            engine.transaction(TxMode::ReadWrite, &["people"], |txn| {
                txn.put("people", json!({"_id": "a"}))?;
                Err(StorageError::corrupted("abort"))
            });
        assert!(result.is_err());

        let count = engine
            .transaction(TxMode::ReadOnly, &["people"], |txn| txn.count("people"))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn reopen_replays_log() {
        let backend = InMemoryBackend::new();
        {
            let engine = Engine::open(Box::new(backend.clone())).unwrap();
            engine
                .create_table(TableDef::keyed("people", "_id").with_index(IndexDef::new("city")))
                .unwrap();
            engine.create_table(TableDef::auto_increment("_log")).unwrap();
            put(&engine, "people", json!({"_id": "a", "city": "Oslo"}));
            put(&engine, "people", json!({"_id": "b", "city": "Oslo"}));
            put(&engine, "_log", json!({"n": 1}));
            engine
                .transaction(TxMode::ReadWrite, &["people"], |txn| {
                    txn.delete("people", "a")
                })
                .unwrap();
        }

        let engine = Engine::open(Box::new(backend)).unwrap();
        engine
            .transaction(TxMode::ReadWrite, &["people", "_log"], |txn| {
                assert!(!txn.has("people", "a")?);
                let oslo = txn.find_by_index("people", "city", &json!("Oslo"))?;
                assert_eq!(oslo.len(), 1);
                let key = txn.add("_log", json!({"n": 2}))?;
                assert_eq!(key, crate::table::sequence_key(2));
                Ok::<_, StorageError>(())
            })
            .unwrap();
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let engine = Engine::in_memory().unwrap();
        engine.create_table(TableDef::keyed("kv", "k")).unwrap();
        put(&engine, "kv", json!({"k": "x", "v": 1}));

        engine
            .transaction(TxMode::ReadOnly, &["kv"], |reader| {
                put(&engine, "kv", json!({"k": "x", "v": 2}));
                assert_eq!(reader.get("kv", "x")?.unwrap()["v"], 1);
                Ok::<_, StorageError>(())
            })
            .unwrap();
    }

    #[test]
    fn compact_preserves_state() {
        let backend = InMemoryBackend::new();
        let engine = Engine::open(Box::new(backend.clone())).unwrap();
        engine.create_table(TableDef::auto_increment("_log")).unwrap();
        for n in 0..20 {
            put(&engine, "_log", json!({ "n": n }));
        }
        engine
            .transaction(TxMode::ReadWrite, &["_log"], |txn| txn.clear("_log"))
            .unwrap();
        let before = backend.data().len();
        engine.compact().unwrap();
        assert!(backend.data().len() < before);
        drop(engine);

        let engine = Engine::open(Box::new(backend)).unwrap();
        let key = engine
            .transaction(TxMode::ReadWrite, &["_log"], |txn| {
                txn.add("_log", json!({"n": 20}))
            })
            .unwrap();
        assert_eq!(key, crate::table::sequence_key(21));
    }

    #[test]
    fn ensure_table_is_idempotent() {
        let engine = Engine::in_memory().unwrap();
        let def = TableDef::keyed("people", "_id");
        assert!(engine.ensure_table(def.clone()).unwrap());
        assert!(!engine.ensure_table(def.clone()).unwrap());
        assert!(engine
            .ensure_table(def.with_index(IndexDef::new("name")))
            .unwrap());
        assert_eq!(engine.table_def("people").unwrap().indexes.len(), 1);
    }

    #[test]
    fn closed_engine_rejects_transactions() {
        let engine = Engine::in_memory().unwrap();
        engine.create_table(TableDef::keyed("kv", "k")).unwrap();
        engine.close().unwrap();
        let result = engine.transaction(TxMode::ReadOnly, &["kv"], |txn| txn.count("kv"));
        assert!(matches!(result, Err(StorageError::Closed)));
    }

    #[test]
    fn missing_table_is_reported() {
        let engine = Engine::in_memory().unwrap();
        let result = engine.transaction(TxMode::ReadOnly, &["nope"], |txn| txn.count("nope"));
        assert!(matches!(result, Err(StorageError::TableNotFound(_))));
    }
}

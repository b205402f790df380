//! Transactions over a fixed set of tables.

use crate::error::{StorageError, StorageResult};
use crate::frame::LogOp;
use crate::table::{KeyRange, Table};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Access mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Reads only. Any write fails with [`StorageError::ReadOnly`].
    ReadOnly,
    /// Reads and writes. Writers are serialized by the engine.
    ReadWrite,
}

/// A transaction scoped to the tables named when it was opened.
///
/// Reads see a snapshot taken when the transaction started plus the
/// transaction's own writes. Writes are buffered and become visible to
/// other transactions only when the closure passed to
/// [`Engine::transaction`](crate::Engine::transaction) returns `Ok`.
///
/// Row errors (`KeyExists`, `MissingKey`, `ConstraintViolation`) leave
/// the transaction unchanged, so callers may recover from them and keep
/// going.
#[derive(Debug)]
pub struct Transaction {
    mode: TxMode,
    tables: BTreeMap<String, Arc<Table>>,
    dirty: BTreeSet<String>,
    ops: Vec<LogOp>,
}

impl Transaction {
    pub(crate) fn new(mode: TxMode, tables: BTreeMap<String, Arc<Table>>) -> Self {
        Self {
            mode,
            tables,
            dirty: BTreeSet::new(),
            ops: Vec::new(),
        }
    }

    /// Returns the transaction mode.
    #[must_use]
    pub fn mode(&self) -> TxMode {
        self.mode
    }

    /// Returns the tables in scope.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Returns true if `table` was declared in the scope.
    #[must_use]
    pub fn in_scope(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Reads one row.
    pub fn get(&self, table: &str, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.table(table)?.get(key).cloned())
    }

    /// Returns true if the row exists.
    pub fn has(&self, table: &str, key: &str) -> StorageResult<bool> {
        Ok(self.table(table)?.contains(key))
    }

    /// Number of rows in a table.
    pub fn count(&self, table: &str) -> StorageResult<usize> {
        Ok(self.table(table)?.len())
    }

    /// Every key in a table, in order.
    pub fn keys(&self, table: &str) -> StorageResult<Vec<String>> {
        Ok(self.table(table)?.keys().cloned().collect())
    }

    /// Every row in a table, in key order.
    pub fn all(&self, table: &str) -> StorageResult<Vec<(String, Value)>> {
        Ok(self
            .table(table)?
            .rows()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Rows within a key range.
    pub fn range(&self, table: &str, range: &KeyRange) -> StorageResult<Vec<(String, Value)>> {
        Ok(self.table(table)?.range(range))
    }

    /// Rows whose indexed field equals `value`.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::TableNotFound`] naming the index if the
    /// table has no such index.
    pub fn find_by_index(
        &self,
        table: &str,
        index: &str,
        value: &Value,
    ) -> StorageResult<Vec<(String, Value)>> {
        let t = self.table(table)?;
        let keys = t
            .index_lookup(index, value)
            .ok_or_else(|| StorageError::TableNotFound(format!("{table}.{index}")))?;
        Ok(keys
            .into_iter()
            .filter_map(|k| t.get(&k).cloned().map(|v| (k, v)))
            .collect())
    }

    /// Derives the key a document would be stored under without writing.
    /// Auto-increment tables return `None`.
    pub fn key_of(&self, table: &str, value: &Value) -> StorageResult<Option<String>> {
        let t = self.table(table)?;
        match &t.def().key {
            crate::table::KeyScheme::AutoIncrement => Ok(None),
            crate::table::KeyScheme::Field(path) => match crate::table::field_at(value, path) {
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(Value::Number(n)) => Ok(Some(n.to_string())),
                _ => Err(StorageError::MissingKey {
                    table: table.to_string(),
                    path: path.clone(),
                }),
            },
        }
    }

    /// Inserts a new row.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::KeyExists`] if the key is taken.
    pub fn add(&mut self, table: &str, value: Value) -> StorageResult<String> {
        let key = self.writable(table)?.derive_key(&value)?;
        if self.table(table)?.contains(&key) {
            return Err(StorageError::KeyExists {
                table: table.to_string(),
                key,
            });
        }
        self.write_row(table, key, value)
    }

    /// Inserts or replaces a row.
    pub fn put(&mut self, table: &str, value: Value) -> StorageResult<String> {
        let key = self.writable(table)?.derive_key(&value)?;
        self.write_row(table, key, value)
    }

    /// Inserts or replaces a row under an explicit key. On auto-increment
    /// tables this also advances the sequence past `key`.
    pub fn put_with_key(&mut self, table: &str, key: &str, value: Value) -> StorageResult<()> {
        self.writable(table)?;
        self.write_row(table, key.to_string(), value)?;
        Ok(())
    }

    /// Removes a row. Returns whether it existed.
    pub fn delete(&mut self, table: &str, key: &str) -> StorageResult<bool> {
        let removed = self.writable(table)?.remove(key).is_some();
        if removed {
            self.ops.push(LogOp::Delete {
                table: table.to_string(),
                key: key.to_string(),
            });
        }
        Ok(removed)
    }

    /// Removes every row within a key range. Returns the number removed.
    pub fn delete_range(&mut self, table: &str, range: &KeyRange) -> StorageResult<usize> {
        let keys: Vec<String> = self.range(table, range)?.into_iter().map(|(k, _)| k).collect();
        let mut removed = 0;
        for key in keys {
            if self.delete(table, &key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes every row in a table.
    pub fn clear(&mut self, table: &str) -> StorageResult<()> {
        self.writable(table)?.clear();
        self.ops.push(LogOp::Clear {
            table: table.to_string(),
        });
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (Vec<LogOp>, BTreeMap<String, Arc<Table>>, BTreeSet<String>) {
        (self.ops, self.tables, self.dirty)
    }

    fn write_row(&mut self, table: &str, key: String, value: Value) -> StorageResult<String> {
        let op = LogOp::put(table, &key, &value)?;
        self.writable(table)?.insert(key.clone(), value)?;
        self.ops.push(op);
        Ok(key)
    }

    fn table(&self, table: &str) -> StorageResult<&Table> {
        self.tables
            .get(table)
            .map(Arc::as_ref)
            .ok_or_else(|| StorageError::NotInScope {
                table: table.to_string(),
            })
    }

    fn writable(&mut self, table: &str) -> StorageResult<&mut Table> {
        if self.mode == TxMode::ReadOnly {
            return Err(StorageError::ReadOnly {
                table: table.to_string(),
            });
        }
        let entry = self
            .tables
            .get_mut(table)
            .ok_or_else(|| StorageError::NotInScope {
                table: table.to_string(),
            })?;
        self.dirty.insert(table.to_string());
        Ok(Arc::make_mut(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{IndexDef, TableDef};
    use serde_json::json;

    fn txn(mode: TxMode) -> Transaction {
        let mut tables = BTreeMap::new();
        tables.insert(
            "people".to_string(),
            Arc::new(Table::new(
                TableDef::keyed("people", "_id").with_index(IndexDef::new("age")),
            )),
        );
        tables.insert(
            "_log".to_string(),
            Arc::new(Table::new(TableDef::auto_increment("_log"))),
        );
        Transaction::new(mode, tables)
    }

    #[test]
    fn add_rejects_existing_key_and_stays_usable() {
        let mut t = txn(TxMode::ReadWrite);
        t.add("people", json!({"_id": "a", "age": 3})).unwrap();
        let err = t.add("people", json!({"_id": "a"})).unwrap_err();
        assert!(err.is_row_error());
        t.add("people", json!({"_id": "b", "age": 3})).unwrap();
        assert_eq!(t.count("people").unwrap(), 2);
        assert_eq!(
            t.find_by_index("people", "age", &json!(3)).unwrap().len(),
            2
        );
    }

    #[test]
    fn read_only_rejects_writes() {
        let mut t = txn(TxMode::ReadOnly);
        assert!(matches!(
            t.put("people", json!({"_id": "a"})),
            Err(StorageError::ReadOnly { .. })
        ));
        assert!(t.get("people", "a").unwrap().is_none());
    }

    #[test]
    fn out_of_scope_table() {
        let t = txn(TxMode::ReadWrite);
        assert!(matches!(
            t.get("other", "a"),
            Err(StorageError::NotInScope { .. })
        ));
    }

    #[test]
    fn auto_increment_and_explicit_keys() {
        let mut t = txn(TxMode::ReadWrite);
        let first = t.add("_log", json!({"n": 1})).unwrap();
        t.put_with_key("_log", "00000000000000000010", json!({"n": 2}))
            .unwrap();
        let next = t.add("_log", json!({"n": 3})).unwrap();
        assert!(first < next);
        assert_eq!(next, "00000000000000000011");
    }

    #[test]
    fn delete_records_ops_only_for_existing_rows() {
        let mut t = txn(TxMode::ReadWrite);
        t.put("people", json!({"_id": "a"})).unwrap();
        assert!(t.delete("people", "a").unwrap());
        assert!(!t.delete("people", "a").unwrap());
        let (ops, _, dirty) = t.into_parts();
        assert_eq!(ops.len(), 2);
        assert!(dirty.contains("people"));
    }
}

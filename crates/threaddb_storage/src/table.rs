//! Table definitions, key ranges and the in-memory ordered table.

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// Width of generated auto-increment keys. Zero padding keeps lexical key
/// order equal to insertion order.
const SEQUENCE_WIDTH: usize = 20;

/// How a table derives the primary key of a stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyScheme {
    /// Key is read from a (dot separated) field of the document.
    Field(String),
    /// Key is assigned from a monotonically increasing sequence.
    AutoIncrement,
}

/// A secondary index over one document field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name, unique within the table.
    pub name: String,
    /// Dot separated field path.
    pub path: String,
    /// Whether two documents may share a value.
    pub unique: bool,
}

impl IndexDef {
    /// Creates a non-unique index named after its path.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: path.clone(),
            path,
            unique: false,
        }
    }

    /// Creates a unique index named after its path.
    pub fn unique(path: impl Into<String>) -> Self {
        Self {
            unique: true,
            ..Self::new(path)
        }
    }
}

/// Schema of a stored table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Primary key derivation.
    pub key: KeyScheme,
    /// Secondary indexes.
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    /// A table keyed by a document field.
    pub fn keyed(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: KeyScheme::Field(path.into()),
            indexes: Vec::new(),
        }
    }

    /// A table keyed by an auto-increment sequence.
    pub fn auto_increment(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: KeyScheme::AutoIncrement,
            indexes: Vec::new(),
        }
    }

    /// Adds a secondary index.
    #[must_use]
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }
}

/// A range of keys to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    lower: Bound<String>,
    upper: Bound<String>,
    prefix: Option<String>,
    limit: Option<usize>,
    reverse: bool,
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

impl KeyRange {
    /// Every key in the table.
    #[must_use]
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
            prefix: None,
            limit: None,
            reverse: false,
        }
    }

    /// Keys starting with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            lower: Bound::Included(prefix.clone()),
            prefix: Some(prefix),
            ..Self::all()
        }
    }

    /// Keys in `[lower, upper)`.
    pub fn between(lower: impl Into<String>, upper: impl Into<String>) -> Self {
        Self {
            lower: Bound::Included(lower.into()),
            upper: Bound::Excluded(upper.into()),
            ..Self::all()
        }
    }

    /// Keys greater than or equal to `lower`.
    pub fn from(lower: impl Into<String>) -> Self {
        Self {
            lower: Bound::Included(lower.into()),
            ..Self::all()
        }
    }

    /// A single key.
    pub fn only(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
            ..Self::all()
        }
    }

    /// Caps the number of returned rows.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Scans from the highest key down.
    #[must_use]
    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l), Bound::Excluded(u))
            | (Bound::Excluded(l), Bound::Included(u))
            | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
            _ => false,
        }
    }

    fn contains_prefix(&self, key: &str) -> bool {
        self.prefix.as_deref().map_or(true, |p| key.starts_with(p))
    }
}

/// Resolves a dot separated path inside a document.
pub fn field_at<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(doc, |current, part| current.as_object()?.get(part))
}

/// Formats an auto-increment sequence number as a key.
#[must_use]
pub fn sequence_key(seq: u64) -> String {
    format!("{seq:0width$}", width = SEQUENCE_WIDTH)
}

/// An ordered table of documents with its index maps.
///
/// Tables are shared between transactions through `Arc` and cloned on the
/// first write, which is what gives readers a stable snapshot.
#[derive(Debug, Clone)]
pub(crate) struct Table {
    def: TableDef,
    rows: BTreeMap<String, Value>,
    indexes: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    next_seq: u64,
}

impl Table {
    pub(crate) fn new(def: TableDef) -> Self {
        let indexes = def
            .indexes
            .iter()
            .map(|i| (i.name.clone(), BTreeMap::new()))
            .collect();
        Self {
            def,
            rows: BTreeMap::new(),
            indexes,
            next_seq: 1,
        }
    }

    pub(crate) fn def(&self) -> &TableDef {
        &self.def
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub(crate) fn set_next_seq(&mut self, next: u64) {
        self.next_seq = self.next_seq.max(next);
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Value> {
        self.rows.get(key)
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.rows.contains_key(key)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &String> {
        self.rows.keys()
    }

    pub(crate) fn rows(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.rows.iter()
    }

    /// Determines the key a document will be stored under. Auto-increment
    /// tables consume a sequence number.
    pub(crate) fn derive_key(&mut self, value: &Value) -> StorageResult<String> {
        match &self.def.key {
            KeyScheme::Field(path) => match field_at(value, path) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(Value::Number(n)) => Ok(n.to_string()),
                _ => Err(StorageError::MissingKey {
                    table: self.def.name.clone(),
                    path: path.clone(),
                }),
            },
            KeyScheme::AutoIncrement => {
                let key = sequence_key(self.next_seq);
                self.next_seq += 1;
                Ok(key)
            }
        }
    }

    /// Inserts or replaces a row, enforcing unique indexes.
    pub(crate) fn insert(&mut self, key: String, value: Value) -> StorageResult<Option<Value>> {
        for index in &self.def.indexes {
            if !index.unique {
                continue;
            }
            let Some(index_key) = index_value(&value, &index.path) else {
                continue;
            };
            let holders = self
                .indexes
                .get(&index.name)
                .and_then(|map| map.get(&index_key));
            if let Some(other) = holders.and_then(|h| h.iter().find(|k| **k != key)) {
                return Err(StorageError::ConstraintViolation {
                    table: self.def.name.clone(),
                    index: index.name.clone(),
                    key: other.clone(),
                });
            }
        }
        Ok(self.insert_unchecked(key, value))
    }

    /// Inserts without constraint checks. Used by log replay, where the
    /// rows were already checked when they were first committed.
    pub(crate) fn insert_unchecked(&mut self, key: String, value: Value) -> Option<Value> {
        if self.def.key == KeyScheme::AutoIncrement {
            if let Ok(seq) = key.parse::<u64>() {
                self.set_next_seq(seq + 1);
            }
        }
        let previous = self.remove(&key);
        self.index_row(&key, &value);
        self.rows.insert(key, value);
        previous
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Value> {
        let previous = self.rows.remove(key)?;
        for index in &self.def.indexes {
            if let Some(index_key) = index_value(&previous, &index.path) {
                if let Some(map) = self.indexes.get_mut(&index.name) {
                    if let Some(holders) = map.get_mut(&index_key) {
                        holders.remove(key);
                        if holders.is_empty() {
                            map.remove(&index_key);
                        }
                    }
                }
            }
        }
        Some(previous)
    }

    pub(crate) fn clear(&mut self) {
        self.rows.clear();
        for map in self.indexes.values_mut() {
            map.clear();
        }
    }

    pub(crate) fn range(&self, range: &KeyRange) -> Vec<(String, Value)> {
        if range.is_empty() {
            return Vec::new();
        }
        let bounds = (range.lower.clone(), range.upper.clone());
        let limit = range.limit.unwrap_or(usize::MAX);
        let iter = self.rows.range::<String, _>(bounds);
        let matching = |(k, _): &(&String, &Value)| range.contains_prefix(k);
        let collect = |(k, v): (&String, &Value)| (k.clone(), v.clone());
        if range.reverse {
            iter.rev().filter(matching).take(limit).map(collect).collect()
        } else {
            // Keys sharing a prefix are contiguous, so stop at the first miss.
            iter.take_while(matching).take(limit).map(collect).collect()
        }
    }

    pub(crate) fn index_lookup(&self, index: &str, value: &Value) -> Option<Vec<String>> {
        let map = self.indexes.get(index)?;
        let key = serde_json::to_string(value).ok()?;
        Some(
            map.get(&key)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default(),
        )
    }

    /// Applies a new definition, rebuilding every index. Fails without
    /// modifying the table if a new unique index would be violated.
    pub(crate) fn redefine(&mut self, def: TableDef) -> StorageResult<()> {
        let mut rebuilt = Table::new(def);
        rebuilt.next_seq = self.next_seq;
        for (key, value) in &self.rows {
            rebuilt.insert(key.clone(), value.clone())?;
        }
        *self = rebuilt;
        Ok(())
    }

    fn index_row(&mut self, key: &str, value: &Value) {
        for index in &self.def.indexes {
            if let Some(index_key) = index_value(value, &index.path) {
                self.indexes
                    .entry(index.name.clone())
                    .or_default()
                    .entry(index_key)
                    .or_default()
                    .insert(key.to_string());
            }
        }
    }
}

fn index_value(doc: &Value, path: &str) -> Option<String> {
    match field_at(doc, path)? {
        Value::Null => None,
        v => serde_json::to_string(v).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn people() -> Table {
        Table::new(TableDef::keyed("people", "_id").with_index(IndexDef::unique("email")))
    }

    #[test]
    fn derive_key_from_field() {
        let mut table = people();
        assert_eq!(table.derive_key(&json!({"_id": "a1"})).unwrap(), "a1");
        assert!(matches!(
            table.derive_key(&json!({"name": "x"})),
            Err(StorageError::MissingKey { .. })
        ));
    }

    #[test]
    fn auto_increment_keys_sort_in_insertion_order() {
        let mut table = Table::new(TableDef::auto_increment("_log"));
        let keys: Vec<String> = (0..12)
            .map(|_| table.derive_key(&json!({})).unwrap())
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys[0].len(), SEQUENCE_WIDTH);
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let mut table = people();
        table
            .insert("a".into(), json!({"_id": "a", "email": "x@y"}))
            .unwrap();
        // Same key may keep its own value.
        table
            .insert("a".into(), json!({"_id": "a", "email": "x@y", "n": 1}))
            .unwrap();
        let err = table
            .insert("b".into(), json!({"_id": "b", "email": "x@y"}))
            .unwrap_err();
        assert!(matches!(err, StorageError::ConstraintViolation { key, .. } if key == "a"));
    }

    #[test]
    fn remove_releases_unique_value() {
        let mut table = people();
        table
            .insert("a".into(), json!({"_id": "a", "email": "x@y"}))
            .unwrap();
        table.remove("a");
        table
            .insert("b".into(), json!({"_id": "b", "email": "x@y"}))
            .unwrap();
        assert_eq!(
            table.index_lookup("email", &json!("x@y")).unwrap(),
            vec!["b".to_string()]
        );
    }

    #[test]
    fn prefix_and_reverse_ranges() {
        let mut table = Table::new(TableDef::keyed("kv", "k"));
        for k in ["a/1", "a/2", "b/1", "a/3"] {
            table.insert(k.into(), json!({"k": k})).unwrap();
        }
        let keys: Vec<String> = table
            .range(&KeyRange::prefix("a/"))
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["a/1", "a/2", "a/3"]);

        let last = table.range(&KeyRange::all().reverse().limit(1));
        assert_eq!(last[0].0, "b/1");

        assert!(table.range(&KeyRange::between("z", "a")).is_empty());
        assert_eq!(table.range(&KeyRange::only("b/1")).len(), 1);
    }

    #[test]
    fn redefine_rejects_violating_unique_index() {
        let mut table = Table::new(TableDef::keyed("people", "_id"));
        table
            .insert("a".into(), json!({"_id": "a", "email": "same"}))
            .unwrap();
        table
            .insert("b".into(), json!({"_id": "b", "email": "same"}))
            .unwrap();
        let def = TableDef::keyed("people", "_id").with_index(IndexDef::unique("email"));
        assert!(table.redefine(def).is_err());
        assert_eq!(table.len(), 2);
        assert!(table.def().indexes.is_empty());
    }
}

//! Schema-bound document collections.

use crate::codec::{KeyValueTable, TableWrite};
use crate::database::DatabaseInner;
use crate::error::{CoreError, CoreResult};
use crate::id::new_id;
use crate::middleware::{MutationRequest, MutationResponse, Pipeline};
use crate::query::{Cursor, Query};
use crate::schema::ValidationIssue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use threaddb_storage::{IndexDef, StorageError, TableDef, Transaction, TxMode};

/// Field every document is keyed by.
pub const ID_FIELD: &str = "_id";

/// Definition of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Collection name. Must not start with `_`.
    pub name: String,
    /// JSON Schema documents must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    /// Secondary indexes.
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

impl CollectionConfig {
    /// A schemaless collection without secondary indexes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            indexes: Vec::new(),
        }
    }

    /// Sets the schema.
    #[must_use]
    pub fn schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Adds a secondary index.
    #[must_use]
    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub(crate) fn table_def(&self) -> TableDef {
        self.indexes
            .iter()
            .cloned()
            .fold(TableDef::keyed(&self.name, ID_FIELD), TableDef::with_index)
    }

    pub(crate) fn check_name(&self) -> CoreResult<()> {
        if self.name.is_empty() || self.name.starts_with('_') {
            return Err(CoreError::validation(
                self.name.clone(),
                vec![ValidationIssue::new(
                    "",
                    "collection names must be non-empty and must not start with '_'",
                )],
            ));
        }
        Ok(())
    }
}

/// A named set of JSON documents keyed by `_id`.
///
/// Handles are cheap to clone. Every operation runs in its own
/// transaction unless issued through [`Collection::write_transaction`] or
/// [`Collection::read_transaction`].
#[derive(Clone)]
pub struct Collection {
    db: Arc<DatabaseInner>,
    name: String,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection").field("name", &self.name).finish()
    }
}

impl Collection {
    pub(crate) fn new(db: Arc<DatabaseInner>, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
        }
    }

    /// The collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The collection's schema, if it has one.
    #[must_use]
    pub fn schema(&self) -> Option<Value> {
        self.db
            .schemas
            .read()
            .get(&self.name)
            .map(|v| v.schema().clone())
    }

    /// Runs `f` in a read-only transaction over this collection.
    pub fn read_transaction<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut CollectionTxn<'_>) -> CoreResult<T>,
    {
        let engine = self.db.engine()?;
        engine.transaction(TxMode::ReadOnly, &[self.name.as_str()], |txn| {
            f(&mut CollectionTxn::new(txn, &self.name, &self.db.pipeline, false))
        })
    }

    /// Runs `f` in a write transaction over this collection. Nothing is
    /// written unless `f` succeeds.
    pub fn write_transaction<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut CollectionTxn<'_>) -> CoreResult<T>,
    {
        let engine = self.db.engine()?;
        let scope = self.db.pipeline.scope(&self.name);
        engine.transaction(TxMode::ReadWrite, &scope, |txn| {
            f(&mut CollectionTxn::new(txn, &self.name, &self.db.pipeline, true))
        })
    }

    /// Inserts new documents and returns their ids in input order.
    ///
    /// # Errors
    ///
    /// [`CoreError::AlreadyExists`] if any id is taken; nothing is written.
    pub fn insert(&self, docs: Vec<Value>) -> CoreResult<Vec<String>> {
        self.write_transaction(|txn| txn.insert(docs))
    }

    /// Inserts or replaces documents and returns their ids in input order.
    pub fn save(&self, docs: Vec<Value>) -> CoreResult<Vec<String>> {
        self.write_transaction(|txn| txn.save(docs))
    }

    /// Deletes documents. Unknown ids are ignored.
    pub fn delete<I, S>(&self, ids: I) -> CoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.write_transaction(|txn| txn.delete(ids))
    }

    /// Returns true if every id exists.
    pub fn has<I, S>(&self, ids: I) -> CoreResult<bool>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.read_transaction(|txn| txn.has(ids))
    }

    /// Looks a document up by id.
    pub fn find_by_id(&self, id: &str) -> CoreResult<Option<Value>> {
        self.read_transaction(|txn| txn.find_by_id(id))
    }

    /// Runs a query over a snapshot of the collection.
    pub fn find(&self, query: Query) -> CoreResult<Cursor> {
        self.read_transaction(|txn| txn.find(query))
    }

    /// The first document matching `query`.
    pub fn find_one(&self, query: Query) -> CoreResult<Option<Value>> {
        self.read_transaction(|txn| txn.find_one(query))
    }

    /// Number of documents matching `query`.
    pub fn count(&self, query: Query) -> CoreResult<usize> {
        self.read_transaction(|txn| txn.count(query))
    }
}

impl KeyValueTable for Collection {
    fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        self.find_by_id(key)
    }

    fn entries(&self) -> CoreResult<Vec<(String, Value)>> {
        let engine = self.db.engine()?;
        engine.transaction(TxMode::ReadOnly, &[self.name.as_str()], |txn| {
            Ok(txn.all(&self.name)?)
        })
    }

    fn apply(&self, writes: Vec<TableWrite>) -> CoreResult<()> {
        self.write_transaction(|txn| {
            for write in writes {
                match write {
                    TableWrite::Put { key, mut value } => {
                        if let Value::Object(fields) = &mut value {
                            fields.insert(ID_FIELD.to_string(), Value::String(key));
                        }
                        txn.save(vec![value])?;
                    }
                    TableWrite::Delete { key } => txn.delete([key])?,
                }
            }
            Ok(())
        })
    }
}

/// A collection bound to an open transaction.
pub struct CollectionTxn<'t> {
    txn: &'t mut Transaction,
    name: &'t str,
    pipeline: &'t Pipeline,
    writable: bool,
}

impl<'t> CollectionTxn<'t> {
    pub(crate) fn new(
        txn: &'t mut Transaction,
        name: &'t str,
        pipeline: &'t Pipeline,
        writable: bool,
    ) -> Self {
        Self {
            txn,
            name,
            pipeline,
            writable,
        }
    }

    /// Returns true inside a write transaction.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Runs `f` with read-only access to the same transaction.
    pub fn read_transaction<T, F>(&mut self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut CollectionTxn<'_>) -> CoreResult<T>,
    {
        f(&mut CollectionTxn::new(&mut *self.txn, self.name, self.pipeline, false))
    }

    /// Runs `f` with write access to the same transaction.
    ///
    /// # Errors
    ///
    /// [`CoreError::TransactionMode`] inside a read transaction.
    pub fn write_transaction<T, F>(&mut self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut CollectionTxn<'_>) -> CoreResult<T>,
    {
        if !self.writable {
            return Err(CoreError::TransactionMode);
        }
        f(self)
    }

    /// See [`Collection::insert`].
    pub fn insert(&mut self, docs: Vec<Value>) -> CoreResult<Vec<String>> {
        let docs = self.with_ids(docs)?;
        let response = self.mutate(MutationRequest::add(self.name, docs))?;
        self.written_keys(response)
    }

    /// See [`Collection::save`].
    pub fn save(&mut self, docs: Vec<Value>) -> CoreResult<Vec<String>> {
        let docs = self.with_ids(docs)?;
        let response = self.mutate(MutationRequest::put(self.name, docs))?;
        self.written_keys(response)
    }

    /// See [`Collection::delete`].
    pub fn delete<I, S>(&mut self, ids: I) -> CoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = ids.into_iter().map(|id| id.as_ref().to_string()).collect();
        self.mutate(MutationRequest::delete(self.name, keys))?;
        Ok(())
    }

    /// See [`Collection::has`].
    pub fn has<I, S>(&self, ids: I) -> CoreResult<bool>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for id in ids {
            if !self.txn.has(self.name, id.as_ref())? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// See [`Collection::find_by_id`].
    pub fn find_by_id(&self, id: &str) -> CoreResult<Option<Value>> {
        Ok(self.txn.get(self.name, id)?)
    }

    /// See [`Collection::find`].
    pub fn find(&self, query: Query) -> CoreResult<Cursor> {
        let docs = self
            .txn
            .all(self.name)?
            .into_iter()
            .map(|(_, doc)| doc)
            .collect();
        Ok(Cursor::new(docs, query))
    }

    /// See [`Collection::find_one`].
    pub fn find_one(&self, query: Query) -> CoreResult<Option<Value>> {
        Ok(self.find(query)?.first())
    }

    /// See [`Collection::count`].
    pub fn count(&self, query: Query) -> CoreResult<usize> {
        Ok(self.find(query)?.count())
    }

    fn mutate(&mut self, request: MutationRequest) -> CoreResult<MutationResponse> {
        if !self.writable {
            return Err(CoreError::TransactionMode);
        }
        self.pipeline.mutate(&mut *self.txn, request)
    }

    fn with_ids(&self, docs: Vec<Value>) -> CoreResult<Vec<Value>> {
        docs.into_iter()
            .map(|mut doc| {
                let Value::Object(fields) = &mut doc else {
                    return Err(CoreError::validation(
                        self.name,
                        vec![ValidationIssue::new("", "document must be an object")],
                    ));
                };
                match fields.get(ID_FIELD) {
                    None | Some(Value::Null) => {
                        fields.insert(ID_FIELD.to_string(), Value::String(new_id()));
                    }
                    Some(Value::String(id)) if !id.is_empty() => {}
                    Some(_) => {
                        return Err(CoreError::validation(
                            self.name,
                            vec![ValidationIssue::new("/_id", "must be a non-empty string")],
                        ))
                    }
                }
                Ok(doc)
            })
            .collect()
    }

    fn written_keys(&self, response: MutationResponse) -> CoreResult<Vec<String>> {
        response
            .results
            .into_iter()
            .map(|result| match result {
                Ok(key) => Ok(key),
                Err(StorageError::KeyExists { key, .. }) => Err(CoreError::AlreadyExists {
                    collection: self.name.to_string(),
                    id: key,
                }),
                Err(other) => Err(other.into()),
            })
            .collect()
    }
}

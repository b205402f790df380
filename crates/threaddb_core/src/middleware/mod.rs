//! Interceptors wrapped around every table mutation.
//!
//! A [`Pipeline`] runs each interceptor's `before_mutate` in order, then
//! the mutation itself, then each `after_mutate` in reverse order, all
//! inside the caller's write transaction. Any interceptor error aborts the
//! call and, through the transaction, every write it made.

mod changes;
mod schema;

pub use changes::{Change, ChangeTracker, ChangeType, CHANGES_TABLE};
pub use schema::{SchemaInterceptor, SchemaRegistry};

use crate::error::CoreResult;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use threaddb_storage::{StorageError, StorageResult, Transaction};

/// What a mutation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Insert; existing keys fail the item.
    Add,
    /// Insert or replace.
    Put,
    /// Remove by key; missing keys are not an error.
    Delete,
}

/// A batch of writes against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    /// Target table.
    pub table: String,
    /// Kind of write.
    pub kind: MutationKind,
    /// Documents for `Add` and `Put`.
    pub values: Vec<Value>,
    /// Keys for `Delete`.
    pub keys: Vec<String>,
}

impl MutationRequest {
    /// Inserts `values`.
    pub fn add(table: impl Into<String>, values: Vec<Value>) -> Self {
        Self::writes(table, MutationKind::Add, values)
    }

    /// Upserts `values`.
    pub fn put(table: impl Into<String>, values: Vec<Value>) -> Self {
        Self::writes(table, MutationKind::Put, values)
    }

    /// Deletes `keys`.
    pub fn delete(table: impl Into<String>, keys: Vec<String>) -> Self {
        Self {
            table: table.into(),
            kind: MutationKind::Delete,
            values: Vec::new(),
            keys,
        }
    }

    fn writes(table: impl Into<String>, kind: MutationKind, values: Vec<Value>) -> Self {
        Self {
            table: table.into(),
            kind,
            values,
            keys: Vec::new(),
        }
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        match self.kind {
            MutationKind::Delete => self.keys.len(),
            _ => self.values.len(),
        }
    }

    /// Returns true if the request has no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A request in flight, plus the pre-images interceptors captured.
#[derive(Debug, Clone)]
pub struct MutationContext {
    /// The request. `before_mutate` may rewrite its values.
    pub request: MutationRequest,
    /// Stored value per key before the write; `None` if absent.
    pub before: BTreeMap<String, Option<Value>>,
}

/// Per-item outcome of a mutation, in request order.
#[derive(Debug, Default)]
pub struct MutationResponse {
    /// The written key, or the error that skipped the item.
    pub results: Vec<Result<String, StorageError>>,
}

impl MutationResponse {
    /// Keys that were written.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.results
            .iter()
            .filter_map(|r| r.as_ref().ok().map(String::as_str))
    }

    /// The first failed item, if any.
    #[must_use]
    pub fn first_error(&self) -> Option<&StorageError> {
        self.results.iter().find_map(|r| r.as_ref().err())
    }
}

/// A hook around table mutations. Every method defaults to a no-op.
pub trait Interceptor: Send + Sync {
    /// Extra tables this interceptor writes, added to the scope of every
    /// write transaction.
    fn scope(&self) -> &'static [&'static str] {
        &[]
    }

    /// Runs before the mutation.
    fn before_mutate(&self, _txn: &mut Transaction, _ctx: &mut MutationContext) -> CoreResult<()> {
        Ok(())
    }

    /// Runs after the mutation, in the same transaction.
    fn after_mutate(
        &self,
        _txn: &mut Transaction,
        _ctx: &MutationContext,
        _response: &MutationResponse,
    ) -> CoreResult<()> {
        Ok(())
    }
}

/// An ordered list of interceptors.
#[derive(Clone, Default)]
pub struct Pipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

impl Pipeline {
    /// An empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an interceptor.
    #[must_use]
    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Tables a write transaction on `table` must cover.
    pub fn scope<'a>(&self, table: &'a str) -> Vec<&'a str> {
        let mut tables = vec![table];
        for &extra in self.interceptors.iter().flat_map(|i| i.scope()) {
            if !tables.contains(&extra) {
                tables.push(extra);
            }
        }
        tables
    }

    /// Runs `request` through every interceptor.
    ///
    /// Row-level storage failures (duplicate key, missing key, unique
    /// index violation) are reported per item; any other failure aborts.
    pub fn mutate(
        &self,
        txn: &mut Transaction,
        request: MutationRequest,
    ) -> CoreResult<MutationResponse> {
        let mut ctx = MutationContext {
            request,
            before: BTreeMap::new(),
        };
        for interceptor in &self.interceptors {
            interceptor.before_mutate(txn, &mut ctx)?;
        }
        let response = execute(txn, &ctx.request)?;
        for interceptor in self.interceptors.iter().rev() {
            interceptor.after_mutate(txn, &ctx, &response)?;
        }
        Ok(response)
    }
}

fn execute(txn: &mut Transaction, request: &MutationRequest) -> CoreResult<MutationResponse> {
    let table = request.table.as_str();
    let mut results = Vec::with_capacity(request.len());
    match request.kind {
        MutationKind::Add => {
            for value in &request.values {
                results.push(per_item(txn.add(table, value.clone()))?);
            }
        }
        MutationKind::Put => {
            for value in &request.values {
                results.push(per_item(txn.put(table, value.clone()))?);
            }
        }
        MutationKind::Delete => {
            for key in &request.keys {
                let outcome = txn.delete(table, key).map(|_| key.clone());
                results.push(per_item(outcome)?);
            }
        }
    }
    Ok(MutationResponse { results })
}

fn per_item(outcome: StorageResult<String>) -> CoreResult<Result<String, StorageError>> {
    match outcome {
        Ok(key) => Ok(Ok(key)),
        Err(err) if err.is_row_error() => Ok(Err(err)),
        Err(err) => Err(err.into()),
    }
}

use super::{Interceptor, MutationContext, MutationKind, MutationResponse};
use crate::error::CoreResult;
use crate::patch::{self, Operation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use threaddb_storage::Transaction;

/// Name of the change log table.
pub const CHANGES_TABLE: &str = "_changes";

/// How a document changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// The document was created.
    Add,
    /// An existing document was replaced.
    Put,
    /// The document was removed.
    Delete,
}

/// One unpushed local mutation of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Collection name.
    pub name: String,
    /// Document id.
    pub key: String,
    /// Kind of change.
    #[serde(rename = "type")]
    pub kind: ChangeType,
    /// Operations turning `before` into `after`; `None` for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ops: Option<Vec<Operation>>,
    /// Document before the change.
    #[serde(default)]
    pub before: Option<Value>,
    /// Document after the change.
    #[serde(default)]
    pub after: Option<Value>,
}

impl Change {
    /// Returns true for a put that did not alter the document.
    #[must_use]
    pub fn is_marker(&self) -> bool {
        self.kind == ChangeType::Put && self.ops.as_ref().is_some_and(Vec::is_empty)
    }
}

/// Records every mutation of a user table in [`CHANGES_TABLE`], inside the
/// mutation's own transaction.
///
/// Tables whose names start with `_` are not tracked. Items that failed in
/// storage produce no record, and several items for one key in a single
/// request collapse into one record.
#[derive(Debug, Clone)]
pub struct ChangeTracker {
    enabled: bool,
}

impl ChangeTracker {
    /// Creates a tracker. A disabled tracker records nothing.
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    fn tracks(&self, table: &str) -> bool {
        self.enabled && !table.starts_with('_')
    }
}

impl Interceptor for ChangeTracker {
    fn scope(&self) -> &'static [&'static str] {
        &[CHANGES_TABLE]
    }

    fn before_mutate(&self, txn: &mut Transaction, ctx: &mut MutationContext) -> CoreResult<()> {
        let table = ctx.request.table.as_str();
        if !self.tracks(table) {
            return Ok(());
        }
        let keys: Vec<String> = match ctx.request.kind {
            MutationKind::Delete => ctx.request.keys.clone(),
            // Documents without a derivable key fail in storage and are
            // skipped there.
            _ => ctx
                .request
                .values
                .iter()
                .filter_map(|v| txn.key_of(table, v).ok().flatten())
                .collect(),
        };
        for key in keys {
            if !ctx.before.contains_key(&key) {
                let current = txn.get(table, &key)?;
                ctx.before.insert(key, current);
            }
        }
        Ok(())
    }

    fn after_mutate(
        &self,
        txn: &mut Transaction,
        ctx: &MutationContext,
        response: &MutationResponse,
    ) -> CoreResult<()> {
        let table = ctx.request.table.as_str();
        if !self.tracks(table) {
            return Ok(());
        }
        let mut seen = BTreeSet::new();
        let mut recorded = 0usize;
        for key in response.keys() {
            if !seen.insert(key) {
                continue;
            }
            let before = ctx.before.get(key).cloned().flatten();
            let after = txn.get(table, key)?;
            let change = match ctx.request.kind {
                // Nothing was there to delete.
                MutationKind::Delete if before.is_none() => continue,
                MutationKind::Delete => Change {
                    name: table.to_string(),
                    key: key.to_string(),
                    kind: ChangeType::Delete,
                    ops: None,
                    before,
                    after: None,
                },
                MutationKind::Add | MutationKind::Put => {
                    let empty = json!({});
                    let ops = patch::compare(
                        before.as_ref().unwrap_or(&empty),
                        after.as_ref().unwrap_or(&empty),
                    );
                    let kind = if before.is_none() {
                        ChangeType::Add
                    } else {
                        ChangeType::Put
                    };
                    Change {
                        name: table.to_string(),
                        key: key.to_string(),
                        kind,
                        ops: Some(ops),
                        before,
                        after,
                    }
                }
            };
            txn.add(CHANGES_TABLE, serde_json::to_value(&change)?)?;
            recorded += 1;
        }
        tracing::trace!(table, recorded, "recorded changes");
        Ok(())
    }
}

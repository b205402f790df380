use super::{Interceptor, MutationContext, MutationKind};
use crate::error::{CoreError, CoreResult};
use crate::schema::SchemaValidator;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use threaddb_storage::Transaction;

/// Compiled schemas by table name, shared with the database.
pub type SchemaRegistry = Arc<RwLock<BTreeMap<String, Arc<SchemaValidator>>>>;

/// Validates documents against their table's schema and fills defaults.
///
/// One invalid document rejects the whole request.
#[derive(Debug, Clone, Default)]
pub struct SchemaInterceptor {
    registry: SchemaRegistry,
}

impl SchemaInterceptor {
    /// Creates an interceptor reading from `registry`.
    pub fn new(registry: SchemaRegistry) -> Self {
        Self { registry }
    }
}

impl Interceptor for SchemaInterceptor {
    fn before_mutate(&self, _txn: &mut Transaction, ctx: &mut MutationContext) -> CoreResult<()> {
        if ctx.request.kind == MutationKind::Delete {
            return Ok(());
        }
        let Some(validator) = self.registry.read().get(&ctx.request.table).cloned() else {
            return Ok(());
        };
        let mut issues = Vec::new();
        for value in &mut ctx.request.values {
            if let Err(found) = validator.validate(value) {
                issues.extend(found);
            }
        }
        if issues.is_empty() {
            Ok(())
        } else {
            tracing::debug!(table = %ctx.request.table, issues = issues.len(), "rejected invalid documents");
            Err(CoreError::validation(ctx.request.table.clone(), issues))
        }
    }
}

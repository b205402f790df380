//! The database: collections, versioned schemas and the remote handle.

use crate::codec::Codec;
use crate::collection::{Collection, CollectionConfig};
use crate::config::{DatabaseConfig, RemoteConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{CoreError, CoreResult};
use crate::middleware::{ChangeTracker, Pipeline, SchemaInterceptor, SchemaRegistry, CHANGES_TABLE};
use crate::remote::{Remote, STASH_TABLE};
use crate::schema::SchemaValidator;
use crate::store::Store;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use threaddb_storage::{Engine, TableDef, TxMode};
use threaddb_sync_protocol::Connector;

/// Key-value metadata table.
pub const META_TABLE: &str = "_meta";
/// Table of collection definitions.
pub const SCHEMAS_TABLE: &str = "_schemas";

pub(crate) const META_VERSION: &str = "version";
pub(crate) const META_THREAD_ID: &str = "thread-id";
pub(crate) const META_REMOTE_CONFIG: &str = "remote-config";

#[derive(Default)]
struct DbState {
    engine: Option<Arc<Engine>>,
    dispatcher: Option<Dispatcher>,
    pending: BTreeMap<String, CollectionConfig>,
    version: u64,
    collections: Option<Vec<String>>,
    closed: bool,
}

pub(crate) struct DatabaseInner {
    pub(crate) config: DatabaseConfig,
    state: RwLock<DbState>,
    pub(crate) schemas: SchemaRegistry,
    pub(crate) pipeline: Pipeline,
    pub(crate) connector: Option<Arc<dyn Connector>>,
    pub(crate) remote: RwLock<RemoteConfig>,
}

impl DatabaseInner {
    pub(crate) fn engine(&self) -> CoreResult<Arc<Engine>> {
        let state = self.state.read();
        if state.closed {
            return Err(CoreError::DatabaseClosed);
        }
        state.engine.clone().ok_or(CoreError::DatabaseNotOpen)
    }

    /// Names of every user collection.
    pub(crate) fn user_tables(&self) -> CoreResult<Vec<String>> {
        Ok(self
            .engine()?
            .table_names()
            .into_iter()
            .filter(|name| !name.starts_with('_'))
            .collect())
    }

    /// Stored definitions of every collection.
    pub(crate) fn stored_configs(&self) -> CoreResult<BTreeMap<String, CollectionConfig>> {
        read_configs(&*self.engine()?)
    }

    pub(crate) fn meta_get(&self, key: &str) -> CoreResult<Option<Value>> {
        meta_get(&*self.engine()?, key)
    }

    pub(crate) fn meta_put(&self, entries: &[(&str, Value)]) -> CoreResult<()> {
        self.engine()?
            .transaction(TxMode::ReadWrite, &[META_TABLE], |txn| {
                for (key, value) in entries {
                    txn.put(META_TABLE, json!({ "key": key, "value": value }))?;
                }
                Ok::<_, CoreError>(())
            })
    }
}

/// A local document database.
///
/// Collections are declared with [`Database::collection_config`] and
/// created by [`Database::open`]; schema changes require a higher version
/// than the one already stored. Handles are cheap to clone.
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use threaddb_core::{CollectionConfig, Database, DatabaseConfig, Query};
///
/// let db = Database::new(DatabaseConfig::new("notes"));
/// db.collection_config(CollectionConfig::new("people")).unwrap();
/// db.open(1).unwrap();
///
/// let people = db.collection("people").unwrap();
/// let ids = people.insert(vec![json!({"name": "ada", "age": 36})]).unwrap();
/// assert_eq!(ids[0].len(), 26);
/// assert_eq!(people.count(Query::parse(json!({"age": {"$gt": 30}})).unwrap()).unwrap(), 1);
/// ```
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.config.name)
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Creates a database without a remote connector. Nothing is opened
    /// until [`Database::open`].
    #[must_use]
    pub fn new(config: DatabaseConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a database whose remote connects through `connector`.
    #[must_use]
    pub fn with_connector(config: DatabaseConfig, connector: Arc<dyn Connector>) -> Self {
        Self::build(config, Some(connector))
    }

    fn build(config: DatabaseConfig, connector: Option<Arc<dyn Connector>>) -> Self {
        let schemas = SchemaRegistry::default();
        let pipeline = Pipeline::new()
            .with(Arc::new(SchemaInterceptor::new(schemas.clone())))
            .with(Arc::new(ChangeTracker::new(config.track_changes)));
        Self {
            inner: Arc::new(DatabaseInner {
                config,
                state: RwLock::new(DbState::default()),
                schemas,
                pipeline,
                connector,
                remote: RwLock::new(RemoteConfig::default()),
            }),
        }
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Declares a collection, applied by the next [`Database::open`].
    pub fn collection_config(&self, config: CollectionConfig) -> CoreResult<()> {
        config.check_name()?;
        if let Some(schema) = &config.schema {
            SchemaValidator::new(schema.clone())?;
        }
        let mut state = self.inner.state.write();
        if state.closed {
            return Err(CoreError::DatabaseClosed);
        }
        state.pending.insert(config.name.clone(), config);
        Ok(())
    }

    /// Opens the database at `version`, applying declared collections.
    ///
    /// Opening again at the stored version with no new declarations is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// [`CoreError::Version`] if `version` is below the stored version, or
    /// equal to it while declared collections differ from the stored ones.
    pub fn open(&self, version: u64) -> CoreResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.write();
        if state.closed {
            return Err(CoreError::DatabaseClosed);
        }
        let engine = match &state.engine {
            Some(engine) => Arc::clone(engine),
            None => Arc::new(match &inner.config.path {
                Some(path) => Engine::open_path(path)?,
                None => Engine::in_memory()?,
            }),
        };
        for def in internal_tables() {
            engine.ensure_table(def)?;
        }

        let stored_version = meta_get(&engine, META_VERSION)?
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let mut configs = read_configs(&engine)?;
        let changed: Vec<CollectionConfig> = state
            .pending
            .values()
            .filter(|c| configs.get(&c.name) != Some(*c))
            .cloned()
            .collect();

        if version < stored_version {
            return Err(CoreError::Version {
                requested: version,
                stored: stored_version,
                message: "stored version is newer".into(),
            });
        }
        if version == stored_version && !changed.is_empty() {
            return Err(CoreError::Version {
                requested: version,
                stored: stored_version,
                message: "schema changes require a higher version".into(),
            });
        }
        if version > stored_version {
            apply_configs(&engine, &changed, version)?;
            tracing::info!(
                db = %inner.config.name,
                from = stored_version,
                to = version,
                collections = changed.len(),
                "upgraded database"
            );
            for config in changed {
                configs.insert(config.name.clone(), config);
            }
        }

        let mut registry = BTreeMap::new();
        for config in configs.values() {
            if let Some(schema) = &config.schema {
                registry.insert(
                    config.name.clone(),
                    Arc::new(SchemaValidator::new(schema.clone())?),
                );
            }
        }
        *inner.schemas.write() = registry;

        let mut remote = match meta_get(&engine, META_REMOTE_CONFIG)? {
            Some(stored) => serde_json::from_value(stored)?,
            None => RemoteConfig::default(),
        };
        if remote.id.is_none() {
            if let Some(id) = meta_get(&engine, META_THREAD_ID)? {
                remote.id = Some(serde_json::from_value(id)?);
            }
        }
        {
            let mut current = inner.remote.write();
            remote.merge(std::mem::take(&mut *current));
            *current = remote;
        }

        if state.dispatcher.is_none() {
            state.dispatcher = Some(if inner.config.event_log {
                Dispatcher::with_log(Arc::clone(&engine))?
            } else {
                Dispatcher::new()
            });
        }
        state.engine = Some(engine);
        state.version = version.max(stored_version);
        state.pending.clear();
        state.collections = None;
        tracing::debug!(db = %inner.config.name, version = state.version, "opened database");
        Ok(())
    }

    /// Returns true once opened and until closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        let state = self.inner.state.read();
        state.engine.is_some() && !state.closed
    }

    /// The schema version; 0 before the first upgrade.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.state.read().version
    }

    /// Declares a collection. On an open database the change is applied at
    /// once under the next version.
    pub fn new_collection(&self, config: CollectionConfig) -> CoreResult<Collection> {
        let name = config.name.clone();
        self.collection_config(config)?;
        if self.is_open() {
            self.open(self.version() + 1)?;
        }
        Ok(Collection::new(Arc::clone(&self.inner), name))
    }

    /// Drops a collection and its documents.
    pub fn drop_collection(&self, name: &str) -> CoreResult<()> {
        let engine = self.inner.engine()?;
        if name.starts_with('_') || !engine.has_table(name) {
            return Err(CoreError::CollectionNotFound {
                name: name.to_string(),
            });
        }
        engine.drop_table(name)?;
        engine.transaction(TxMode::ReadWrite, &[SCHEMAS_TABLE], |txn| {
            txn.delete(SCHEMAS_TABLE, name)
        })?;
        self.inner.schemas.write().remove(name);
        self.inner.state.write().collections = None;
        tracing::debug!(collection = name, "dropped collection");
        Ok(())
    }

    /// Every user collection, in name order.
    pub fn collections(&self) -> CoreResult<Vec<Collection>> {
        let cached = self.inner.state.read().collections.clone();
        let names = match cached {
            Some(names) => names,
            None => {
                let names = self.inner.user_tables()?;
                self.inner.state.write().collections = Some(names.clone());
                names
            }
        };
        Ok(names
            .into_iter()
            .map(|name| Collection::new(Arc::clone(&self.inner), name))
            .collect())
    }

    /// A collection by name.
    ///
    /// # Errors
    ///
    /// [`CoreError::CollectionNotFound`] if it does not exist.
    pub fn collection(&self, name: &str) -> CoreResult<Collection> {
        self.collections()?
            .into_iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| CoreError::CollectionNotFound {
                name: name.to_string(),
            })
    }

    /// A dispatcher-backed store over a collection.
    pub fn store(&self, name: &str, codec: Arc<dyn Codec>) -> CoreResult<Store> {
        let collection = self.collection(name)?;
        let dispatcher = self
            .inner
            .state
            .read()
            .dispatcher
            .clone()
            .ok_or(CoreError::DatabaseNotOpen)?;
        Ok(Store::new(
            name,
            Arc::new(collection),
            codec,
            dispatcher,
            self.inner.config.lock_timeout,
        ))
    }

    /// The events persisted by the dispatcher, when the event log is on.
    pub fn logged_events(&self) -> CoreResult<Vec<crate::codec::Event>> {
        match &self.inner.state.read().dispatcher {
            Some(dispatcher) => dispatcher.logged_events(),
            None => Err(CoreError::DatabaseNotOpen),
        }
    }

    /// The sync handle.
    #[must_use]
    pub fn remote(&self) -> Remote {
        Remote::new(Arc::clone(&self.inner))
    }

    /// Removes every table, including internal ones, and closes the
    /// database.
    pub fn delete(&self) -> CoreResult<()> {
        let engine = self.inner.engine()?;
        for name in engine.table_names() {
            engine.drop_table(&name)?;
        }
        engine.compact()?;
        self.inner.schemas.write().clear();
        tracing::info!(db = %self.inner.config.name, "deleted database");
        self.close()
    }

    /// Flushes and closes the database. Closing twice is a no-op.
    pub fn close(&self) -> CoreResult<()> {
        let mut state = self.inner.state.write();
        if state.closed {
            return Ok(());
        }
        if let Some(engine) = &state.engine {
            if self.inner.config.compact_on_close {
                engine.compact()?;
            }
            engine.close()?;
        }
        // Releases the file lock once the last handle drops.
        state.engine = None;
        state.dispatcher = None;
        state.closed = true;
        state.collections = None;
        tracing::debug!(db = %self.inner.config.name, "closed database");
        Ok(())
    }
}

fn internal_tables() -> [TableDef; 4] {
    [
        TableDef::keyed(META_TABLE, "key"),
        TableDef::keyed(SCHEMAS_TABLE, "name"),
        TableDef::auto_increment(CHANGES_TABLE),
        TableDef::auto_increment(STASH_TABLE),
    ]
}

fn meta_get(engine: &Engine, key: &str) -> CoreResult<Option<Value>> {
    let row = engine.transaction(TxMode::ReadOnly, &[META_TABLE], |txn| txn.get(META_TABLE, key))?;
    Ok(row.and_then(|mut row| row.get_mut("value").map(Value::take)))
}

fn read_configs(engine: &Engine) -> CoreResult<BTreeMap<String, CollectionConfig>> {
    engine.transaction(TxMode::ReadOnly, &[SCHEMAS_TABLE], |txn| {
        txn.all(SCHEMAS_TABLE)?
            .into_iter()
            .map(|(name, row)| Ok((name, serde_json::from_value(row)?)))
            .collect::<CoreResult<BTreeMap<String, CollectionConfig>>>()
    })
}

fn apply_configs(engine: &Engine, configs: &[CollectionConfig], version: u64) -> CoreResult<()> {
    // Compile every schema before anything is written.
    for config in configs {
        if let Some(schema) = &config.schema {
            SchemaValidator::new(schema.clone())?;
        }
    }
    for config in configs {
        engine.ensure_table(config.table_def())?;
    }
    engine.transaction(TxMode::ReadWrite, &[SCHEMAS_TABLE, META_TABLE], |txn| {
        for config in configs {
            txn.put(SCHEMAS_TABLE, serde_json::to_value(config)?)?;
        }
        txn.put(META_TABLE, json!({ "key": META_VERSION, "value": version }))?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;

    fn people() -> CollectionConfig {
        CollectionConfig::new("people").schema(json!({
            "type": "object",
            "required": ["age"],
            "properties": {"age": {"type": "integer"}}
        }))
    }

    #[test]
    fn collections_require_open() {
        let db = Database::new(DatabaseConfig::default());
        let people = db.new_collection(people()).unwrap();
        assert!(matches!(people.insert(vec![json!({"age": 1})]), Err(CoreError::DatabaseNotOpen)));
        db.open(1).unwrap();
        people.insert(vec![json!({"age": 1})]).unwrap();
        assert_eq!(db.version(), 1);
    }

    #[test]
    fn version_rules() {
        let db = Database::new(DatabaseConfig::default());
        db.collection_config(people()).unwrap();
        db.open(2).unwrap();
        // Reopening at the same version without changes is fine.
        db.open(2).unwrap();

        assert!(matches!(db.open(1), Err(CoreError::Version { .. })));

        db.collection_config(CollectionConfig::new("pets")).unwrap();
        assert!(matches!(db.open(2), Err(CoreError::Version { .. })));
        db.open(3).unwrap();
        let names: Vec<String> = db
            .collections()
            .unwrap()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["people", "pets"]);
    }

    #[test]
    fn new_collection_on_open_database_bumps_version() {
        let db = Database::new(DatabaseConfig::default());
        db.open(1).unwrap();
        let pets = db.new_collection(CollectionConfig::new("pets")).unwrap();
        assert_eq!(db.version(), 2);
        pets.save(vec![json!({"_id": "rex"})]).unwrap();
        assert!(pets.has(["rex"]).unwrap());
    }

    #[test]
    fn internal_names_are_rejected_and_hidden() {
        let db = Database::new(DatabaseConfig::default());
        assert!(db.collection_config(CollectionConfig::new("_secret")).is_err());
        db.open(0).unwrap();
        assert!(db.collections().unwrap().is_empty());
        assert!(matches!(
            db.collection(CHANGES_TABLE),
            Err(CoreError::CollectionNotFound { .. })
        ));
    }

    #[test]
    fn drop_and_close() {
        let db = Database::new(DatabaseConfig::default());
        db.collection_config(people()).unwrap();
        db.open(1).unwrap();
        db.drop_collection("people").unwrap();
        assert!(db.collection("people").is_err());
        assert!(db.drop_collection("people").is_err());

        db.close().unwrap();
        db.close().unwrap();
        assert!(!db.is_open());
        assert!(matches!(db.collections(), Err(CoreError::DatabaseClosed)));
        assert!(matches!(db.open(2), Err(CoreError::DatabaseClosed)));
    }

    #[test]
    fn invalid_schema_is_rejected_up_front() {
        let db = Database::new(DatabaseConfig::default());
        let bad = CollectionConfig::new("bad").schema(json!({"pattern": "("}));
        assert!(matches!(db.collection_config(bad), Err(CoreError::Validation { .. })));
    }

    #[test]
    fn schema_and_indexes_apply() {
        let db = Database::new(DatabaseConfig::default());
        db.collection_config(
            people().index(threaddb_storage::IndexDef::unique("email")),
        )
        .unwrap();
        db.open(1).unwrap();
        let people = db.collection("people").unwrap();
        assert!(people.schema().is_some());
        people
            .insert(vec![json!({"age": 1, "email": "a@x"})])
            .unwrap();
        assert!(matches!(
            people.insert(vec![json!({"age": 2, "email": "a@x"})]),
            Err(CoreError::Storage(_))
        ));
        assert_eq!(people.count(Query::all()).unwrap(), 1);
    }
}

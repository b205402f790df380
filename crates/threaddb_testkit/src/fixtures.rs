//! Test fixtures and database helpers.

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use threaddb_core::{CollectionConfig, Database, DatabaseConfig, RemoteConfig};
use threaddb_sync_protocol::{Connector, HmacIdentity, Identity, MemoryConnector, MemoryThreadStore};
use tracing_subscriber::EnvFilter;

/// Host name the in-process remote answers to.
pub const TEST_HOST: &str = "memory://threads";

/// Installs a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    config: DatabaseConfig,
    temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates an unopened in-memory database.
    pub fn memory() -> Self {
        let config = DatabaseConfig::new("test");
        Self {
            db: Database::new(config.clone()),
            config,
            temp_dir: None,
        }
    }

    /// Creates an unopened database backed by a file in a fresh temporary
    /// directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = DatabaseConfig::new("test").path(temp_dir.path().join("commit.log"));
        Self {
            db: Database::new(config.clone()),
            config,
            temp_dir: Some(temp_dir),
        }
    }

    /// Creates an in-memory database with `collections` declared and
    /// opened at version 1.
    pub fn with_collections(collections: impl IntoIterator<Item = CollectionConfig>) -> Self {
        let test_db = Self::memory();
        for config in collections {
            test_db
                .db
                .collection_config(config)
                .expect("Failed to declare collection");
        }
        test_db.db.open(1).expect("Failed to open database");
        test_db
    }

    /// Closes the current handle and returns a fresh, unopened one over the
    /// same storage. Only meaningful for file databases.
    pub fn reopen(&mut self) -> &Database {
        self.db.close().expect("Failed to close database");
        self.db = Database::new(self.config.clone());
        &self.db
    }

    /// Returns the commit log path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().join("commit.log"))
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// An in-process remote thread store with a registered identity.
pub struct TestRemote {
    /// The backing store, for inspecting and editing remote state.
    pub store: Arc<MemoryThreadStore>,
    /// An identity the store accepts.
    pub identity: HmacIdentity,
}

impl TestRemote {
    /// A remote that accepts unauthenticated calls.
    pub fn new() -> Self {
        Self::build(MemoryThreadStore::new())
    }

    /// A remote that requires a bearer token from authorization.
    pub fn with_auth() -> Self {
        Self::build(MemoryThreadStore::with_auth())
    }

    fn build(store: MemoryThreadStore) -> Self {
        let identity = HmacIdentity::random();
        store.register_identity(identity.public_key(), identity.secret());
        Self {
            store: Arc::new(store),
            identity,
        }
    }

    /// A connector over the store.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector::new(Arc::clone(&self.store)))
    }

    /// Remote settings pointing at the store.
    pub fn config(&self) -> RemoteConfig {
        RemoteConfig::new(TEST_HOST)
    }

    /// An unopened database wired to the store.
    pub fn database(&self, config: DatabaseConfig) -> Database {
        let db = Database::with_connector(config, self.connector());
        db.remote()
            .set(self.config())
            .expect("Failed to configure remote");
        db
    }
}

impl Default for TestRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_database_opens() {
        let db = TestDatabase::with_collections([CollectionConfig::new("notes")]);
        assert!(db.is_open());
        assert!(db.path().is_none());
        assert!(db.collection("notes").is_ok());
    }

    #[test]
    fn file_database_reopens() {
        let mut db = TestDatabase::file();
        db.collection_config(CollectionConfig::new("notes")).unwrap();
        db.open(1).unwrap();
        db.collection("notes")
            .unwrap()
            .save(vec![serde_json::json!({"_id": "a"})])
            .unwrap();

        let reopened = db.reopen();
        reopened.open(1).unwrap();
        assert!(reopened.collection("notes").unwrap().has(["a"]).unwrap());
    }

    #[test]
    fn remote_database_is_configured() {
        let remote = TestRemote::new();
        let db = remote.database(DatabaseConfig::new("notes"));
        assert_eq!(db.remote().config().service_host.as_deref(), Some(TEST_HOST));
    }
}

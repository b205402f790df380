//! Client interface of a remote thread store.

use crate::error::ProtocolResult;
use crate::messages::{CollectionInfo, DbInfo, Endpoint};
use crate::thread_id::ThreadId;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A connection to a thread store.
///
/// Implementations carry the [`Endpoint`] metadata they were connected
/// with and attach it to every call.
#[async_trait]
pub trait ThreadClient: Send + Sync {
    /// Asks the service for a challenge to sign with `public_key`.
    async fn token_challenge(&self, public_key: &str) -> ProtocolResult<Vec<u8>>;

    /// Exchanges a signed challenge for a bearer token.
    async fn token(&self, public_key: &str, signature: &[u8]) -> ProtocolResult<String>;

    /// Creates a database on a new thread with the given collections.
    ///
    /// Fails with [`ProtocolError::AlreadyExists`](crate::ProtocolError::AlreadyExists)
    /// if the thread already hosts a database.
    async fn new_db(
        &self,
        name: &str,
        thread_id: &ThreadId,
        collections: Vec<CollectionInfo>,
    ) -> ProtocolResult<()>;

    /// Describes the database on a thread.
    async fn get_db_info(&self, thread_id: &ThreadId) -> ProtocolResult<DbInfo>;

    /// Describes one collection.
    async fn get_collection_info(
        &self,
        thread_id: &ThreadId,
        name: &str,
    ) -> ProtocolResult<CollectionInfo>;

    /// Registers a collection on an existing database.
    ///
    /// Fails with
    /// [`ProtocolError::CollectionAlreadyRegistered`](crate::ProtocolError::CollectionAlreadyRegistered)
    /// if the name is taken.
    async fn new_collection(
        &self,
        thread_id: &ThreadId,
        info: CollectionInfo,
    ) -> ProtocolResult<()>;

    /// Returns every document of a collection matching `query`. An empty
    /// object matches everything.
    async fn find(
        &self,
        thread_id: &ThreadId,
        collection: &str,
        query: &Value,
    ) -> ProtocolResult<Vec<Value>>;

    /// Opens a write transaction over one collection.
    async fn write_transaction(
        &self,
        thread_id: &ThreadId,
        collection: &str,
    ) -> ProtocolResult<Box<dyn RemoteTransaction>>;
}

/// A write transaction on a remote collection.
///
/// Writes are buffered by the service between [`start`](Self::start) and
/// [`end`](Self::end), and applied together when `end` succeeds.
#[async_trait]
pub trait RemoteTransaction: Send {
    /// Begins the transaction.
    async fn start(&mut self) -> ProtocolResult<()>;

    /// Creates new documents and returns their ids.
    async fn create(&mut self, docs: Vec<Value>) -> ProtocolResult<Vec<String>>;

    /// Replaces existing documents.
    async fn save(&mut self, docs: Vec<Value>) -> ProtocolResult<()>;

    /// Deletes documents by id.
    async fn delete(&mut self, ids: Vec<String>) -> ProtocolResult<()>;

    /// Returns true if every id exists.
    async fn has(&mut self, ids: Vec<String>) -> ProtocolResult<bool>;

    /// Queries the collection, including this transaction's writes.
    async fn find(&mut self, query: &Value) -> ProtocolResult<Vec<Value>>;

    /// Commits the transaction.
    async fn end(&mut self) -> ProtocolResult<()>;

    /// Abandons the transaction.
    async fn discard(&mut self) -> ProtocolResult<()>;
}

/// Opens [`ThreadClient`] connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `endpoint`.
    async fn connect(&self, endpoint: &Endpoint) -> ProtocolResult<Arc<dyn ThreadClient>>;
}

//! An in-process thread store, for tests and offline development.

use crate::client::{Connector, RemoteTransaction, ThreadClient};
use crate::error::{ProtocolError, ProtocolResult};
use crate::identity::verify_hmac;
use crate::messages::{CollectionInfo, DbInfo, Endpoint};
use crate::thread_id::ThreadId;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct RemoteCollection {
    info: CollectionInfo,
    docs: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
struct RemoteDb {
    name: String,
    collections: BTreeMap<String, RemoteCollection>,
}

#[derive(Debug, Default)]
struct State {
    dbs: BTreeMap<ThreadId, RemoteDb>,
    identities: BTreeMap<String, Vec<u8>>,
    challenges: BTreeMap<String, Vec<u8>>,
    tokens: BTreeSet<String>,
    fail_commit_after: Option<usize>,
    fail_discard: bool,
    commits: usize,
    discards: usize,
}

/// A thread store held entirely in memory.
///
/// Several local databases can connect to one store through a
/// [`MemoryConnector`], which makes push/pull round trips testable
/// without a network. When created with [`MemoryThreadStore::with_auth`]
/// every call except the token handshake requires a bearer token issued
/// to a registered identity.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use threaddb_sync_protocol::{MemoryConnector, MemoryThreadStore};
///
/// let store = Arc::new(MemoryThreadStore::new());
/// let connector = MemoryConnector::new(Arc::clone(&store));
/// # let _ = connector;
/// ```
#[derive(Debug, Default)]
pub struct MemoryThreadStore {
    state: Mutex<State>,
    require_auth: bool,
}

impl MemoryThreadStore {
    /// Creates a store that accepts unauthenticated calls.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that requires a bearer token.
    #[must_use]
    pub fn with_auth() -> Self {
        Self {
            state: Mutex::default(),
            require_auth: true,
        }
    }

    /// Registers the secret behind a public key so its signatures verify.
    pub fn register_identity(&self, public_key: impl Into<String>, secret: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .identities
            .insert(public_key.into(), secret.into());
    }

    /// Makes the commit following the next `n` successful commits fail
    /// once with a retryable transport error.
    pub fn fail_commit_after(&self, n: usize) {
        self.state.lock().fail_commit_after = Some(n);
    }

    /// Makes every discard fail.
    pub fn set_fail_discard(&self, fail: bool) {
        self.state.lock().fail_discard = fail;
    }

    /// Number of committed transactions.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.state.lock().commits
    }

    /// Number of discarded transactions.
    #[must_use]
    pub fn discard_count(&self) -> usize {
        self.state.lock().discards
    }

    /// Returns true if a database exists on the thread.
    #[must_use]
    pub fn has_db(&self, thread_id: &ThreadId) -> bool {
        self.state.lock().dbs.contains_key(thread_id)
    }

    /// Every document of a collection, in id order.
    #[must_use]
    pub fn documents(&self, thread_id: &ThreadId, collection: &str) -> Vec<Value> {
        self.state
            .lock()
            .dbs
            .get(thread_id)
            .and_then(|db| db.collections.get(collection))
            .map(|c| c.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Writes a document directly, bypassing transactions. Used to
    /// simulate edits made by other peers.
    pub fn put_document(
        &self,
        thread_id: &ThreadId,
        collection: &str,
        doc: Value,
    ) -> ProtocolResult<()> {
        let id = doc_id(&doc)?;
        let mut state = self.state.lock();
        let target = collection_mut(&mut state, thread_id, collection)?;
        target.docs.insert(id, doc);
        Ok(())
    }

    /// Removes a document directly.
    pub fn remove_document(
        &self,
        thread_id: &ThreadId,
        collection: &str,
        id: &str,
    ) -> ProtocolResult<bool> {
        let mut state = self.state.lock();
        let target = collection_mut(&mut state, thread_id, collection)?;
        Ok(target.docs.remove(id).is_some())
    }
}

/// Connects [`MemoryClient`]s to a shared [`MemoryThreadStore`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: Arc<MemoryThreadStore>,
}

impl MemoryConnector {
    /// Creates a connector over `store`.
    #[must_use]
    pub fn new(store: Arc<MemoryThreadStore>) -> Self {
        Self { store }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<MemoryThreadStore> {
        &self.store
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &Endpoint) -> ProtocolResult<Arc<dyn ThreadClient>> {
        if endpoint.host.is_empty() {
            return Err(ProtocolError::Transport {
                message: "no host".into(),
                retryable: false,
            });
        }
        tracing::trace!(host = %endpoint.host, transport = %endpoint.transport, "memory connect");
        Ok(Arc::new(MemoryClient {
            store: Arc::clone(&self.store),
            endpoint: endpoint.clone(),
        }))
    }
}

/// A client of a [`MemoryThreadStore`].
#[derive(Debug, Clone)]
pub struct MemoryClient {
    store: Arc<MemoryThreadStore>,
    endpoint: Endpoint,
}

impl MemoryClient {
    fn authorize(&self) -> ProtocolResult<()> {
        if !self.store.require_auth {
            return Ok(());
        }
        let token = self
            .endpoint
            .bearer_token()
            .ok_or_else(|| ProtocolError::Unauthorized("missing bearer token".into()))?;
        if self.store.state.lock().tokens.contains(token) {
            Ok(())
        } else {
            Err(ProtocolError::Unauthorized("unknown token".into()))
        }
    }
}

#[async_trait]
impl ThreadClient for MemoryClient {
    async fn token_challenge(&self, public_key: &str) -> ProtocolResult<Vec<u8>> {
        let mut challenge = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut challenge);
        self.store
            .state
            .lock()
            .challenges
            .insert(public_key.to_string(), challenge.clone());
        Ok(challenge)
    }

    async fn token(&self, public_key: &str, signature: &[u8]) -> ProtocolResult<String> {
        let mut state = self.store.state.lock();
        let challenge = state
            .challenges
            .remove(public_key)
            .ok_or_else(|| ProtocolError::Unauthorized("no outstanding challenge".into()))?;
        let secret = state
            .identities
            .get(public_key)
            .ok_or_else(|| ProtocolError::Unauthorized(format!("unknown identity {public_key}")))?;
        if !verify_hmac(secret, &challenge, signature) {
            return Err(ProtocolError::Unauthorized("bad signature".into()));
        }
        let token = uuid::Uuid::new_v4().simple().to_string();
        state.tokens.insert(token.clone());
        Ok(token)
    }

    async fn new_db(
        &self,
        name: &str,
        thread_id: &ThreadId,
        collections: Vec<CollectionInfo>,
    ) -> ProtocolResult<()> {
        self.authorize()?;
        let mut state = self.store.state.lock();
        if state.dbs.contains_key(thread_id) {
            return Err(ProtocolError::AlreadyExists(thread_id.to_string()));
        }
        let collections = collections
            .into_iter()
            .map(|info| {
                (
                    info.name.clone(),
                    RemoteCollection {
                        info,
                        docs: BTreeMap::new(),
                    },
                )
            })
            .collect();
        state.dbs.insert(
            thread_id.clone(),
            RemoteDb {
                name: name.to_string(),
                collections,
            },
        );
        Ok(())
    }

    async fn get_db_info(&self, thread_id: &ThreadId) -> ProtocolResult<DbInfo> {
        self.authorize()?;
        let state = self.store.state.lock();
        let db = state
            .dbs
            .get(thread_id)
            .ok_or_else(|| ProtocolError::NotFound(format!("thread {thread_id}")))?;
        Ok(DbInfo {
            name: db.name.clone(),
            thread_id: thread_id.clone(),
            collections: db.collections.keys().cloned().collect(),
        })
    }

    async fn get_collection_info(
        &self,
        thread_id: &ThreadId,
        name: &str,
    ) -> ProtocolResult<CollectionInfo> {
        self.authorize()?;
        let mut state = self.store.state.lock();
        Ok(collection_mut(&mut state, thread_id, name)?.info.clone())
    }

    async fn new_collection(
        &self,
        thread_id: &ThreadId,
        info: CollectionInfo,
    ) -> ProtocolResult<()> {
        self.authorize()?;
        let mut state = self.store.state.lock();
        let db = state
            .dbs
            .get_mut(thread_id)
            .ok_or_else(|| ProtocolError::NotFound(format!("thread {thread_id}")))?;
        if db.collections.contains_key(&info.name) {
            return Err(ProtocolError::CollectionAlreadyRegistered(info.name));
        }
        db.collections.insert(
            info.name.clone(),
            RemoteCollection {
                info,
                docs: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn find(
        &self,
        thread_id: &ThreadId,
        collection: &str,
        query: &Value,
    ) -> ProtocolResult<Vec<Value>> {
        self.authorize()?;
        let mut state = self.store.state.lock();
        let target = collection_mut(&mut state, thread_id, collection)?;
        Ok(target
            .docs
            .values()
            .filter(|doc| matches(doc, query))
            .cloned()
            .collect())
    }

    async fn write_transaction(
        &self,
        thread_id: &ThreadId,
        collection: &str,
    ) -> ProtocolResult<Box<dyn RemoteTransaction>> {
        self.authorize()?;
        {
            let mut state = self.store.state.lock();
            collection_mut(&mut state, thread_id, collection)?;
        }
        Ok(Box::new(MemoryTransaction {
            store: Arc::clone(&self.store),
            thread_id: thread_id.clone(),
            collection: collection.to_string(),
            started: false,
            finished: false,
            ops: Vec::new(),
        }))
    }
}

#[derive(Debug, Clone)]
enum PendingOp {
    Create(Vec<Value>),
    Save(Vec<Value>),
    Delete(Vec<String>),
}

/// A buffered write transaction on a [`MemoryThreadStore`] collection.
#[derive(Debug)]
pub struct MemoryTransaction {
    store: Arc<MemoryThreadStore>,
    thread_id: ThreadId,
    collection: String,
    started: bool,
    finished: bool,
    ops: Vec<PendingOp>,
}

impl MemoryTransaction {
    fn ensure_active(&self) -> ProtocolResult<()> {
        if self.finished {
            return Err(ProtocolError::TransactionFinished);
        }
        if !self.started {
            return Err(ProtocolError::server("transaction not started"));
        }
        Ok(())
    }

    /// The committed documents with this transaction's writes applied.
    fn view(&self) -> ProtocolResult<BTreeMap<String, Value>> {
        let mut state = self.store.state.lock();
        let mut docs = collection_mut(&mut state, &self.thread_id, &self.collection)?
            .docs
            .clone();
        drop(state);
        apply_ops(&mut docs, &self.collection, &self.ops)?;
        Ok(docs)
    }

    fn stage(&mut self, op: PendingOp) -> ProtocolResult<()> {
        self.ensure_active()?;
        let mut docs = self.view()?;
        apply_ops(&mut docs, &self.collection, std::slice::from_ref(&op))?;
        self.ops.push(op);
        Ok(())
    }
}

#[async_trait]
impl RemoteTransaction for MemoryTransaction {
    async fn start(&mut self) -> ProtocolResult<()> {
        if self.finished {
            return Err(ProtocolError::TransactionFinished);
        }
        self.started = true;
        Ok(())
    }

    async fn create(&mut self, docs: Vec<Value>) -> ProtocolResult<Vec<String>> {
        let docs: Vec<Value> = docs.into_iter().map(with_id).collect();
        let ids = docs.iter().map(doc_id).collect::<ProtocolResult<Vec<_>>>()?;
        self.stage(PendingOp::Create(docs))?;
        Ok(ids)
    }

    async fn save(&mut self, docs: Vec<Value>) -> ProtocolResult<()> {
        self.stage(PendingOp::Save(docs))
    }

    async fn delete(&mut self, ids: Vec<String>) -> ProtocolResult<()> {
        self.stage(PendingOp::Delete(ids))
    }

    async fn has(&mut self, ids: Vec<String>) -> ProtocolResult<bool> {
        self.ensure_active()?;
        let docs = self.view()?;
        Ok(ids.iter().all(|id| docs.contains_key(id)))
    }

    async fn find(&mut self, query: &Value) -> ProtocolResult<Vec<Value>> {
        self.ensure_active()?;
        Ok(self
            .view()?
            .into_values()
            .filter(|doc| matches(doc, query))
            .collect())
    }

    async fn end(&mut self) -> ProtocolResult<()> {
        self.ensure_active()?;
        let mut state = self.store.state.lock();
        let pending_failure = state.fail_commit_after;
        match pending_failure {
            Some(0) => {
                state.fail_commit_after = None;
                return Err(ProtocolError::transport("connection reset during commit"));
            }
            Some(n) => state.fail_commit_after = Some(n - 1),
            None => {}
        }
        let target = collection_mut(&mut state, &self.thread_id, &self.collection)?;
        let mut docs = target.docs.clone();
        apply_ops(&mut docs, &self.collection, &self.ops)?;
        target.docs = docs;
        state.commits += 1;
        self.finished = true;
        Ok(())
    }

    async fn discard(&mut self) -> ProtocolResult<()> {
        let mut state = self.store.state.lock();
        if state.fail_discard {
            return Err(ProtocolError::transport("discard failed"));
        }
        state.discards += 1;
        self.ops.clear();
        self.finished = true;
        Ok(())
    }
}

fn collection_mut<'a>(
    state: &'a mut State,
    thread_id: &ThreadId,
    collection: &str,
) -> ProtocolResult<&'a mut RemoteCollection> {
    state
        .dbs
        .get_mut(thread_id)
        .ok_or_else(|| ProtocolError::NotFound(format!("thread {thread_id}")))?
        .collections
        .get_mut(collection)
        .ok_or_else(|| ProtocolError::NotFound(format!("collection {collection}")))
}

fn apply_ops(
    docs: &mut BTreeMap<String, Value>,
    collection: &str,
    ops: &[PendingOp],
) -> ProtocolResult<()> {
    for op in ops {
        match op {
            PendingOp::Create(values) => {
                for value in values {
                    let id = doc_id(value)?;
                    if docs.contains_key(&id) {
                        return Err(ProtocolError::InstanceExists {
                            collection: collection.to_string(),
                            id,
                        });
                    }
                    docs.insert(id, value.clone());
                }
            }
            PendingOp::Save(values) => {
                for value in values {
                    let id = doc_id(value)?;
                    if !docs.contains_key(&id) {
                        return Err(ProtocolError::NotFound(format!("instance {id}")));
                    }
                    docs.insert(id, value.clone());
                }
            }
            PendingOp::Delete(ids) => {
                for id in ids {
                    if docs.remove(id).is_none() {
                        return Err(ProtocolError::NotFound(format!("instance {id}")));
                    }
                }
            }
        }
    }
    Ok(())
}

fn with_id(mut doc: Value) -> Value {
    if let Value::Object(map) = &mut doc {
        if !matches!(map.get("_id"), Some(Value::String(s)) if !s.is_empty()) {
            map.insert(
                "_id".into(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }
    }
    doc
}

fn doc_id(doc: &Value) -> ProtocolResult<String> {
    match doc.get("_id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        _ => Err(ProtocolError::server("document is missing _id")),
    }
}

/// Equality match on top-level and dotted fields. An empty or non-object
/// query matches everything.
fn matches(doc: &Value, query: &Value) -> bool {
    let Some(fields) = query.as_object() else {
        return true;
    };
    fields.iter().all(|(path, expected)| {
        path.split('.')
            .try_fold(doc, |current, part| current.get(part))
            .is_some_and(|actual| actual == expected)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{HmacIdentity, Identity};
    use crate::messages::{Transport, AUTHORIZATION};
    use serde_json::json;

    async fn client(store: &Arc<MemoryThreadStore>) -> Arc<dyn ThreadClient> {
        MemoryConnector::new(Arc::clone(store))
            .connect(&Endpoint::new("memory://test", Transport::Grpc))
            .await
            .unwrap()
    }

    async fn seeded() -> (Arc<MemoryThreadStore>, Arc<dyn ThreadClient>, ThreadId) {
        let store = Arc::new(MemoryThreadStore::new());
        let client = client(&store).await;
        let thread = ThreadId::random();
        client
            .new_db("test", &thread, vec![CollectionInfo::new("people", json!({}))])
            .await
            .unwrap();
        (store, client, thread)
    }

    #[tokio::test]
    async fn new_db_twice_reports_existing_thread() {
        let (_store, client, thread) = seeded().await;
        let err = client.new_db("test", &thread, vec![]).await.unwrap_err();
        assert_eq!(err, ProtocolError::AlreadyExists(thread.to_string()));

        let err = client
            .new_collection(&thread, CollectionInfo::new("people", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::CollectionAlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn writes_apply_on_end_only() {
        let (store, client, thread) = seeded().await;
        let mut txn = client.write_transaction(&thread, "people").await.unwrap();
        txn.start().await.unwrap();
        txn.create(vec![json!({"_id": "a", "age": 3})]).await.unwrap();
        assert!(txn.has(vec!["a".into()]).await.unwrap());
        assert!(store.documents(&thread, "people").is_empty());
        txn.end().await.unwrap();
        assert_eq!(store.documents(&thread, "people").len(), 1);
        assert!(matches!(
            txn.save(vec![json!({"_id": "a"})]).await,
            Err(ProtocolError::TransactionFinished)
        ));
    }

    #[tokio::test]
    async fn create_rejects_existing_and_save_requires_existing() {
        let (_store, client, thread) = seeded().await;
        let mut txn = client.write_transaction(&thread, "people").await.unwrap();
        txn.start().await.unwrap();
        txn.create(vec![json!({"_id": "a"})]).await.unwrap();
        assert!(matches!(
            txn.create(vec![json!({"_id": "a"})]).await,
            Err(ProtocolError::InstanceExists { .. })
        ));
        assert!(matches!(
            txn.save(vec![json!({"_id": "b"})]).await,
            Err(ProtocolError::NotFound(_))
        ));
        txn.discard().await.unwrap();
    }

    #[tokio::test]
    async fn injected_commit_failure_fires_once() {
        let (store, client, thread) = seeded().await;
        store.fail_commit_after(0);
        let mut txn = client.write_transaction(&thread, "people").await.unwrap();
        txn.start().await.unwrap();
        txn.create(vec![json!({"_id": "a"})]).await.unwrap();
        assert!(txn.end().await.unwrap_err().is_retryable());
        txn.end().await.unwrap();
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn find_filters_by_equality() {
        let (store, client, thread) = seeded().await;
        store
            .put_document(&thread, "people", json!({"_id": "a", "pet": {"kind": "cat"}}))
            .unwrap();
        store
            .put_document(&thread, "people", json!({"_id": "b", "pet": {"kind": "dog"}}))
            .unwrap();
        let cats = client
            .find(&thread, "people", &json!({"pet.kind": "cat"}))
            .await
            .unwrap();
        assert_eq!(cats, vec![json!({"_id": "a", "pet": {"kind": "cat"}})]);
        assert_eq!(
            client.find(&thread, "people", &json!({})).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn token_handshake_gates_calls() {
        let store = Arc::new(MemoryThreadStore::with_auth());
        let identity = HmacIdentity::random();
        store.register_identity(identity.public_key(), identity.secret().to_vec());
        let connector = MemoryConnector::new(Arc::clone(&store));

        let mut endpoint = Endpoint::new("memory://auth", Transport::Grpc);
        let anonymous = connector.connect(&endpoint).await.unwrap();
        assert!(matches!(
            anonymous.get_db_info(&ThreadId::random()).await,
            Err(ProtocolError::Unauthorized(_))
        ));

        let challenge = anonymous
            .token_challenge(&identity.public_key())
            .await
            .unwrap();
        let token = anonymous
            .token(&identity.public_key(), &identity.sign(&challenge))
            .await
            .unwrap();

        endpoint
            .metadata
            .insert(AUTHORIZATION.into(), format!("bearer {token}"));
        let authed = connector.connect(&endpoint).await.unwrap();
        assert!(matches!(
            authed.get_db_info(&ThreadId::random()).await,
            Err(ProtocolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let store = Arc::new(MemoryThreadStore::with_auth());
        let identity = HmacIdentity::random();
        store.register_identity(identity.public_key(), identity.secret().to_vec());
        let client = client(&store).await;
        client.token_challenge(&identity.public_key()).await.unwrap();
        let forged = HmacIdentity::random().sign(b"whatever");
        assert!(matches!(
            client.token(&identity.public_key(), &forged).await,
            Err(ProtocolError::Unauthorized(_))
        ));
    }
}

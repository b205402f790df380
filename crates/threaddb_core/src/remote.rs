//! Synchronization with a remote thread store.
//!
//! The remote mirrors a database on a thread. Local mutations queue up in
//! the change log; [`Remote::push`] sends them one remote transaction per
//! change, and [`Remote::pull`] replaces local documents with the remote
//! ones. The stash lets unpushed changes be set aside across a pull and
//! replayed afterwards.
//!
//! Nothing here retries. Transport failures surface as
//! [`CoreError::Remote`] and [`CoreError::is_retryable`] tells them apart.

use crate::config::RemoteConfig;
use crate::database::{DatabaseInner, META_REMOTE_CONFIG, META_THREAD_ID};
use crate::error::{CoreError, CoreResult};
use crate::middleware::{Change, ChangeType, MutationRequest, MutationResponse, CHANGES_TABLE};
use crate::patch;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use threaddb_storage::{Transaction, TxMode};
use threaddb_sync_protocol::{
    CollectionInfo, Identity, IndexInfo, ProtocolError, ProtocolResult, RemoteTransaction,
    ThreadClient, ThreadId,
};
use tracing::instrument;

/// Name of the stash table.
pub const STASH_TABLE: &str = "_stash";

/// Signs a token challenge on behalf of a bare public key.
pub type SignCallback =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ProtocolResult<Vec<u8>>> + Send + Sync>;

/// What [`Remote::authorize`] proves ownership of.
#[derive(Clone)]
pub enum Credentials {
    /// An identity that signs for itself.
    Identity(Arc<dyn Identity>),
    /// A public key whose challenge is signed elsewhere.
    PublicKey {
        /// The public key.
        key: String,
        /// Signer for the challenge. Required.
        sign: Option<SignCallback>,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Identity(identity) => f
                .debug_tuple("Identity")
                .field(&identity.public_key())
                .finish(),
            Credentials::PublicKey { key, sign } => f
                .debug_struct("PublicKey")
                .field("key", key)
                .field("sign", &sign.is_some())
                .finish(),
        }
    }
}

impl Credentials {
    /// Wraps an identity.
    pub fn identity(identity: impl Identity + 'static) -> Self {
        Self::Identity(Arc::new(identity))
    }

    fn public_key(&self) -> String {
        match self {
            Credentials::Identity(identity) => identity.public_key(),
            Credentials::PublicKey { key, .. } => key.clone(),
        }
    }
}

/// A document touched by a pull.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeKey {
    /// Collection name.
    pub collection: String,
    /// Document id.
    pub id: String,
}

/// The sync handle of a database. Cheap to clone.
#[derive(Clone)]
pub struct Remote {
    db: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("id", &self.id())
            .field("host", &self.config().service_host)
            .finish()
    }
}

impl Remote {
    pub(crate) fn new(db: Arc<DatabaseInner>) -> Self {
        Self { db }
    }

    /// The current configuration.
    #[must_use]
    pub fn config(&self) -> RemoteConfig {
        self.db.remote.read().clone()
    }

    /// The thread id, once initialized.
    #[must_use]
    pub fn id(&self) -> Option<ThreadId> {
        self.db.remote.read().id.clone()
    }

    /// Merges `update` into the configuration and persists it when the
    /// database is open. Returns the merged configuration.
    pub fn set(&self, update: RemoteConfig) -> CoreResult<RemoteConfig> {
        self.db.remote.write().merge(update);
        self.persist()?;
        Ok(self.config())
    }

    /// Obtains a bearer token through the challenge handshake and stores
    /// it in the configuration.
    ///
    /// # Errors
    ///
    /// [`CoreError::NoRemote`] without a service host,
    /// [`CoreError::NoCallback`] for a public key without a signer.
    #[instrument(skip_all, fields(db = %self.db.config.name))]
    pub async fn authorize(&self, credentials: Credentials) -> CoreResult<String> {
        if self.db.remote.read().endpoint().is_none() {
            return Err(CoreError::NoRemote);
        }
        if matches!(credentials, Credentials::PublicKey { sign: None, .. }) {
            return Err(CoreError::NoCallback);
        }
        let client = self.client().await?;
        let public_key = credentials.public_key();
        let challenge = client.token_challenge(&public_key).await?;
        let signature = match &credentials {
            Credentials::Identity(identity) => identity.sign(&challenge),
            Credentials::PublicKey { sign: Some(sign), .. } => sign(challenge).await?,
            Credentials::PublicKey { sign: None, .. } => return Err(CoreError::NoCallback),
        };
        let token = client.token(&public_key, &signature).await?;
        self.db.remote.write().set_token(token.clone());
        self.persist()?;
        tracing::info!("authorized with remote");
        Ok(token)
    }

    /// Creates the remote database, or registers the local collections on
    /// an existing one, and records the thread id.
    ///
    /// The id is `id` if given, else the stored one, else a new random id.
    #[instrument(skip(self), fields(db = %self.db.config.name))]
    pub async fn initialize(&self, id: Option<ThreadId>) -> CoreResult<ThreadId> {
        let client = self.client().await?;
        let id = match id {
            Some(id) => id,
            None => match self.stored_id()? {
                Some(id) => id,
                None => ThreadId::random(),
            },
        };
        let infos = self.collection_infos()?;
        match client.new_db(&self.db.config.name, &id, infos.clone()).await {
            Ok(()) => tracing::info!(thread = %id, "created remote database"),
            Err(ProtocolError::AlreadyExists(_)) => {
                tracing::debug!(thread = %id, "remote database exists, registering collections");
                for info in infos {
                    let name = info.name.clone();
                    match client.new_collection(&id, info).await {
                        Ok(()) | Err(ProtocolError::CollectionAlreadyRegistered(_)) => {}
                        Err(err) => {
                            tracing::warn!(collection = %name, error = %err, "collection registration failed");
                            return Err(err.into());
                        }
                    }
                }
            }
            Err(err) => return Err(err.into()),
        }
        self.db.remote.write().id = Some(id.clone());
        self.persist()?;
        Ok(id)
    }

    /// Sends queued changes of `collections` (all when empty) to the
    /// remote, oldest first, and removes each from the change log once the
    /// remote commits it. Returns the number of changes pushed.
    ///
    /// Every change is its own remote transaction; a failure leaves the
    /// earlier changes pushed and the rest queued.
    ///
    /// # Errors
    ///
    /// The remote error that stopped the push, after the failed transaction
    /// was discarded, or [`CoreError::Change`] if pushed and removed counts
    /// disagree.
    #[instrument(skip(self), fields(db = %self.db.config.name))]
    pub async fn push(&self, collections: &[&str]) -> CoreResult<usize> {
        let names = self.resolve(collections)?;
        let thread = self.thread()?;
        let client = self.client().await?;
        let mut total = 0;
        for name in names {
            let queued = self.queued(&name)?;
            if queued.is_empty() {
                continue;
            }
            let mut processed = 0usize;
            let mut removed = 0usize;
            for (seq, change) in queued {
                let mut txn = client.write_transaction(&thread, &name).await?;
                if let Err(err) = send(&mut *txn, &change).await {
                    if let Err(discard) = txn.discard().await {
                        tracing::warn!(collection = %name, error = %discard, "discard failed");
                    }
                    return Err(err);
                }
                processed += 1;
                if self.remove_change(&seq)? {
                    removed += 1;
                }
            }
            if processed != removed {
                return Err(CoreError::change(format!(
                    "pushed {processed} changes of {name} but removed {removed}"
                )));
            }
            tracing::debug!(collection = %name, changes = processed, "pushed changes");
            total += processed;
        }
        Ok(total)
    }

    /// Replaces the local documents of `collections` (all when empty) with
    /// the remote ones and deletes local documents the remote lacks.
    /// Returns the documents that actually changed.
    ///
    /// # Errors
    ///
    /// [`CoreError::LocalChanges`] if any change is still queued.
    #[instrument(skip(self), fields(db = %self.db.config.name))]
    pub async fn pull(&self, collections: &[&str]) -> CoreResult<BTreeSet<ChangeKey>> {
        let pending = self.pending_changes(None)?.len();
        if pending > 0 {
            return Err(CoreError::LocalChanges { pending });
        }
        let names = self.resolve(collections)?;
        let thread = self.thread()?;
        let client = self.client().await?;
        let engine = self.db.engine()?;
        let pipeline = &self.db.pipeline;
        let mut touched = BTreeSet::new();
        for name in names {
            let remote_docs = client.find(&thread, &name, &json!({})).await?;
            let scope = pipeline.scope(&name);
            engine.transaction(TxMode::ReadWrite, &scope, |txn| {
                let remote_ids: BTreeSet<&str> = remote_docs
                    .iter()
                    .filter_map(|doc| doc.get("_id").and_then(Value::as_str))
                    .collect();
                let stale: Vec<String> = txn
                    .keys(&name)?
                    .into_iter()
                    .filter(|key| !remote_ids.contains(key.as_str()))
                    .collect();
                if !remote_docs.is_empty() {
                    let request = MutationRequest::put(name.as_str(), remote_docs.clone());
                    check(pipeline.mutate(txn, request)?)?;
                }
                if !stale.is_empty() {
                    check(pipeline.mutate(txn, MutationRequest::delete(name.as_str(), stale))?)?;
                }
                // Drain the records this reconciliation produced.
                for (seq, change) in changes_in(txn, CHANGES_TABLE, Some(name.as_str()))? {
                    if !change.is_marker() {
                        touched.insert(ChangeKey {
                            collection: change.name,
                            id: change.key,
                        });
                    }
                    txn.delete(CHANGES_TABLE, &seq)?;
                }
                Ok::<_, CoreError>(())
            })?;
            tracing::debug!(collection = %name, documents = remote_docs.len(), "pulled collection");
        }
        Ok(touched)
    }

    /// Moves the change log into the stash. Returns the number of records
    /// moved; an empty change log is left alone.
    pub fn create_stash(&self) -> CoreResult<usize> {
        self.db
            .engine()?
            .transaction(TxMode::ReadWrite, &[CHANGES_TABLE, STASH_TABLE], |txn| {
                let rows = txn.all(CHANGES_TABLE)?;
                if rows.is_empty() {
                    return Ok(0);
                }
                for (_, row) in &rows {
                    txn.add(STASH_TABLE, row.clone())?;
                }
                txn.clear(CHANGES_TABLE)?;
                tracing::debug!(records = rows.len(), "stashed changes");
                Ok::<_, CoreError>(rows.len())
            })
    }

    /// Discards the stash.
    pub fn clear_stash(&self) -> CoreResult<()> {
        self.db
            .engine()?
            .transaction(TxMode::ReadWrite, &[STASH_TABLE], |txn| {
                txn.clear(STASH_TABLE)?;
                Ok::<_, CoreError>(())
            })
    }

    /// Replays stashed changes of `collections` (all when empty) onto the
    /// current documents and removes them from the stash. Returns the
    /// number of stash records applied.
    ///
    /// A document that still matches its last stashed state gets its
    /// records back in the change log unchanged, in their stashed order.
    /// Otherwise the stashed operations are applied leniently to the current document and the
    /// result is saved as a new change.
    pub fn apply_stash(&self, collections: &[&str]) -> CoreResult<usize> {
        let names = self.resolve(collections)?;
        let engine = self.db.engine()?;
        let pipeline = &self.db.pipeline;
        let mut applied = 0;
        for name in names {
            let mut scope = pipeline.scope(&name);
            scope.push(STASH_TABLE);
            applied += engine.transaction(TxMode::ReadWrite, &scope, |txn| {
                let stashed = changes_in(txn, STASH_TABLE, Some(name.as_str()))?;
                let mut groups: BTreeMap<&str, Vec<(String, Change)>> = BTreeMap::new();
                for (seq, change) in &stashed {
                    groups
                        .entry(change.key.as_str())
                        .or_default()
                        .push((seq.clone(), change.clone()));
                }
                // Keys whose current document still matches the last stashed state.
                let mut verbatim = BTreeSet::new();
                for (key, group) in &groups {
                    let last = group.last().and_then(|(_, c)| c.after.clone());
                    if txn.get(&name, key)? == last {
                        verbatim.insert(*key);
                    }
                }

                let mut replayed = BTreeSet::new();
                for (seq, change) in &stashed {
                    let key = change.key.as_str();
                    if verbatim.contains(key) {
                        txn.add(CHANGES_TABLE, serde_json::to_value(change)?)?;
                    } else if replayed.insert(key) {
                        let current = txn.get(&name, key)?;
                        let group = groups.get(key).map(Vec::as_slice).unwrap_or_default();
                        match replay(current.clone(), group)? {
                            Some(doc) => {
                                check(pipeline.mutate(txn, MutationRequest::put(name.as_str(), vec![doc]))?)?;
                            }
                            None if current.is_some() => {
                                let request = MutationRequest::delete(name.as_str(), vec![key.to_string()]);
                                check(pipeline.mutate(txn, request)?)?;
                            }
                            None => {}
                        }
                    }
                    txn.delete(STASH_TABLE, seq)?;
                }
                let count = stashed.len();
                Ok::<_, CoreError>(count)
            })?;
        }
        tracing::debug!(records = applied, "applied stash");
        Ok(applied)
    }

    /// Queued changes, oldest first, optionally for one collection.
    pub fn pending_changes(&self, collection: Option<&str>) -> CoreResult<Vec<Change>> {
        let engine = self.db.engine()?;
        let rows = engine.transaction(TxMode::ReadOnly, &[CHANGES_TABLE], |txn| {
            changes_in(txn, CHANGES_TABLE, collection)
        })?;
        Ok(rows.into_iter().map(|(_, change)| change).collect())
    }

    /// Number of stashed records.
    pub fn stash_len(&self) -> CoreResult<usize> {
        Ok(self
            .db
            .engine()?
            .transaction(TxMode::ReadOnly, &[STASH_TABLE], |txn| txn.count(STASH_TABLE))?)
    }

    async fn client(&self) -> CoreResult<Arc<dyn ThreadClient>> {
        let endpoint = self.db.remote.read().endpoint().ok_or(CoreError::NoRemote)?;
        let connector = self.db.connector.as_ref().ok_or(CoreError::NoRemote)?;
        Ok(connector.connect(&endpoint).await?)
    }

    fn thread(&self) -> CoreResult<ThreadId> {
        self.id()
            .ok_or_else(|| CoreError::thread_id("remote is not initialized"))
    }

    fn stored_id(&self) -> CoreResult<Option<ThreadId>> {
        if let Some(id) = self.id() {
            return Ok(Some(id));
        }
        match self.db.meta_get(META_THREAD_ID)? {
            Some(Value::String(text)) => text
                .parse()
                .map(Some)
                .map_err(|e: ProtocolError| CoreError::thread_id(e.to_string())),
            Some(other) => Err(CoreError::thread_id(format!("stored thread id {other} is not a string"))),
            None => Ok(None),
        }
    }

    fn persist(&self) -> CoreResult<()> {
        let config = self.config();
        let mut entries = vec![(META_REMOTE_CONFIG, serde_json::to_value(&config)?)];
        if let Some(id) = &config.id {
            entries.push((META_THREAD_ID, Value::String(id.to_string())));
        }
        match self.db.meta_put(&entries) {
            // Picked up from memory when the database opens.
            Err(CoreError::DatabaseNotOpen) => Ok(()),
            other => other,
        }
    }

    fn resolve(&self, collections: &[&str]) -> CoreResult<Vec<String>> {
        let existing = self.db.user_tables()?;
        if collections.is_empty() {
            return Ok(existing);
        }
        collections
            .iter()
            .map(|name| {
                if existing.iter().any(|e| e == name) {
                    Ok((*name).to_string())
                } else {
                    Err(CoreError::CollectionNotFound {
                        name: (*name).to_string(),
                    })
                }
            })
            .collect()
    }

    fn collection_infos(&self) -> CoreResult<Vec<CollectionInfo>> {
        let configs = self.db.stored_configs()?;
        Ok(self
            .db
            .user_tables()?
            .into_iter()
            .map(|name| {
                let config = configs.get(&name);
                let mut info = CollectionInfo::new(
                    name.clone(),
                    config.and_then(|c| c.schema.clone()).unwrap_or_else(|| json!({})),
                );
                info.indexes = config
                    .map(|c| {
                        c.indexes
                            .iter()
                            .map(|i| IndexInfo {
                                path: i.path.clone(),
                                unique: i.unique,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                info
            })
            .collect())
    }

    fn queued(&self, collection: &str) -> CoreResult<Vec<(String, Change)>> {
        self.db
            .engine()?
            .transaction(TxMode::ReadOnly, &[CHANGES_TABLE], |txn| {
                changes_in(txn, CHANGES_TABLE, Some(collection))
            })
    }

    fn remove_change(&self, seq: &str) -> CoreResult<bool> {
        Ok(self
            .db
            .engine()?
            .transaction(TxMode::ReadWrite, &[CHANGES_TABLE], |txn| {
                txn.delete(CHANGES_TABLE, seq)
            })?)
    }
}

async fn send(txn: &mut dyn RemoteTransaction, change: &Change) -> CoreResult<()> {
    txn.start().await?;
    match change.kind {
        ChangeType::Add => {
            txn.create(vec![document(change)?]).await?;
        }
        ChangeType::Put => txn.save(vec![document(change)?]).await?,
        ChangeType::Delete => txn.delete(vec![change.key.clone()]).await?,
    }
    txn.end().await?;
    Ok(())
}

fn document(change: &Change) -> CoreResult<Value> {
    change.after.clone().ok_or_else(|| {
        CoreError::change(format!("change to {}/{} has no document", change.name, change.key))
    })
}

/// Change records in `table`, oldest first, optionally for one collection.
fn changes_in(
    txn: &Transaction,
    table: &str,
    collection: Option<&str>,
) -> CoreResult<Vec<(String, Change)>> {
    let mut out = Vec::new();
    for (seq, row) in txn.all(table)? {
        let change: Change = serde_json::from_value(row)?;
        if collection.map_or(true, |name| change.name == name) {
            out.push((seq, change));
        }
    }
    Ok(out)
}

/// Folds stashed changes of one document onto its current state.
fn replay(mut doc: Option<Value>, group: &[(String, Change)]) -> CoreResult<Option<Value>> {
    for (_, change) in group {
        match change.kind {
            ChangeType::Delete => doc = None,
            ChangeType::Add | ChangeType::Put => match (&mut doc, &change.ops) {
                (Some(current), Some(ops)) => patch::apply_lenient(current, ops)?,
                _ => doc = change.after.clone(),
            },
        }
    }
    Ok(doc)
}

fn check(response: MutationResponse) -> CoreResult<()> {
    match response.results.into_iter().find_map(Result::err) {
        Some(err) => Err(CoreError::Storage(err)),
        None => Ok(()),
    }
}

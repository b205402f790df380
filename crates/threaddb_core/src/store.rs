//! Codec-backed key-value stores driven by a [`Dispatcher`].

use crate::codec::{Codec, Event, KeyValueTable, TableWrite};
use crate::dispatcher::{Dispatcher, Reducer};
use crate::error::CoreResult;
use crate::lockable::{Lockable, Semaphore};
use crate::query::Query;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// A notification from a [`Store`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Events produced by a commit, sent right after they were dispatched.
    Events(Vec<Event>),
    /// One event of this store, sent once it has been reduced.
    Update(Event),
}

struct StoreCore {
    prefix: String,
    table: Arc<dyn KeyValueTable>,
    codec: Arc<dyn Codec>,
    notify: broadcast::Sender<StoreEvent>,
}

#[async_trait]
impl Reducer for StoreCore {
    async fn reduce(&self, events: &[Event]) -> CoreResult<()> {
        let mine: Vec<Event> = events
            .iter()
            .filter(|e| e.collection == self.prefix)
            .cloned()
            .collect();
        if mine.is_empty() {
            return Ok(());
        }
        self.codec.on_reduce(self.table.as_ref(), &mine)?;
        for event in mine {
            // No subscribers is fine.
            let _ = self.notify.send(StoreEvent::Update(event));
        }
        Ok(())
    }
}

/// A namespaced key-value view over a table.
///
/// Writes are encoded by the store's [`Codec`] into events and applied by
/// dispatching them; the store registers itself as a reducer and folds its
/// own events back into the table. Reads go straight to the table.
///
/// Dropping the store unregisters it from the dispatcher.
pub struct Store {
    core: Arc<StoreCore>,
    dispatcher: Dispatcher,
    semaphore: Semaphore,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("prefix", &self.core.prefix)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Creates a store under `prefix` and registers it with `dispatcher`.
    /// `lock_timeout` bounds how long a commit waits for its key locks.
    pub fn new(
        prefix: impl Into<String>,
        table: Arc<dyn KeyValueTable>,
        codec: Arc<dyn Codec>,
        dispatcher: Dispatcher,
        lock_timeout: Option<Duration>,
    ) -> Self {
        let prefix = prefix.into();
        let (notify, _) = broadcast::channel(CHANNEL_CAPACITY);
        let core = Arc::new(StoreCore {
            prefix: prefix.clone(),
            table,
            codec,
            notify,
        });
        dispatcher.register(core.clone());
        Self {
            core,
            dispatcher,
            semaphore: Semaphore::new(prefix, lock_timeout),
        }
    }

    /// The store's namespace.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.core.prefix
    }

    /// Reads a value.
    pub fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        self.core.table.get(key)
    }

    /// Returns true if `key` has a value.
    pub fn has(&self, key: &str) -> CoreResult<bool> {
        self.core.table.has(key)
    }

    /// Values matching `query`.
    pub fn query(&self, query: &Query) -> CoreResult<Vec<Value>> {
        let values = self.core.table.entries()?.into_iter().map(|(_, v)| v);
        Ok(query.run(values))
    }

    /// Receives notifications for this store.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.core.notify.subscribe()
    }

    /// Starts a batch of writes committed as one dispatch.
    #[must_use]
    pub fn batch(&self) -> ActionBatch<'_> {
        ActionBatch {
            store: self,
            actions: Vec::new(),
        }
    }

    /// Writes one value.
    pub async fn put(&self, key: &str, value: Value) -> CoreResult<()> {
        let mut batch = self.batch();
        batch.put(key, value);
        batch.commit().await.map(drop)
    }

    /// Deletes one key.
    pub async fn delete(&self, key: &str) -> CoreResult<()> {
        let mut batch = self.batch();
        batch.delete(key);
        batch.commit().await.map(drop)
    }
}

impl Lockable for Store {
    fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let reducer: Arc<dyn Reducer> = self.core.clone();
        self.dispatcher.unregister(&reducer);
    }
}

#[derive(Debug, Clone)]
enum Action {
    Put(String, Value),
    Delete(String),
}

impl Action {
    fn key(&self) -> &str {
        match self {
            Action::Put(key, _) | Action::Delete(key) => key,
        }
    }
}

/// Writes queued against a [`Store`].
#[derive(Debug)]
#[must_use = "a batch does nothing until committed"]
pub struct ActionBatch<'a> {
    store: &'a Store,
    actions: Vec<Action>,
}

impl ActionBatch<'_> {
    /// Queues a put.
    pub fn put(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.actions.push(Action::Put(key.into(), value));
        self
    }

    /// Queues a delete.
    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.actions.push(Action::Delete(key.into()));
        self
    }

    /// Number of queued writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Encodes and dispatches every queued write, holding a write lock on
    /// each touched key until the events are reduced. Returns the events.
    pub async fn commit(self) -> CoreResult<Vec<Event>> {
        if self.actions.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.store;
        let core = &store.core;

        let mut keys: Vec<&str> = self.actions.iter().map(Action::key).collect();
        keys.sort_unstable();
        keys.dedup();
        let mut held = Vec::with_capacity(keys.len());
        for key in keys {
            held.push(store.semaphore.write_lock(&store.lock_key(key), None).await?);
        }

        // Later writes in the batch are encoded against earlier ones.
        let view = Overlay {
            base: core.table.as_ref(),
            pending: parking_lot::Mutex::new(BTreeMap::new()),
        };
        let mut events = Vec::with_capacity(self.actions.len());
        for action in self.actions {
            let event = match action {
                Action::Put(key, value) => {
                    let patch = core.codec.on_put(&view, &key, value.clone())?;
                    view.pending.lock().insert(key.clone(), Some(value));
                    Event::new(&core.prefix, key, Some(patch))
                }
                Action::Delete(key) => {
                    let patch = core.codec.on_delete(&view, &key)?;
                    view.pending.lock().insert(key.clone(), None);
                    Event::new(&core.prefix, key, patch)
                }
            };
            events.push(event);
        }

        tracing::debug!(store = %core.prefix, events = events.len(), "committing batch");
        store.dispatcher.dispatch(events.clone()).await?;
        let _ = core.notify.send(StoreEvent::Events(events.clone()));
        drop(held);
        Ok(events)
    }
}

/// The table as it will look once earlier writes of a batch are applied.
struct Overlay<'a> {
    base: &'a dyn KeyValueTable,
    pending: parking_lot::Mutex<BTreeMap<String, Option<Value>>>,
}

impl KeyValueTable for Overlay<'_> {
    fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        match self.pending.lock().get(key) {
            Some(value) => Ok(value.clone()),
            None => self.base.get(key),
        }
    }

    fn entries(&self) -> CoreResult<Vec<(String, Value)>> {
        let mut entries: BTreeMap<String, Value> = self.base.entries()?.into_iter().collect();
        for (key, value) in self.pending.lock().iter() {
            match value {
                Some(value) => entries.insert(key.clone(), value.clone()),
                None => entries.remove(key),
            };
        }
        Ok(entries.into_iter().collect())
    }

    fn apply(&self, writes: Vec<TableWrite>) -> CoreResult<()> {
        let mut pending = self.pending.lock();
        for write in writes {
            match write {
                TableWrite::Put { key, value } => pending.insert(key, Some(value)),
                TableWrite::Delete { key } => pending.insert(key, None),
            };
        }
        Ok(())
    }
}

//! The event bus that serializes dispatches and fans them out to reducers.

use crate::codec::Event;
use crate::error::{CoreError, CoreResult};
use crate::id::new_id;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use threaddb_storage::{Engine, TxMode};

/// Name of the table dispatched events are persisted to.
pub const EVENTS_TABLE: &str = "_events";

/// Folds dispatched events into some state.
#[async_trait]
pub trait Reducer: Send + Sync {
    /// Applies a batch of events.
    async fn reduce(&self, events: &[Event]) -> CoreResult<()>;
}

struct Inner {
    lock: tokio::sync::Mutex<()>,
    reducers: RwLock<Vec<Arc<dyn Reducer>>>,
    log: Option<Arc<Engine>>,
}

/// Serializes event dispatch and fans events out to registered reducers.
///
/// At most one dispatch runs at a time per dispatcher. A dispatch first
/// persists its events to the event log (when one is configured), then
/// runs every reducer concurrently and waits for all of them. The first
/// reducer error is returned to the caller; dispatches queued behind a
/// failed one still run.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("reducers", &self.reducer_count())
            .field("event_log", &self.inner.log.is_some())
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Creates a dispatcher without an event log.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a dispatcher that persists events to [`EVENTS_TABLE`] in
    /// `engine`, creating the table if needed.
    pub fn with_log(engine: Arc<Engine>) -> CoreResult<Self> {
        engine.ensure_table(threaddb_storage::TableDef::keyed(EVENTS_TABLE, "key"))?;
        Ok(Self::build(Some(engine)))
    }

    fn build(log: Option<Arc<Engine>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                lock: tokio::sync::Mutex::new(()),
                reducers: RwLock::new(Vec::new()),
                log,
            }),
        }
    }

    /// Adds a reducer. Registering the same reducer twice has no effect.
    pub fn register(&self, reducer: Arc<dyn Reducer>) {
        let mut reducers = self.inner.reducers.write();
        if !reducers.iter().any(|r| same(r, &reducer)) {
            reducers.push(reducer);
        }
    }

    /// Removes a reducer.
    pub fn unregister(&self, reducer: &Arc<dyn Reducer>) {
        self.inner.reducers.write().retain(|r| !same(r, reducer));
    }

    /// Number of registered reducers.
    #[must_use]
    pub fn reducer_count(&self) -> usize {
        self.inner.reducers.read().len()
    }

    /// Persists and reduces a batch of events.
    ///
    /// # Errors
    ///
    /// Returns the event log write error, or the first reducer error.
    pub async fn dispatch(&self, events: Vec<Event>) -> CoreResult<()> {
        let _guard = self.inner.lock.lock().await;

        if let Some(engine) = &self.inner.log {
            persist(engine, &events)?;
        }

        let reducers: Vec<Arc<dyn Reducer>> = self.inner.reducers.read().clone();
        tracing::trace!(
            events = events.len(),
            reducers = reducers.len(),
            "dispatching events"
        );
        let results =
            futures::future::join_all(reducers.iter().map(|r| r.reduce(&events))).await;
        results.into_iter().collect::<CoreResult<Vec<()>>>()?;
        Ok(())
    }

    /// Every persisted event, oldest first.
    pub fn logged_events(&self) -> CoreResult<Vec<Event>> {
        let Some(engine) = &self.inner.log else {
            return Ok(Vec::new());
        };
        engine.transaction(TxMode::ReadOnly, &[EVENTS_TABLE], |txn| {
            txn.all(EVENTS_TABLE)?
                .into_iter()
                .map(|(_, row)| Ok(serde_json::from_value(row["event"].clone())?))
                .collect::<CoreResult<Vec<Event>>>()
        })
    }
}

fn persist(engine: &Engine, events: &[Event]) -> CoreResult<()> {
    engine.transaction(TxMode::ReadWrite, &[EVENTS_TABLE], |txn| {
        for event in events {
            let row = json!({ "key": new_id(), "event": serde_json::to_value(event)? });
            txn.add(EVENTS_TABLE, row)?;
        }
        Ok::<_, CoreError>(())
    })
}

fn same(a: &Arc<dyn Reducer>, b: &Arc<dyn Reducer>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

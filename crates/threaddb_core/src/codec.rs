//! Codecs turn store writes into events and fold events back into tables.

use crate::error::{CoreError, CoreResult};
use crate::patch::{self, Operation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// A change to one key, produced by a codec and consumed by reducers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Key that changed.
    pub id: String,
    /// Namespace (store prefix) the key belongs to.
    pub collection: String,
    /// Codec-specific payload. `None` means the key was deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Value>,
}

impl Event {
    /// Creates an event stamped with the current time.
    pub fn new(collection: impl Into<String>, id: impl Into<String>, patch: Option<Value>) -> Self {
        Self {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            id: id.into(),
            collection: collection.into(),
            patch,
        }
    }

    /// Returns true if the event deletes its key.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.patch.is_none()
    }
}

/// A write a codec asks the table to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum TableWrite {
    /// Store `value` under `key`.
    Put {
        /// Key.
        key: String,
        /// Value.
        value: Value,
    },
    /// Remove `key`.
    Delete {
        /// Key.
        key: String,
    },
}

/// The table capability codecs and stores need.
pub trait KeyValueTable: Send + Sync {
    /// Reads a value.
    fn get(&self, key: &str) -> CoreResult<Option<Value>>;

    /// Every entry, in key order.
    fn entries(&self) -> CoreResult<Vec<(String, Value)>>;

    /// Applies writes atomically.
    fn apply(&self, writes: Vec<TableWrite>) -> CoreResult<()>;

    /// Returns true if the key exists.
    fn has(&self, key: &str) -> CoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Strategy for encoding writes as events and reducing them back.
pub trait Codec: Send + Sync {
    /// Encodes a put of `value` under `key` as an event payload.
    fn on_put(&self, table: &dyn KeyValueTable, key: &str, value: Value) -> CoreResult<Value>;

    /// Encodes a delete. `None` deletes the key when reduced.
    fn on_delete(&self, _table: &dyn KeyValueTable, _key: &str) -> CoreResult<Option<Value>> {
        Ok(None)
    }

    /// Folds a batch of events into the table.
    fn on_reduce(&self, table: &dyn KeyValueTable, events: &[Event]) -> CoreResult<()>;
}

/// Full-overwrite codec: the payload is the new value.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicCodec;

impl Codec for BasicCodec {
    fn on_put(&self, _table: &dyn KeyValueTable, _key: &str, value: Value) -> CoreResult<Value> {
        Ok(value)
    }

    fn on_reduce(&self, table: &dyn KeyValueTable, events: &[Event]) -> CoreResult<()> {
        let writes = events
            .iter()
            .map(|event| match &event.patch {
                Some(value) => TableWrite::Put {
                    key: event.id.clone(),
                    value: value.clone(),
                },
                None => TableWrite::Delete {
                    key: event.id.clone(),
                },
            })
            .collect();
        table.apply(writes)
    }
}

/// Payload written by [`JsonPatchCodec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PatchPayload {
    /// The key did not exist; the full value is carried.
    Create {
        /// New value.
        value: Value,
    },
    /// The key existed; the operations turn the old value into the new one.
    Save {
        /// RFC 6902 operations.
        ops: Vec<Operation>,
    },
    /// The value did not change; the old value is carried as a marker.
    Unchanged {
        /// Stored value.
        value: Value,
    },
}

/// Diffing codec: updates are carried as RFC 6902 operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPatchCodec;

impl Codec for JsonPatchCodec {
    fn on_put(&self, table: &dyn KeyValueTable, key: &str, value: Value) -> CoreResult<Value> {
        let payload = match table.get(key)? {
            None => PatchPayload::Create { value },
            Some(old) => {
                let ops = patch::compare(&old, &value);
                if ops.is_empty() {
                    PatchPayload::Unchanged { value: old }
                } else {
                    PatchPayload::Save { ops }
                }
            }
        };
        Ok(serde_json::to_value(payload)?)
    }

    fn on_reduce(&self, table: &dyn KeyValueTable, events: &[Event]) -> CoreResult<()> {
        // Latest pre-image per key, including writes earlier in this batch.
        let mut images: BTreeMap<String, Option<Value>> = BTreeMap::new();
        for event in events {
            let next = match &event.patch {
                None => None,
                Some(raw) => match serde_json::from_value::<PatchPayload>(raw.clone())? {
                    PatchPayload::Create { value } => Some(value),
                    PatchPayload::Unchanged { value } => match images.get(&event.id) {
                        Some(current) => current.clone(),
                        None => table.get(&event.id)?.or(Some(value)),
                    },
                    PatchPayload::Save { ops } => {
                        let current = match images.get(&event.id) {
                            Some(current) => current.clone(),
                            None => table.get(&event.id)?,
                        };
                        let mut doc = current.ok_or_else(|| {
                            CoreError::patch(format!("no stored value to patch for {}", event.id))
                        })?;
                        patch::apply(&mut doc, &ops)?;
                        Some(doc)
                    }
                },
            };
            images.insert(event.id.clone(), next);
        }
        let writes = images
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => TableWrite::Put { key, value },
                None => TableWrite::Delete { key },
            })
            .collect();
        table.apply(writes)
    }
}

//! # ThreadDB Core
//!
//! A local-first document database that mirrors itself onto a remote
//! thread store.
//!
//! Documents are JSON objects keyed by `_id`, grouped into collections
//! that may carry a JSON Schema. Every local mutation is recorded in a
//! change log; a [`Remote`] pushes that log upstream and pulls remote
//! state back down.
//!
//! ## Layers
//!
//! - [`Database`] / [`Collection`] - schema-bound collections over the
//!   table engine from `threaddb_storage`
//! - [`middleware`] - interceptors around every write (schema checks,
//!   change tracking)
//! - [`Query`] / [`Cursor`] - MongoDB-style filters, sorting and paging
//! - [`Store`] / [`Dispatcher`] / [`Codec`] - an event-sourced key-value
//!   layer with change notifications
//! - [`Remote`] - authorization, push, pull and the stash
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//! use threaddb_core::{CollectionConfig, Database, DatabaseConfig, Query};
//!
//! let db = Database::new(DatabaseConfig::new("demo"));
//! db.open(1).unwrap();
//! let people = db.new_collection(CollectionConfig::new("people")).unwrap();
//! people
//!     .insert(vec![json!({"name": "ada", "age": 36}), json!({"name": "bob", "age": 19})])
//!     .unwrap();
//!
//! let adults = people
//!     .count(Query::parse(json!({"age": {"$gte": 21}})).unwrap())
//!     .unwrap();
//! assert_eq!(adults, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used))]

mod codec;
mod collection;
mod config;
mod database;
mod dispatcher;
mod error;
mod id;
mod lockable;
pub mod middleware;
pub mod patch;
mod query;
mod remote;
mod schema;
mod store;

pub use codec::{BasicCodec, Codec, Event, JsonPatchCodec, KeyValueTable, PatchPayload, TableWrite};
pub use collection::{Collection, CollectionConfig, CollectionTxn, ID_FIELD};
pub use config::{DatabaseConfig, RemoteConfig};
pub use database::{Database, META_TABLE, SCHEMAS_TABLE};
pub use dispatcher::{Dispatcher, Reducer, EVENTS_TABLE};
pub use error::{CoreError, CoreResult};
pub use id::{new_id, ParseUlidError, Ulid};
pub use lockable::{LockHandle, Lockable, Semaphore};
pub use middleware::{
    Change, ChangeTracker, ChangeType, Interceptor, MutationContext, MutationKind,
    MutationRequest, MutationResponse, Pipeline, CHANGES_TABLE,
};
pub use query::{Cursor, Query, SortOrder};
pub use remote::{ChangeKey, Credentials, Remote, SignCallback, STASH_TABLE};
pub use schema::{SchemaValidator, ValidationIssue};
pub use store::{ActionBatch, Store, StoreEvent};

pub use threaddb_sync_protocol::{Endpoint, HmacIdentity, Identity, ThreadId, Transport};

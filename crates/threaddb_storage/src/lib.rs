//! # ThreadDB Storage
//!
//! The embedded table store underneath ThreadDB.
//!
//! Tables hold JSON documents ordered by a string key. Keys are either
//! read from a document field or assigned from an auto-increment
//! sequence. Tables may carry secondary indexes, optionally unique.
//!
//! All changes go through closures run by [`Engine::transaction`]. A
//! closure that returns `Ok` commits every write as one frame in the
//! commit log; a closure that returns `Err` leaves no trace.
//!
//! ## Layers
//!
//! - [`StorageBackend`] - an opaque append-only byte log
//!   ([`InMemoryBackend`], [`FileBackend`])
//! - [`frame`] - the record format written into the log
//! - [`Engine`] - the table catalog, replay, compaction and transactions
//!
//! ## Example
//!
//! ```rust
//! use threaddb_storage::{Engine, KeyRange, StorageError, TableDef, TxMode};
//! use serde_json::json;
//!
//! let engine = Engine::in_memory().unwrap();
//! engine.create_table(TableDef::auto_increment("events")).unwrap();
//!
//! engine
//!     .transaction(TxMode::ReadWrite, &["events"], |txn| {
//!         txn.add("events", json!({"kind": "first"}))?;
//!         txn.add("events", json!({"kind": "second"}))?;
//!         Ok::<_, StorageError>(())
//!     })
//!     .unwrap();
//!
//! let newest = engine
//!     .transaction(TxMode::ReadOnly, &["events"], |txn| {
//!         txn.range("events", &KeyRange::all().reverse().limit(1))
//!     })
//!     .unwrap();
//! assert_eq!(newest[0].1["kind"], "second");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used))]

mod backend;
mod engine;
mod error;
mod file;
pub mod frame;
mod memory;
mod table;
mod transaction;

pub use backend::StorageBackend;
pub use engine::Engine;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use table::{field_at, sequence_key, IndexDef, KeyRange, KeyScheme, TableDef};
pub use transaction::{Transaction, TxMode};

//! # ThreadDB Testkit
//!
//! Test utilities for ThreadDB.
//!
//! This crate provides:
//! - Database fixtures over memory or a temporary directory
//! - An in-process remote thread store wired into a database
//! - Property-based document generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use threaddb_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn pushes() {
//!     let remote = TestRemote::new();
//!     let db = remote.database(DatabaseConfig::new("notes"));
//!     // ... open, write, push
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use threaddb_core::{CollectionConfig, Database, DatabaseConfig, Query, RemoteConfig};
}

pub use fixtures::*;
pub use generators::*;

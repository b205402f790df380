//! # ThreadDB Sync Protocol
//!
//! The interface between a local ThreadDB database and the remote thread
//! store it mirrors.
//!
//! This crate provides:
//! - [`ThreadClient`] and [`RemoteTransaction`], the async calls a thread
//!   store answers
//! - [`Connector`], which opens clients for an [`Endpoint`]
//! - Wire types ([`CollectionInfo`], [`DbInfo`], [`Transport`])
//! - [`ThreadId`] and the [`Identity`] signing capability used by the
//!   token handshake
//! - [`MemoryThreadStore`], an in-process store for tests
//!
//! No network transport lives here; production connectors implement
//! [`Connector`] on top of their RPC stack.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used))]

mod client;
mod error;
mod identity;
mod memory;
mod messages;
mod thread_id;

pub use client::{Connector, RemoteTransaction, ThreadClient};
pub use error::{ProtocolError, ProtocolResult};
pub use identity::{hmac_sign, verify_hmac, HmacIdentity, Identity};
pub use memory::{MemoryClient, MemoryConnector, MemoryThreadStore, MemoryTransaction};
pub use messages::{CollectionInfo, DbInfo, Endpoint, IndexInfo, Transport, AUTHORIZATION};
pub use thread_id::ThreadId;

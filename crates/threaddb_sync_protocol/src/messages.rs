//! Wire types exchanged with a thread store.

use crate::thread_id::ThreadId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Metadata key carrying the bearer token.
pub const AUTHORIZATION: &str = "authorization";

/// Network transport used to reach the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// gRPC over HTTP/2.
    #[default]
    Grpc,
    /// gRPC-web over HTTP/1.1.
    Http,
    /// WebSocket streaming.
    WebSocket,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transport::Grpc => "grpc",
            Transport::Http => "http",
            Transport::WebSocket => "websocket",
        };
        f.write_str(name)
    }
}

/// Where and how to reach a thread store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    /// Service host, e.g. `https://hub.example.com:3006`.
    pub host: String,
    /// Transport to use.
    pub transport: Transport,
    /// Call metadata sent with every request (includes the bearer token).
    pub metadata: BTreeMap<String, String>,
}

impl Endpoint {
    /// Creates an endpoint with no metadata.
    pub fn new(host: impl Into<String>, transport: Transport) -> Self {
        Self {
            host: host.into(),
            transport,
            metadata: BTreeMap::new(),
        }
    }

    /// Returns the bearer token, if one is set.
    #[must_use]
    pub fn bearer_token(&self) -> Option<&str> {
        self.metadata
            .get(AUTHORIZATION)
            .and_then(|v| v.strip_prefix("bearer "))
    }
}

/// A secondary index declared on a remote collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    /// Dot separated field path.
    pub path: String,
    /// Whether values must be unique.
    pub unique: bool,
}

/// Schema and indexes of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    /// Collection name.
    pub name: String,
    /// JSON schema of the collection's documents.
    pub schema: Value,
    /// Secondary indexes.
    #[serde(default)]
    pub indexes: Vec<IndexInfo>,
}

impl CollectionInfo {
    /// Creates a collection description without indexes.
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
            indexes: Vec::new(),
        }
    }
}

/// Description of a remote database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbInfo {
    /// Database name.
    pub name: String,
    /// Thread hosting the database.
    pub thread_id: ThreadId,
    /// Names of registered collections.
    pub collections: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transport_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(Transport::WebSocket).unwrap(),
            json!("websocket")
        );
        assert_eq!(Transport::default(), Transport::Grpc);
    }

    #[test]
    fn bearer_token_is_read_from_metadata() {
        let mut endpoint = Endpoint::new("http://127.0.0.1:3006", Transport::Http);
        assert_eq!(endpoint.bearer_token(), None);
        endpoint
            .metadata
            .insert(AUTHORIZATION.into(), "bearer abc".into());
        assert_eq!(endpoint.bearer_token(), Some("abc"));
    }
}

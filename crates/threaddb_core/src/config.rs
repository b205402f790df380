//! Database and remote configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use threaddb_sync_protocol::{Endpoint, ThreadId, Transport, AUTHORIZATION};

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database name, also used for the remote counterpart.
    pub name: String,

    /// Commit log location. `None` keeps the database in memory.
    pub path: Option<PathBuf>,

    /// Default timeout for key locks. `None` waits indefinitely.
    pub lock_timeout: Option<Duration>,

    /// Whether mutations of user collections are recorded in the change log.
    pub track_changes: bool,

    /// Whether dispatched store events are persisted to the event log.
    pub event_log: bool,

    /// Whether the commit log is compacted when the database closes.
    pub compact_on_close: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "threaddb".to_string(),
            path: None,
            lock_timeout: None,
            track_changes: true,
            event_log: false,
            compact_on_close: false,
        }
    }
}

impl DatabaseConfig {
    /// Creates an in-memory configuration with default values.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Stores the database in the file at `path`.
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets the default lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets whether changes are tracked.
    #[must_use]
    pub const fn track_changes(mut self, value: bool) -> Self {
        self.track_changes = value;
        self
    }

    /// Sets whether dispatched events are persisted.
    #[must_use]
    pub const fn event_log(mut self, value: bool) -> Self {
        self.event_log = value;
        self
    }

    /// Sets whether the log is compacted on close.
    #[must_use]
    pub const fn compact_on_close(mut self, value: bool) -> Self {
        self.compact_on_close = value;
        self
    }
}

/// Connection settings for the remote thread store.
///
/// Persisted in the metadata table so they survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Remote thread id, set once the remote is initialized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ThreadId>,

    /// Bearer token obtained by authorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Service host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_host: Option<String>,

    /// Transport. Unset means the default transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,

    /// Call metadata sent with every request.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RemoteConfig {
    /// Creates a configuration pointing at `host`.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            service_host: Some(host.into()),
            ..Self::default()
        }
    }

    /// Sets the thread id.
    #[must_use]
    pub fn id(mut self, id: ThreadId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the transport.
    #[must_use]
    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the bearer token and the matching authorization metadata.
    pub fn set_token(&mut self, token: impl Into<String>) {
        let token = token.into();
        self.metadata
            .insert(AUTHORIZATION.to_string(), format!("bearer {token}"));
        self.token = Some(token);
    }

    /// Overwrites the fields that are set in `update`. Metadata entries are
    /// merged key by key.
    pub fn merge(&mut self, update: RemoteConfig) {
        if update.id.is_some() {
            self.id = update.id;
        }
        if let Some(token) = update.token {
            self.set_token(token);
        }
        if update.service_host.is_some() {
            self.service_host = update.service_host;
        }
        if update.transport.is_some() {
            self.transport = update.transport;
        }
        self.metadata.extend(update.metadata);
    }

    /// The endpoint to connect to, if a host is configured.
    #[must_use]
    pub fn endpoint(&self) -> Option<Endpoint> {
        let host = self.service_host.as_ref().filter(|h| !h.is_empty())?;
        Some(Endpoint {
            host: host.clone(),
            transport: self.transport.unwrap_or_default(),
            metadata: self.metadata.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = DatabaseConfig::default();
        assert!(config.path.is_none());
        assert!(config.track_changes);
        assert!(!config.event_log);
        assert!(config.lock_timeout.is_none());
    }

    #[test]
    fn builder_pattern() {
        let config = DatabaseConfig::new("notes")
            .path("/tmp/notes/commit.log")
            .event_log(true)
            .lock_timeout(Some(Duration::from_millis(50)))
            .compact_on_close(true);
        assert_eq!(config.name, "notes");
        assert!(config.event_log);
        assert!(config.compact_on_close);
        assert_eq!(config.lock_timeout, Some(Duration::from_millis(50)));
    }

    #[test]
    fn merge_only_overwrites_given_fields() {
        let mut config = RemoteConfig::new("http://a")
            .transport(Transport::Http)
            .metadata("x-app", "1");
        config.merge(RemoteConfig {
            token: Some("tok".into()),
            ..RemoteConfig::default()
        });
        assert_eq!(config.service_host.as_deref(), Some("http://a"));
        assert_eq!(config.transport, Some(Transport::Http));
        assert_eq!(config.metadata["x-app"], "1");
        assert_eq!(config.metadata[AUTHORIZATION], "bearer tok");
    }

    #[test]
    fn endpoint_requires_host() {
        assert!(RemoteConfig::default().endpoint().is_none());
        assert!(RemoteConfig::new("").endpoint().is_none());
        let endpoint = RemoteConfig::new("http://a").endpoint().unwrap();
        assert_eq!(endpoint.transport, Transport::Grpc);
    }

    #[test]
    fn remote_config_serde() {
        let config = RemoteConfig::new("http://a").id(ThreadId::random());
        let json = serde_json::to_value(&config).unwrap();
        let back: RemoteConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}

//! Thread identifiers.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const PREFIX: char = 't';
const VERSION: u8 = 0x01;
const VARIANT_RAW: u8 = 0x55;
const RANDOM_LEN: usize = 16;

/// Identifier of a remote thread (a remotely hosted database).
///
/// The text form is `t` followed by the hex encoding of a version byte, a
/// variant byte and 16 random bytes.
///
/// # Example
///
/// ```rust
/// use threaddb_sync_protocol::ThreadId;
///
/// let id = ThreadId::random();
/// let parsed: ThreadId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ThreadId(String);

impl ThreadId {
    /// Generates a new random thread id.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = Vec::with_capacity(2 + RANDOM_LEN);
        bytes.push(VERSION);
        bytes.push(VARIANT_RAW);
        bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        Self(format!("{PREFIX}{}", hex::encode(bytes)))
    }

    /// Returns the text form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ThreadId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidThreadId(s.to_string());
        let body = s.strip_prefix(PREFIX).ok_or_else(invalid)?;
        let bytes = hex::decode(body).map_err(|_| invalid())?;
        if bytes.len() != 2 + RANDOM_LEN || bytes[0] != VERSION {
            return Err(invalid());
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for ThreadId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ThreadId> for String {
    fn from(id: ThreadId) -> Self {
        id.0
    }
}

//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::sync::Arc;

/// An in-memory commit log.
///
/// Clones share the same underlying buffer, so a test can keep a handle,
/// drop the engine, and reopen a new engine over the same bytes to
/// exercise replay.
///
/// # Example
///
/// ```rust
/// use threaddb_storage::{InMemoryBackend, StorageBackend};
///
/// let mut backend = InMemoryBackend::new();
/// backend.append(b"frame").unwrap();
/// assert_eq!(backend.len().unwrap(), 5);
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend preloaded with bytes, for recovery tests.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn contents(&self) -> StorageResult<Vec<u8>> {
        Ok(self.data.read().clone())
    }

    fn replace(&mut self, new_data: &[u8]) -> StorageResult<()> {
        *self.data.write() = new_data.to_vec();
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn len(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_offsets() {
        let mut backend = InMemoryBackend::new();
        assert!(backend.is_empty().unwrap());
        assert_eq!(backend.append(b"abc").unwrap(), 0);
        assert_eq!(backend.append(b"de").unwrap(), 3);
        assert_eq!(backend.contents().unwrap(), b"abcde");
    }

    #[test]
    fn clones_share_the_buffer() {
        let mut backend = InMemoryBackend::new();
        let observer = backend.clone();
        backend.append(b"shared").unwrap();
        assert_eq!(observer.data(), b"shared");
    }

    #[test]
    fn replace_swaps_contents() {
        let mut backend = InMemoryBackend::with_data(b"old log".to_vec());
        backend.replace(b"snap").unwrap();
        assert_eq!(backend.contents().unwrap(), b"snap");
        assert_eq!(backend.len().unwrap(), 4);
    }
}

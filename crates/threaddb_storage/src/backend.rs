//! Storage backend trait definition.

use crate::error::StorageResult;

/// A byte log that the engine persists its commit frames into.
///
/// Backends do not interpret what they store. The engine owns the frame
/// format and replays the full contents on open.
///
/// # Invariants
///
/// - `append` writes after all previously appended bytes
/// - `contents` returns every byte appended since the last `replace`
/// - `replace` swaps the whole contents atomically (used by compaction)
/// - `flush` makes appended bytes durable
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For tests and ephemeral databases
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Appends bytes to the end of the log and returns the offset they
    /// were written at.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Reads the entire log.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn contents(&self) -> StorageResult<Vec<u8>>;

    /// Atomically replaces the log with `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the replacement could not be made durable. The
    /// previous contents must still be readable in that case.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Flushes appended bytes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn len(&self) -> StorageResult<u64>;

    /// Returns true if nothing has been written yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }
}

//! The log backend trait.

use crate::error::StorageResult;

/// An append-only byte store backing the record log.
///
/// Backends are shared across threads and synchronize internally, so every
/// method takes `&self`. The engine serializes writers above this layer; a
/// backend only has to keep individual operations atomic.
///
/// # Invariants
///
/// - `append` returns the offset the data was written at, which equals the
///   store size before the call
/// - `read_at` returns exactly the bytes previously appended at that offset
/// - after `sync` returns, all appended data survives process termination
/// - `rewind(0)` empties the store; subsequent appends start at offset zero
pub trait LogBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range extends
    /// beyond the current size, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends bytes to the end of the store and returns their offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write fails.
    fn append(&self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&self) -> StorageResult<()>;

    /// Forces data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&self) -> StorageResult<()>;

    /// Returns the current size in bytes (the next append offset).
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn len(&self) -> StorageResult<u64>;

    /// Returns `true` when the store holds no bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Shrinks the store to `size` bytes, discarding everything after.
    ///
    /// Used when the log is compacted: the engine rewinds to zero and
    /// rewrites a snapshot frame.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::RewindPastEnd`] if `size` exceeds the
    /// current size, or an I/O error.
    fn rewind(&self, size: u64) -> StorageResult<()>;
}

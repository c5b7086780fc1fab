//! Error types for storage backends.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors produced by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A read requested bytes beyond the end of the store.
    #[error("read past end: offset {offset} len {len} but store holds {size} bytes")]
    ReadPastEnd {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: usize,
        /// Current store size.
        size: u64,
    },

    /// A rewind target lies beyond the current end of the store.
    #[error("cannot rewind to {target}: store holds only {size} bytes")]
    RewindPastEnd {
        /// Requested new size.
        target: u64,
        /// Current store size.
        size: u64,
    },

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

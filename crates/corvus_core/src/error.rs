//! Error types for CorvusDB core.

use std::io;
use thiserror::Error;

use crate::types::Etag;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in CorvusDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] corvus_storage::StorageError),

    /// JSON serialization or parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A write carried an etag that no longer matches the stored document.
    #[error("concurrency conflict on document {key}: expected {expected:?}, actual {actual:?}")]
    ConcurrencyConflict {
        /// Key of the contested document.
        key: String,
        /// Etag the caller expected.
        expected: Option<Etag>,
        /// Etag currently stored, `None` when the document does not exist.
        actual: Option<Etag>,
    },

    /// A query named an index that is not registered.
    #[error("index does not exist: {name}")]
    IndexDoesNotExist {
        /// Name of the missing index.
        name: String,
    },

    /// A transaction operation referenced an unknown or expired transaction.
    #[error("transaction not found: {id}")]
    TransactionNotFound {
        /// The transaction that was looked up.
        id: String,
    },

    /// The record log is corrupted or invalid.
    #[error("log corruption: {message}")]
    LogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected in a log frame.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// A view function failed while mapping or reducing.
    #[error("view error in index {index}: {message}")]
    ViewFailed {
        /// Index whose view function failed.
        index: String,
        /// Description of the failure.
        message: String,
    },

    /// A query string could not be parsed.
    #[error("invalid query: {message}")]
    InvalidQuery {
        /// Description of the parse failure.
        message: String,
    },

    /// Database is already open or locked.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Invalid database format or version.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// The on-disk schema version does not match this build.
    #[error("schema version mismatch: found {found}, supported {supported}; migrate or discard the data directory")]
    SchemaVersionMismatch {
        /// Version recorded in the manifest.
        found: u32,
        /// Version this build reads and writes.
        supported: u32,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,
}

impl CoreError {
    /// Creates a log corruption error.
    pub fn log_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid query error.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            message: message.into(),
        }
    }

    /// Creates a view failure error.
    pub fn view_failed(index: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ViewFailed {
            index: index.into(),
            message: message.into(),
        }
    }

    /// Creates an index-does-not-exist error.
    pub fn index_does_not_exist(name: impl Into<String>) -> Self {
        Self::IndexDoesNotExist { name: name.into() }
    }

    /// Returns `true` when this error is an optimistic concurrency conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

//! # CorvusDB Storage
//!
//! Append-only storage backends for the CorvusDB record log.
//!
//! A backend is an opaque, growable byte sequence: the engine appends framed
//! record batches to it, scans it from the start on recovery, and rewinds it
//! when the log is compacted. Backends interpret nothing: the frame format,
//! checksums, and record semantics all live in `corvus_core`.
//!
//! ## Available backends
//!
//! - [`MemoryBackend`] for tests and ephemeral databases
//! - [`FileBackend`] for persistent storage over OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use corvus_storage::{LogBackend, MemoryBackend};
//!
//! let backend = MemoryBackend::new();
//! let offset = backend.append(b"frame bytes").unwrap();
//! assert_eq!(offset, 0);
//! assert_eq!(backend.read_at(offset, 11).unwrap(), b"frame bytes");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::LogBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::MemoryBackend;

//! # CorvusDB Core
//!
//! Core engine for CorvusDB, a single-node document store with
//! asynchronous map/reduce indexes.
//!
//! This crate provides:
//! - A durable record log replayed into in-memory tables
//! - Documents with etag-based optimistic concurrency
//! - Multi-document transactions staged as shadow writes
//! - Map and map/reduce indexes updated by background workers
//! - A small field-matching query language
//!
//! ## Example
//!
//! ```rust,ignore
//! use corvus_core::{Database, IndexDefinition};
//!
//! let db = Database::open_in_memory(compiler)?;
//! db.put(Some("users/1".into()), br#"{"name":"ada"}"#.to_vec(),
//!        Default::default(), None, None)?;
//! db.create_index(IndexDefinition::map_only("byName", "from doc select name"))?;
//! db.wait_for_non_stale("byName", std::time::Duration::from_secs(5))?;
//! let page = db.query("byName", "name:ada", 0, 25, &[])?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod database;
pub mod dir;
pub mod document;
pub mod error;
pub mod index;
pub mod manifest;
pub mod registry;
pub mod stats;
pub mod store;
pub mod tasks;
pub mod types;

pub use config::Config;
pub use database::{Database, QueryResult};
pub use document::{Document, PutResult};
pub use error::{CoreError, CoreResult};
pub use index::{
    IndexDefinition, IndexingError, MapFn, QueryExpr, ReduceFn, ViewCompiler, ViewError,
    ViewGenerator,
};
pub use manifest::{Manifest, SCHEMA_VERSION};
pub use registry::IndexRegistry;
pub use stats::IndexingStats;
pub use store::RecordStore;
pub use tasks::Task;
pub use types::{Etag, TaskId, TxId, DOCUMENT_ID_FIELD};

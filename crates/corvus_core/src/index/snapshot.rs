//! Published index snapshots and their use-counted lifecycle.
//!
//! Readers never touch the writer's working rows. Publishing clones the
//! rows into an immutable [`Snapshot`], swaps it in as current, and
//! retires the previous one. A retired snapshot stays alive while readers
//! hold guards on it; the last guard to drop deletes its generation file.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// One entry in an index: a projection plus whether it may only be
/// returned as a projection.
///
/// Map rows carry `view_only: false` and point back at a source document
/// through its injected key field. Reduce aggregates carry
/// `view_only: true` since no single document produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRow {
    /// The projected value.
    pub data: Value,
    /// `true` for reduce aggregates.
    pub view_only: bool,
}

/// Index contents keyed by source document key, or by reduce key for
/// aggregates.
pub type IndexRows = BTreeMap<String, Vec<IndexRow>>;

/// An immutable published generation of an index.
#[derive(Debug)]
pub struct Snapshot {
    /// The rows visible to readers of this generation.
    pub rows: IndexRows,
    /// Monotonic generation number.
    pub generation: u64,
    /// Backing file, absent for in-memory databases.
    file: Option<PathBuf>,
    /// Guards currently reading this snapshot.
    uses: AtomicU32,
    /// Set once a newer generation replaced this one.
    retired: AtomicBool,
}

impl Snapshot {
    /// Creates a snapshot over `rows`.
    #[must_use]
    pub fn new(rows: IndexRows, generation: u64, file: Option<PathBuf>) -> Self {
        Self {
            rows,
            generation,
            file,
            uses: AtomicU32::new(0),
            retired: AtomicBool::new(false),
        }
    }

    /// Takes a read guard, pinning the snapshot and its file.
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> SnapshotGuard {
        self.uses.fetch_add(1, Ordering::SeqCst);
        SnapshotGuard {
            snapshot: Arc::clone(self),
        }
    }

    /// Marks the snapshot as superseded. Its file is deleted now if no
    /// reader holds it, otherwise when the last guard drops.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        if self.uses.load(Ordering::SeqCst) == 0 {
            self.delete_file();
        }
    }

    /// Number of live read guards.
    #[must_use]
    pub fn uses(&self) -> u32 {
        self.uses.load(Ordering::SeqCst)
    }

    fn release(&self) {
        let previous = self.uses.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && self.retired.load(Ordering::SeqCst) {
            self.delete_file();
        }
    }

    fn delete_file(&self) {
        if let Some(path) = &self.file {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(path = %path.display(), %err, "could not delete retired snapshot");
                }
            }
        }
    }
}

/// RAII read guard over a snapshot.
pub struct SnapshotGuard {
    snapshot: Arc<Snapshot>,
}

impl SnapshotGuard {
    /// The pinned rows.
    #[must_use]
    pub fn rows(&self) -> &IndexRows {
        &self.snapshot.rows
    }

    /// Generation of the pinned snapshot.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.snapshot.generation
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        self.snapshot.release();
    }
}

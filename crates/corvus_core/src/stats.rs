//! Indexing statistics.

use serde::{Deserialize, Serialize};

/// Counters for one index, persisted through the record log so they
/// survive restarts.
///
/// `attempts` counts documents fed to the map function, `successes` those
/// that produced output without error, and `failures` those whose map or
/// reduce call failed. Failed documents are skipped, not retried, so
/// `attempts == successes + failures` once a batch completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingStats {
    /// Documents fed to the view functions.
    pub attempts: u64,
    /// Documents indexed without error.
    pub successes: u64,
    /// Documents skipped because a view function failed.
    pub failures: u64,
}

impl IndexingStats {
    /// Merges another batch of counters into this one.
    pub fn absorb(&mut self, other: IndexingStats) {
        self.attempts += other.attempts;
        self.successes += other.successes;
        self.failures += other.failures;
    }
}

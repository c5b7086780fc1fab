//! View functions: the map and reduce callables behind an index, plus the
//! fault-isolated enumeration that feeds documents through them.

use crate::error::CoreResult;
use crate::index::definition::IndexDefinition;
use crate::stats::IndexingStats;
use crate::store::now_ms;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by a map or reduce function for one input.
///
/// View errors never abort a batch; the offending document is skipped,
/// counted, and logged, and indexing moves on.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ViewError {
    /// What went wrong.
    pub message: String,
}

impl ViewError {
    /// Creates a view error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A compiled map function: one document in, zero or more projections out.
pub type MapFn = Arc<dyn Fn(&Value) -> Result<Vec<Value>, ViewError> + Send + Sync>;

/// A compiled reduce function: a whole group of mapped values in, one
/// aggregate out.
pub type ReduceFn = Arc<dyn Fn(&str, &[Value]) -> Result<Value, ViewError> + Send + Sync>;

/// The compiled view functions of one index.
#[derive(Clone)]
pub struct ViewGenerator {
    /// Map function, always present.
    pub map: MapFn,
    /// Reduce function, present only for map-reduce indexes.
    pub reduce: Option<ReduceFn>,
}

impl std::fmt::Debug for ViewGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewGenerator")
            .field("reduce", &self.reduce.is_some())
            .finish_non_exhaustive()
    }
}

/// Turns stored index definitions into executable view functions.
///
/// The engine stores definitions as text and leaves their meaning to the
/// embedder, which supplies a compiler at open time.
pub trait ViewCompiler: Send + Sync {
    /// Compiles `definition` into its view functions.
    ///
    /// # Errors
    ///
    /// Returns an error when the definition's map or reduce source is
    /// rejected.
    fn compile(&self, definition: &IndexDefinition) -> CoreResult<ViewGenerator>;
}

/// One recorded indexing failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexingError {
    /// When the failure happened, milliseconds since epoch.
    pub at_ms: u64,
    /// Index whose view function failed.
    pub index: String,
    /// Document (or reduce group) that triggered the failure.
    pub doc_key: String,
    /// The view error message.
    pub message: String,
}

/// Bounded ring of recent indexing failures.
///
/// Kept in memory only; restarting clears it. The persisted failure
/// counters live in [`IndexingStats`].
#[derive(Debug)]
pub struct ErrorLog {
    entries: Mutex<VecDeque<IndexingError>>,
    capacity: usize,
}

impl ErrorLog {
    /// Creates a log retaining at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Records a failure, evicting the oldest entry when full.
    pub fn record(&self, index: &str, doc_key: &str, message: &str) {
        tracing::warn!(index, doc_key, message, "view function failed");
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(IndexingError {
            at_ms: now_ms(),
            index: index.to_string(),
            doc_key: doc_key.to_string(),
            message: message.to_string(),
        });
    }

    /// Returns the retained failures, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<IndexingError> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Number of retained failures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// `true` when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Runs `map` over `inputs`, isolating failures to the input that caused
/// them. Returns the successful outputs plus counters covering every
/// input.
pub fn map_robustly(
    map: &MapFn,
    inputs: impl IntoIterator<Item = (String, Value)>,
    index: &str,
    errors: &ErrorLog,
) -> (Vec<(String, Vec<Value>)>, IndexingStats) {
    let mut outputs = Vec::new();
    let mut stats = IndexingStats::default();
    for (doc_key, value) in inputs {
        stats.attempts += 1;
        match (map)(&value) {
            Ok(rows) => {
                stats.successes += 1;
                outputs.push((doc_key, rows));
            }
            Err(err) => {
                stats.failures += 1;
                errors.record(index, &doc_key, &err.message);
            }
        }
    }
    (outputs, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn failing_on(marker: &str) -> MapFn {
        let marker = marker.to_string();
        Arc::new(move |value| {
            if value["name"] == json!(marker) {
                Err(ViewError::new("bad document"))
            } else {
                Ok(vec![value.clone()])
            }
        })
    }

    #[test]
    fn one_bad_document_does_not_stop_the_rest() {
        let map = failing_on("broken");
        let errors = ErrorLog::new(10);
        let inputs = vec![
            ("docs/1".to_string(), json!({"name": "ok"})),
            ("docs/2".to_string(), json!({"name": "broken"})),
            ("docs/3".to_string(), json!({"name": "fine"})),
        ];

        let (outputs, stats) = map_robustly(&map, inputs, "test", &errors);
        assert_eq!(outputs.len(), 2);
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);

        let recent = errors.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].doc_key, "docs/2");
    }

    #[test]
    fn error_log_is_bounded() {
        let log = ErrorLog::new(3);
        for i in 0..5 {
            log.record("idx", &format!("docs/{i}"), "boom");
        }
        let recent = log.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].doc_key, "docs/2");
        assert_eq!(recent[2].doc_key, "docs/4");
    }
}

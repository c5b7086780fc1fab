//! The index runtime.
//!
//! An [`Index`] pairs a writer-side working copy of its rows with a chain
//! of published read [`Snapshot`]s. Plain indexes store map outputs keyed
//! by source document; map-reduce indexes store their map outputs in the
//! record store and keep only reduce aggregates as rows, keyed by reduce
//! key so recomputing a group replaces its aggregate instead of
//! duplicating it.

pub mod definition;
pub mod query;
pub mod snapshot;
pub mod view;

pub use definition::IndexDefinition;
pub use query::{parse_query, QueryExpr};
pub use snapshot::{IndexRow, IndexRows, Snapshot, SnapshotGuard};
pub use view::{ErrorLog, IndexingError, MapFn, ReduceFn, ViewCompiler, ViewError, ViewGenerator};

use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::stats::IndexingStats;
use crate::store::RecordStore;
use crate::store::record::MappedResult;
use crate::tasks::Task;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// On-disk shape of one snapshot generation.
#[derive(Debug, Serialize, Deserialize)]
struct GenerationFile {
    generation: u64,
    rows: IndexRows,
}

/// Writer-side state, serialized by a mutex so only one indexing batch
/// runs per index.
#[derive(Debug)]
struct IndexWriter {
    rows: IndexRows,
    generation: u64,
    dir: Option<PathBuf>,
}

impl IndexWriter {
    fn generation_path(&self, generation: u64) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("gen-{generation:06}.idx")))
    }
}

/// One live index: definition, compiled view functions, rows, snapshots.
pub struct Index {
    name: String,
    definition: IndexDefinition,
    view: ViewGenerator,
    writer: Mutex<IndexWriter>,
    current: RwLock<Arc<Snapshot>>,
    indexing: AtomicBool,
    errors: ErrorLog,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.name)
            .field("map_reduce", &self.definition.is_map_reduce())
            .finish_non_exhaustive()
    }
}

/// Clears the indexing flag when an indexing pass ends, error or not.
struct IndexingFlag<'a>(&'a AtomicBool);

impl<'a> IndexingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for IndexingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Index {
    /// Opens an index, loading the newest persisted generation when a
    /// directory is given.
    ///
    /// # Errors
    ///
    /// Returns an error when a generation file exists but cannot be read.
    pub fn open(
        definition: IndexDefinition,
        view: ViewGenerator,
        dir: Option<PathBuf>,
        error_log_capacity: usize,
    ) -> CoreResult<Arc<Self>> {
        let (rows, generation, file) = match &dir {
            Some(dir) => load_latest_generation(dir)?,
            None => (IndexRows::new(), 0, None),
        };

        let name = definition.name.clone();
        let current = Arc::new(Snapshot::new(rows.clone(), generation, file));
        Ok(Arc::new(Self {
            name,
            definition,
            view,
            writer: Mutex::new(IndexWriter {
                rows,
                generation,
                dir,
            }),
            current: RwLock::new(current),
            indexing: AtomicBool::new(false),
            errors: ErrorLog::new(error_log_capacity),
        }))
    }

    /// The index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stored definition.
    #[must_use]
    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    /// `true` while an indexing or reduce pass is running.
    #[must_use]
    pub fn is_indexing(&self) -> bool {
        self.indexing.load(Ordering::SeqCst)
    }

    /// Recent view failures of this index.
    #[must_use]
    pub fn recent_errors(&self) -> Vec<IndexingError> {
        self.errors.recent()
    }

    /// Runs the map function over `documents` and publishes the outcome.
    ///
    /// For a plain index the outputs become rows keyed by document. For a
    /// map-reduce index they are written to the record store as mapped
    /// results and a reduce task is enqueued for every group whose input
    /// set changed, old groups included.
    ///
    /// A document whose payload fails to parse or whose map call fails is
    /// skipped and counted; the rest of the batch proceeds.
    ///
    /// # Errors
    ///
    /// Returns an error when publishing rows or the record batch fails.
    pub fn index_documents(&self, store: &RecordStore, documents: &[Document]) -> CoreResult<()> {
        let _flag = IndexingFlag::raise(&self.indexing);

        let mut parse_failures = IndexingStats::default();
        let mut inputs = Vec::with_capacity(documents.len());
        for document in documents {
            match document.to_indexable() {
                Ok(value) => inputs.push((document.key.clone(), value)),
                Err(err) => {
                    parse_failures.attempts += 1;
                    parse_failures.failures += 1;
                    self.errors
                        .record(&self.name, &document.key, &format!("unparseable payload: {err}"));
                }
            }
        }

        let (outputs, mut stats) = view::map_robustly(&self.view.map, inputs, &self.name, &self.errors);
        stats.absorb(parse_failures);

        if self.definition.is_map_reduce() {
            self.store_mapped_outputs(store, &outputs, stats)?;
        } else {
            {
                let mut writer = self.writer.lock();
                for (doc_key, rows) in &outputs {
                    if rows.is_empty() {
                        writer.rows.remove(doc_key);
                    } else {
                        writer.rows.insert(
                            doc_key.clone(),
                            rows.iter()
                                .map(|data| IndexRow {
                                    data: data.clone(),
                                    view_only: false,
                                })
                                .collect(),
                        );
                    }
                }
                self.publish(&mut writer)?;
            }
            store.batch(|actions| {
                actions.bump_index_stats(&self.name, stats);
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Writes mapped outputs to the record store and queues one reduce
    /// task per touched group.
    fn store_mapped_outputs(
        &self,
        store: &RecordStore,
        outputs: &[(String, Vec<Value>)],
        stats: IndexingStats,
    ) -> CoreResult<()> {
        let group_by = self.definition.group_by.as_deref().unwrap_or_default();
        store.batch(|actions| {
            let mut touched = BTreeSet::new();
            for (doc_key, rows) in outputs {
                for old in actions.reduce_keys_of(&self.name, doc_key) {
                    touched.insert(old);
                }
                let results: Vec<MappedResult> = rows
                    .iter()
                    .map(|row| MappedResult {
                        reduce_key: reduce_key_of(row, group_by),
                        value: row.clone(),
                    })
                    .collect();
                for result in &results {
                    touched.insert(result.reduce_key.clone());
                }
                if results.is_empty() {
                    actions.delete_mapped_results(&self.name, doc_key);
                } else {
                    actions.put_mapped_results(&self.name, doc_key, results);
                }
            }
            for reduce_key in touched {
                actions.add_task(Task::Reduce {
                    index: self.name.clone(),
                    reduce_key,
                });
            }
            actions.bump_index_stats(&self.name, stats);
            Ok(())
        })
    }

    /// Removes documents from the index.
    ///
    /// # Errors
    ///
    /// Returns an error when publishing rows or the record batch fails.
    pub fn remove_documents(&self, store: &RecordStore, keys: &[String]) -> CoreResult<()> {
        let _flag = IndexingFlag::raise(&self.indexing);

        if self.definition.is_map_reduce() {
            store.batch(|actions| {
                let mut touched = BTreeSet::new();
                for key in keys {
                    for old in actions.reduce_keys_of(&self.name, key) {
                        touched.insert(old);
                    }
                    actions.delete_mapped_results(&self.name, key);
                }
                for reduce_key in touched {
                    actions.add_task(Task::Reduce {
                        index: self.name.clone(),
                        reduce_key,
                    });
                }
                Ok(())
            })
        } else {
            let mut writer = self.writer.lock();
            for key in keys {
                writer.rows.remove(key);
            }
            self.publish(&mut writer)
        }
    }

    /// Recomputes one group's aggregate from the complete set of mapped
    /// results currently stored for it.
    ///
    /// An empty input set removes the group's row. A reduce failure is
    /// recorded and counted; the previous aggregate, if any, stays.
    ///
    /// # Errors
    ///
    /// Returns an error when publishing rows or the record batch fails.
    pub fn reduce_group(&self, store: &RecordStore, reduce_key: &str) -> CoreResult<()> {
        let Some(reduce) = &self.view.reduce else {
            // A queued reduce can outlive its index: the name may since
            // have been reused for a plain index. Dropping the task beats
            // retrying it forever.
            tracing::warn!(
                index = %self.name,
                reduce_key,
                "dropping reduce for an index with no reduce function"
            );
            return Ok(());
        };
        let _flag = IndexingFlag::raise(&self.indexing);

        let group = store.mapped_results_for(&self.name, reduce_key);
        let mut writer = self.writer.lock();
        if group.is_empty() {
            writer.rows.remove(reduce_key);
            return self.publish(&mut writer);
        }

        let values: Vec<Value> = group.into_iter().map(|result| result.value).collect();
        match (reduce)(reduce_key, &values) {
            Ok(aggregate) => {
                writer.rows.insert(
                    reduce_key.to_string(),
                    vec![IndexRow {
                        data: aggregate,
                        view_only: true,
                    }],
                );
                self.publish(&mut writer)?;
                drop(writer);
                store.batch(|actions| {
                    actions.bump_index_stats(
                        &self.name,
                        IndexingStats {
                            attempts: 1,
                            successes: 1,
                            failures: 0,
                        },
                    );
                    Ok(())
                })
            }
            Err(err) => {
                drop(writer);
                self.errors.record(&self.name, reduce_key, &err.message);
                store.batch(|actions| {
                    actions.bump_index_stats(
                        &self.name,
                        IndexingStats {
                            attempts: 1,
                            successes: 0,
                            failures: 1,
                        },
                    );
                    Ok(())
                })
            }
        }
    }

    /// Searches the current snapshot.
    ///
    /// Returns the matching rows after `start`, at most `page_size` of
    /// them, plus the total number of matches in the snapshot. When
    /// `fields` is non-empty each result is a projection holding just
    /// those fields.
    #[must_use]
    pub fn search(
        &self,
        expr: &QueryExpr,
        start: usize,
        page_size: usize,
        fields: &[String],
    ) -> (Vec<Value>, usize) {
        let guard = {
            let current = self.current.read();
            current.acquire()
        };

        let mut total = 0usize;
        let mut results = Vec::new();
        for rows in guard.rows().values() {
            for row in rows {
                if !expr.matches(&row.data) {
                    continue;
                }
                total += 1;
                if total > start && results.len() < page_size {
                    results.push(project(&row.data, fields));
                }
            }
        }
        (results, total)
    }

    /// Number of rows in the current snapshot.
    #[must_use]
    pub fn row_count(&self) -> usize {
        let guard = {
            let current = self.current.read();
            current.acquire()
        };
        guard.rows().values().map(Vec::len).sum()
    }

    /// Retires the current snapshot, releasing its file once the last
    /// reader finishes. Called when the index is deleted.
    pub fn dispose(&self) {
        self.current.read().retire();
    }

    /// Publishes the writer's rows as a new generation and retires the
    /// previous snapshot.
    fn publish(&self, writer: &mut IndexWriter) -> CoreResult<()> {
        writer.generation += 1;
        let file = writer.generation_path(writer.generation);
        if let Some(path) = &file {
            let payload = serde_json::to_vec(&GenerationFile {
                generation: writer.generation,
                rows: writer.rows.clone(),
            })?;
            let tmp = path.with_extension("idx.tmp");
            fs::write(&tmp, payload)?;
            fs::rename(&tmp, path)?;
        }

        let next = Arc::new(Snapshot::new(writer.rows.clone(), writer.generation, file));
        let previous = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, next)
        };
        previous.retire();
        tracing::debug!(index = %self.name, generation = writer.generation, "snapshot published");
        Ok(())
    }
}

/// Projects `fields` out of a row, or clones the row when none are asked
/// for. Missing fields are omitted; a field name requested more than once
/// collapses into a single entry holding an array of the values. The
/// document key travels with every projection so callers can tell results
/// apart; reduce aggregates have no key and gain none.
fn project(data: &Value, fields: &[String]) -> Value {
    if fields.is_empty() {
        return data.clone();
    }
    let mut out = serde_json::Map::new();
    for field in fields {
        let mut current = data;
        let mut found = true;
        for part in field.split('.') {
            match current.get(part) {
                Some(next) => current = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if !found {
            continue;
        }
        match out.get_mut(field) {
            Some(Value::Array(values)) => values.push(current.clone()),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, current.clone()]);
            }
            None => {
                out.insert(field.clone(), current.clone());
            }
        }
    }
    if let Some(id) = data.get(crate::types::DOCUMENT_ID_FIELD) {
        out.entry(crate::types::DOCUMENT_ID_FIELD.to_string())
            .or_insert_with(|| id.clone());
    }
    Value::Object(out)
}

/// Extracts the reduce key of a mapped output: the canonical text of its
/// group-by field. A missing field groups under `"null"`.
fn reduce_key_of(row: &Value, group_by: &str) -> String {
    match row.get(group_by) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "null".to_string(),
    }
}

/// Loads the newest generation file in `dir`, deleting older leftovers.
fn load_latest_generation(dir: &Path) -> CoreResult<(IndexRows, u64, Option<PathBuf>)> {
    let mut generations: Vec<PathBuf> = Vec::new();
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.starts_with("gen-") && name.ends_with(".idx") {
                generations.push(path);
            }
        }
    }
    generations.sort();
    let Some(latest) = generations.pop() else {
        return Ok((IndexRows::new(), 0, None));
    };
    for stale in generations {
        let _ = fs::remove_file(stale);
    }

    let bytes = fs::read(&latest)?;
    let file: GenerationFile = serde_json::from_slice(&bytes).map_err(|e| {
        CoreError::invalid_format(format!(
            "unreadable index snapshot {}: {e}",
            latest.display()
        ))
    })?;
    Ok((file.rows, file.generation, Some(latest)))
}

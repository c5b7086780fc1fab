//! In-memory tables rebuilt from the record log.

use crate::document::Document;
use crate::stats::IndexingStats;
use crate::store::record::{LogRecord, MappedResult};
use crate::tasks::Task;
use crate::types::{TaskId, TxId};
use std::collections::{BTreeMap, HashMap};

/// One staged write inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum ShadowWrite {
    /// The key will hold this document when the transaction commits.
    Put(Document),
    /// The key will be removed when the transaction commits.
    Delete,
}

/// State of one in-flight transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxRecord {
    /// Wall-clock expiry, milliseconds since epoch. The sweeper rolls the
    /// transaction back once this passes.
    pub expires_at_ms: u64,
    /// Staged writes keyed by document key.
    pub shadows: BTreeMap<String, ShadowWrite>,
}

/// The whole mutable state of the store, reconstructed by replaying the
/// log and kept current by applying each committed batch.
///
/// `apply` is the single write path: replay and live commits go through
/// the same code, so the in-memory state after a restart matches the state
/// before the crash exactly.
#[derive(Debug, Default)]
pub struct Tables {
    /// Published documents by key.
    pub documents: BTreeMap<String, Document>,
    /// In-flight transactions, including those revived by replay.
    pub transactions: HashMap<TxId, TxRecord>,
    /// Pending background tasks in enqueue order.
    pub tasks: BTreeMap<TaskId, Task>,
    /// Next task ID to hand out.
    pub next_task_id: TaskId,
    /// Map outputs per (index, document key), the reduce input set.
    pub mapped_results: BTreeMap<(String, String), Vec<MappedResult>>,
    /// Persisted indexing counters per index.
    pub index_stats: HashMap<String, IndexingStats>,
}

impl Tables {
    /// Creates empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_task_id: TaskId::new(1),
            ..Self::default()
        }
    }

    /// Applies one record, mutating the tables.
    pub fn apply(&mut self, record: &LogRecord) {
        match record {
            LogRecord::PutDocument { document } => {
                self.documents.insert(document.key.clone(), document.clone());
            }

            LogRecord::DeleteDocument { key } => {
                self.documents.remove(key);
            }

            LogRecord::ShadowPut {
                tx,
                expires_at_ms,
                document,
            } => {
                let entry = self.transactions.entry(*tx).or_default();
                entry.expires_at_ms = *expires_at_ms;
                entry
                    .shadows
                    .insert(document.key.clone(), ShadowWrite::Put(document.clone()));
                if let Some(published) = self.documents.get_mut(&document.key) {
                    published.locked_by = Some(*tx);
                }
            }

            LogRecord::ShadowDelete {
                tx,
                expires_at_ms,
                key,
            } => {
                let entry = self.transactions.entry(*tx).or_default();
                entry.expires_at_ms = *expires_at_ms;
                entry.shadows.insert(key.clone(), ShadowWrite::Delete);
                if let Some(published) = self.documents.get_mut(key) {
                    published.locked_by = Some(*tx);
                }
            }

            LogRecord::CommitTransaction { tx } => {
                if let Some(record) = self.transactions.remove(tx) {
                    for (key, shadow) in record.shadows {
                        match shadow {
                            ShadowWrite::Put(mut document) => {
                                document.locked_by = None;
                                self.documents.insert(key, document);
                            }
                            ShadowWrite::Delete => {
                                self.documents.remove(&key);
                            }
                        }
                    }
                }
            }

            LogRecord::RollbackTransaction { tx } => {
                if let Some(record) = self.transactions.remove(tx) {
                    for key in record.shadows.keys() {
                        if let Some(published) = self.documents.get_mut(key) {
                            if published.locked_by == Some(*tx) {
                                published.locked_by = None;
                            }
                        }
                    }
                }
            }

            LogRecord::AddTask { id, task } => {
                self.tasks.insert(*id, task.clone());
                if *id >= self.next_task_id {
                    self.next_task_id = id.next();
                }
            }

            LogRecord::RemoveTask { id } => {
                self.tasks.remove(id);
            }

            LogRecord::PutMappedResults {
                index,
                doc_key,
                results,
            } => {
                self.mapped_results
                    .insert((index.clone(), doc_key.clone()), results.clone());
            }

            LogRecord::DeleteMappedResults { index, doc_key } => {
                self.mapped_results.remove(&(index.clone(), doc_key.clone()));
            }

            LogRecord::SetIndexStats { index, stats } => {
                self.index_stats.insert(index.clone(), *stats);
            }

            LogRecord::PurgeIndex { index } => {
                self.mapped_results
                    .retain(|(owner, _), _| owner != index);
                self.index_stats.remove(index);
                self.tasks.retain(|_, task| task.index() != index);
            }
        }
    }

    /// Returns every mapped output currently stored for one group of a
    /// map-reduce index. This is the complete reduce input.
    #[must_use]
    pub fn mapped_results_for(&self, index: &str, reduce_key: &str) -> Vec<MappedResult> {
        self.mapped_results
            .range((index.to_string(), String::new())..)
            .take_while(|((owner, _), _)| owner == index)
            .flat_map(|(_, results)| results.iter())
            .filter(|result| result.reduce_key == reduce_key)
            .cloned()
            .collect()
    }

    /// Returns the distinct reduce keys currently stored for one document
    /// in one index.
    #[must_use]
    pub fn reduce_keys_of(&self, index: &str, doc_key: &str) -> Vec<String> {
        let Some(results) = self
            .mapped_results
            .get(&(index.to_string(), doc_key.to_string()))
        else {
            return Vec::new();
        };
        let mut keys: Vec<String> = results.iter().map(|r| r.reduce_key.clone()).collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Returns `true` when any pending task targets `index`.
    #[must_use]
    pub fn has_tasks_for(&self, index: &str) -> bool {
        self.tasks.values().any(|task| task.index() == index)
    }

    /// Returns transactions whose expiry has passed.
    #[must_use]
    pub fn expired_transactions(&self, now_ms: u64) -> Vec<TxId> {
        self.transactions
            .iter()
            .filter(|(_, record)| record.expires_at_ms <= now_ms)
            .map(|(tx, _)| *tx)
            .collect()
    }
}

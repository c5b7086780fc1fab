//! The record store: a replayed log of document, transaction, task, and
//! map-output records.
//!
//! All durable state lives in one append-only log of frames (see
//! [`record`]). Opening the store replays the log into in-memory
//! [`tables::Tables`]; every write goes through [`RecordStore::batch`],
//! which stages records in a session and publishes them as a single frame.
//! A batch is therefore all-or-nothing across documents, tasks, and map
//! outputs, which is what keeps indexes and the task queue consistent with
//! the documents they describe.

pub mod actions;
pub mod record;
pub mod tables;

use crate::error::{CoreError, CoreResult};
use crate::stats::IndexingStats;
use crate::store::actions::{Overlay, StorageActions};
use crate::store::record::{encode_frame, read_all, LogRecord, MappedResult};
use crate::store::tables::{ShadowWrite, Tables};
use crate::tasks::Task;
use crate::types::{TaskId, TxId};
use crate::document::Document;
use corvus_storage::LogBackend;
use parking_lot::{ReentrantMutex, RwLock, RwLockReadGuard};
use std::cell::RefCell;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Staged records of the batch currently holding the session.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) records: Vec<LogRecord>,
    pub(crate) overlay: Overlay,
}

/// The durable record store.
pub struct RecordStore {
    log: Box<dyn LogBackend>,
    tables: RwLock<Tables>,
    /// Session slot for the batch write path. The reentrant lock lets a
    /// batch closure call `batch` again on the same thread; the nested
    /// call joins the open session instead of deadlocking.
    session: ReentrantMutex<RefCell<Option<SessionState>>>,
    sync_on_commit: bool,
    transaction_timeout: Duration,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("sync_on_commit", &self.sync_on_commit)
            .field("transaction_timeout", &self.transaction_timeout)
            .finish_non_exhaustive()
    }
}

impl RecordStore {
    /// Opens the store by replaying every complete frame in the backend.
    ///
    /// A torn tail (incomplete final frame) is rewound away with a
    /// warning. Corruption inside a complete frame fails the open.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or log corruption.
    pub fn open(
        backend: Box<dyn LogBackend>,
        sync_on_commit: bool,
        transaction_timeout: Duration,
    ) -> CoreResult<Self> {
        let outcome = read_all(backend.as_ref())?;
        let total = backend.len()?;
        if outcome.valid_len < total {
            tracing::warn!(
                valid = outcome.valid_len,
                total,
                "discarding torn frame at log tail"
            );
            backend.rewind(outcome.valid_len)?;
        }

        let mut tables = Tables::new();
        for batch in &outcome.batches {
            for record in batch {
                tables.apply(record);
            }
        }
        tracing::info!(
            batches = outcome.batches.len(),
            documents = tables.documents.len(),
            tasks = tables.tasks.len(),
            transactions = tables.transactions.len(),
            "record store replayed"
        );

        Ok(Self {
            log: backend,
            tables: RwLock::new(tables),
            session: ReentrantMutex::new(RefCell::new(None)),
            sync_on_commit,
            transaction_timeout,
        })
    }

    pub(crate) fn tables(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read()
    }

    /// Expiry timestamp for a transaction touched now.
    pub(crate) fn transaction_expiry_ms(&self) -> u64 {
        now_ms() + self.transaction_timeout.as_millis() as u64
    }

    /// Runs `f` with a write handle, publishing its staged records as one
    /// atomic frame when the outermost call returns `Ok`.
    ///
    /// Reentrant: calling `batch` from inside a batch closure on the same
    /// thread joins the open session, and the records publish together
    /// when the outermost call completes. Other threads block until then.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error, in which case nothing is published,
    /// or an I/O error from writing the frame.
    pub fn batch<T>(
        &self,
        f: impl FnOnce(&mut StorageActions<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let guard = self.session.lock();
        let outermost = guard.borrow().is_none();
        if outermost {
            *guard.borrow_mut() = Some(SessionState::default());
        }

        let result = {
            let mut actions = StorageActions::new(self, &*guard);
            f(&mut actions)
        };

        if !outermost {
            return result;
        }

        let records = guard
            .borrow_mut()
            .take()
            .map(|state| state.records)
            .unwrap_or_default();
        match result {
            Ok(value) => {
                self.publish(records)?;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    /// Writes a frame and applies it to the tables.
    fn publish(&self, records: Vec<LogRecord>) -> CoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let frame = encode_frame(&records)?;
        self.log.append(&frame)?;
        self.log.flush()?;
        if self.sync_on_commit {
            self.log.sync()?;
        }
        let mut tables = self.tables.write();
        for record in &records {
            tables.apply(record);
        }
        Ok(())
    }

    /// Rewrites the log as a single snapshot frame reproducing the current
    /// tables, dropping all superseded history.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] when called from inside a
    /// batch, or an I/O error.
    pub fn checkpoint(&self) -> CoreResult<()> {
        let guard = self.session.lock();
        if guard.borrow().is_some() {
            return Err(CoreError::invalid_operation(
                "checkpoint cannot run inside a batch",
            ));
        }

        let tables = self.tables.read();
        let mut records = Vec::new();
        for document in tables.documents.values() {
            records.push(LogRecord::PutDocument {
                document: document.clone(),
            });
        }
        for (tx, entry) in &tables.transactions {
            for (key, shadow) in &entry.shadows {
                match shadow {
                    ShadowWrite::Put(document) => records.push(LogRecord::ShadowPut {
                        tx: *tx,
                        expires_at_ms: entry.expires_at_ms,
                        document: document.clone(),
                    }),
                    ShadowWrite::Delete => records.push(LogRecord::ShadowDelete {
                        tx: *tx,
                        expires_at_ms: entry.expires_at_ms,
                        key: key.clone(),
                    }),
                }
            }
        }
        for (id, task) in &tables.tasks {
            records.push(LogRecord::AddTask {
                id: *id,
                task: task.clone(),
            });
        }
        for ((index, doc_key), results) in &tables.mapped_results {
            records.push(LogRecord::PutMappedResults {
                index: index.clone(),
                doc_key: doc_key.clone(),
                results: results.clone(),
            });
        }
        for (index, stats) in &tables.index_stats {
            records.push(LogRecord::SetIndexStats {
                index: index.clone(),
                stats: *stats,
            });
        }

        let old_len = self.log.len()?;
        let frame = encode_frame(&records)?;
        self.log.rewind(0)?;
        self.log.append(&frame)?;
        self.log.sync()?;
        tracing::info!(
            records = records.len(),
            before = old_len,
            after = frame.len(),
            "log checkpointed"
        );
        Ok(())
    }

    /// Rolls back every transaction whose expiry has passed. Returns how
    /// many were swept.
    ///
    /// # Errors
    ///
    /// Returns an error when the rollback batch fails to publish.
    pub fn sweep_abandoned(&self) -> CoreResult<usize> {
        let expired = self.tables.read().expired_transactions(now_ms());
        if expired.is_empty() {
            return Ok(0);
        }
        let count = expired.len();
        self.batch(|actions| {
            for tx in &expired {
                // A concurrent commit may have raced the sweep.
                match actions.rollback_transaction(*tx) {
                    Ok(()) | Err(CoreError::TransactionNotFound { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        })?;
        tracing::warn!(count, "rolled back abandoned transactions");
        Ok(count)
    }

    /// Returns the last published version of `key`, ignoring shadow
    /// writes.
    #[must_use]
    pub fn get_document(&self, key: &str) -> Option<Document> {
        self.tables.read().documents.get(key).cloned()
    }

    /// Returns every published document key.
    #[must_use]
    pub fn document_keys(&self) -> Vec<String> {
        self.tables.read().documents.keys().cloned().collect()
    }

    /// Number of published documents.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.tables.read().documents.len()
    }

    /// `true` when any pending task targets `index`.
    #[must_use]
    pub fn has_tasks_for(&self, index: &str) -> bool {
        self.tables.read().has_tasks_for(index)
    }

    /// Number of pending tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tables.read().tasks.len()
    }

    /// Returns the oldest pending task whose id is not in flight and whose
    /// index has no in-flight task. Skipping busy indexes keeps batches for
    /// one index executing in submission order while other indexes proceed
    /// in parallel. The caller is expected to execute the task and then
    /// remove it in a batch; delivery is at-least-once.
    #[must_use]
    pub fn claim_task(&self, in_flight: &HashMap<TaskId, String>) -> Option<(TaskId, Task)> {
        self.tables
            .read()
            .tasks
            .iter()
            .find(|(id, task)| {
                !in_flight.contains_key(id)
                    && !in_flight.values().any(|index| index == task.index())
            })
            .map(|(id, task)| (*id, task.clone()))
    }

    /// Persisted counters of `index`.
    #[must_use]
    pub fn index_stats(&self, index: &str) -> IndexingStats {
        self.tables
            .read()
            .index_stats
            .get(index)
            .copied()
            .unwrap_or_default()
    }

    /// Complete reduce input for one group of `index`.
    #[must_use]
    pub fn mapped_results_for(&self, index: &str, reduce_key: &str) -> Vec<MappedResult> {
        self.tables.read().mapped_results_for(index, reduce_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Etag;
    use corvus_storage::MemoryBackend;

    fn open_store() -> RecordStore {
        RecordStore::open(
            Box::new(MemoryBackend::new()),
            false,
            Duration::from_secs(60),
        )
        .unwrap()
    }

    fn put(store: &RecordStore, key: &str, body: &str) -> Etag {
        store
            .batch(|actions| {
                actions.put(
                    Some(key.to_string()),
                    body.as_bytes().to_vec(),
                    serde_json::Map::new(),
                    None,
                    None,
                )
            })
            .unwrap()
            .etag
    }

    #[test]
    fn batch_publishes_on_success() {
        let store = open_store();
        put(&store, "users/1", "{}");
        assert!(store.get_document("users/1").is_some());
    }

    #[test]
    fn failed_batch_publishes_nothing() {
        let store = open_store();
        let result: CoreResult<()> = store.batch(|actions| {
            actions.put(
                Some("users/1".into()),
                b"{}".to_vec(),
                serde_json::Map::new(),
                None,
                None,
            )?;
            Err(CoreError::invalid_operation("boom"))
        });
        assert!(result.is_err());
        assert!(store.get_document("users/1").is_none());
    }

    #[test]
    fn batch_sees_its_own_writes() {
        let store = open_store();
        store
            .batch(|actions| {
                actions.put(
                    Some("users/1".into()),
                    b"{}".to_vec(),
                    serde_json::Map::new(),
                    None,
                    None,
                )?;
                assert!(actions.get("users/1", None).is_some());
                actions.delete("users/1", None, None)?;
                assert!(actions.get("users/1", None).is_none());
                Ok(())
            })
            .unwrap();
        assert!(store.get_document("users/1").is_none());
    }

    #[test]
    fn nested_batch_joins_the_session() {
        let store = open_store();
        store
            .batch(|outer| {
                outer.put(
                    Some("a".into()),
                    b"{}".to_vec(),
                    serde_json::Map::new(),
                    None,
                    None,
                )?;
                store.batch(|inner| {
                    // The outer write is visible before anything published.
                    assert!(inner.get("a", None).is_some());
                    inner.put(
                        Some("b".into()),
                        b"{}".to_vec(),
                        serde_json::Map::new(),
                        None,
                        None,
                    )?;
                    Ok(())
                })?;
                // Nothing published yet.
                assert!(store.get_document("b").is_none());
                Ok(())
            })
            .unwrap();
        assert!(store.get_document("a").is_some());
        assert!(store.get_document("b").is_some());
    }

    #[test]
    fn stale_etag_is_rejected() {
        let store = open_store();
        let first = put(&store, "users/1", "{\"v\":1}");
        let second = store
            .batch(|actions| {
                actions.put(
                    Some("users/1".into()),
                    b"{\"v\":2}".to_vec(),
                    serde_json::Map::new(),
                    Some(first),
                    None,
                )
            })
            .unwrap();
        assert_ne!(second.etag, first);

        let result = store.batch(|actions| {
            actions.put(
                Some("users/1".into()),
                b"{\"v\":3}".to_vec(),
                serde_json::Map::new(),
                Some(first),
                None,
            )
        });
        assert!(matches!(
            result,
            Err(CoreError::ConcurrencyConflict { .. })
        ));
    }

    #[test]
    fn delete_missing_key_is_noop() {
        let store = open_store();
        let existed = store
            .batch(|actions| actions.delete("nope", None, None))
            .unwrap();
        assert!(!existed);
    }

    #[test]
    fn delete_with_stale_etag_is_rejected() {
        let store = open_store();
        put(&store, "users/1", "{}");
        let result = store.batch(|actions| {
            actions.delete("users/1", Some(Etag::generate()), None)
        });
        assert!(matches!(
            result,
            Err(CoreError::ConcurrencyConflict { .. })
        ));
    }

    #[test]
    fn transaction_isolation_and_commit() {
        let store = open_store();
        let tx = TxId::generate();
        store
            .batch(|actions| {
                actions.put(
                    Some("users/1".into()),
                    b"{\"staged\":true}".to_vec(),
                    serde_json::Map::new(),
                    None,
                    Some(tx),
                )
            })
            .unwrap();

        // Outside the transaction the document does not exist yet.
        assert!(store.get_document("users/1").is_none());
        // Inside, the shadow version is visible.
        let visible = store
            .batch(|actions| Ok(actions.get("users/1", Some(tx))))
            .unwrap();
        assert!(visible.is_some());

        let keys = store
            .batch(|actions| actions.commit_transaction(tx))
            .unwrap();
        assert_eq!(keys, vec!["users/1".to_string()]);
        assert!(store.get_document("users/1").is_some());
    }

    #[test]
    fn locked_key_rejects_outside_writers() {
        let store = open_store();
        put(&store, "users/1", "{}");
        let tx = TxId::generate();
        store
            .batch(|actions| {
                actions.put(
                    Some("users/1".into()),
                    b"{\"v\":2}".to_vec(),
                    serde_json::Map::new(),
                    None,
                    Some(tx),
                )
            })
            .unwrap();

        let result = store.batch(|actions| {
            actions.put(
                Some("users/1".into()),
                b"{\"v\":3}".to_vec(),
                serde_json::Map::new(),
                None,
                None,
            )
        });
        assert!(matches!(
            result,
            Err(CoreError::ConcurrencyConflict { .. })
        ));

        // The owning transaction can keep writing.
        store
            .batch(|actions| {
                actions.put(
                    Some("users/1".into()),
                    b"{\"v\":4}".to_vec(),
                    serde_json::Map::new(),
                    None,
                    Some(tx),
                )
            })
            .unwrap();
    }

    #[test]
    fn unpublished_key_staged_in_a_transaction_rejects_outside_writers() {
        let store = open_store();
        let tx = TxId::generate();
        store
            .batch(|actions| {
                actions.put(
                    Some("users/new".into()),
                    b"{\"v\":1}".to_vec(),
                    serde_json::Map::new(),
                    None,
                    Some(tx),
                )
            })
            .unwrap();

        // The key has never been published, but the transaction owns it.
        let result = store.batch(|actions| {
            actions.put(
                Some("users/new".into()),
                b"{\"v\":2}".to_vec(),
                serde_json::Map::new(),
                None,
                None,
            )
        });
        assert!(matches!(
            result,
            Err(CoreError::ConcurrencyConflict { .. })
        ));

        store
            .batch(|actions| actions.commit_transaction(tx))
            .unwrap();
        let published = store.get_document("users/new").unwrap();
        assert_eq!(published.data, b"{\"v\":1}".to_vec());

        // The lock lifts with the transaction.
        put(&store, "users/new", "{\"v\":3}");
    }

    #[test]
    fn rollback_restores_the_published_version() {
        let store = open_store();
        let etag = put(&store, "users/1", "{\"v\":1}");
        let tx = TxId::generate();
        store
            .batch(|actions| {
                actions.put(
                    Some("users/1".into()),
                    b"{\"v\":2}".to_vec(),
                    serde_json::Map::new(),
                    None,
                    Some(tx),
                )
            })
            .unwrap();
        store
            .batch(|actions| actions.rollback_transaction(tx))
            .unwrap();

        let doc = store.get_document("users/1").unwrap();
        assert_eq!(doc.etag, etag);
        assert!(doc.locked_by.is_none());
    }

    #[test]
    fn state_survives_replay() {
        let contents;
        {
            let store = open_store();
            put(&store, "users/1", "{\"v\":1}");
            let tx = TxId::generate();
            store
                .batch(|actions| {
                    actions.put(
                        Some("users/2".into()),
                        b"{}".to_vec(),
                        serde_json::Map::new(),
                        None,
                        Some(tx),
                    )?;
                    actions.add_task(Task::Reindex {
                        index: "byName".into(),
                        keys: vec!["users/1".into()],
                    });
                    Ok(())
                })
                .unwrap();
            contents = store
                .log
                .read_at(0, store.log.len().unwrap() as usize)
                .unwrap();
        }

        let reopened = RecordStore::open(
            Box::new(MemoryBackend::with_data(contents)),
            false,
            Duration::from_secs(60),
        )
        .unwrap();
        assert!(reopened.get_document("users/1").is_some());
        // In-doubt transaction survived: users/2 still unpublished.
        assert!(reopened.get_document("users/2").is_none());
        assert_eq!(reopened.tables.read().transactions.len(), 1);
        assert_eq!(reopened.task_count(), 1);
    }

    #[test]
    fn torn_tail_is_rewound_on_open() {
        let backend = MemoryBackend::new();
        let store =
            RecordStore::open(Box::new(backend), false, Duration::from_secs(60)).unwrap();
        put(&store, "users/1", "{}");
        let good = store
            .log
            .read_at(0, store.log.len().unwrap() as usize)
            .unwrap();

        let mut torn = good.clone();
        torn.extend_from_slice(&good[..good.len() / 2]);
        let reopened = RecordStore::open(
            Box::new(MemoryBackend::with_data(torn)),
            false,
            Duration::from_secs(60),
        )
        .unwrap();
        assert!(reopened.get_document("users/1").is_some());
        assert_eq!(reopened.log.len().unwrap(), good.len() as u64);
    }

    #[test]
    fn checkpoint_preserves_state_and_shrinks_history() {
        let store = open_store();
        for i in 0..10 {
            put(&store, &format!("users/{i}"), "{\"v\":0}");
        }
        // Ten rewrites of the same key pile up history.
        for _ in 0..10 {
            put(&store, "users/0", "{\"v\":1}");
        }
        let before = store.log.len().unwrap();
        store.checkpoint().unwrap();
        let after = store.log.len().unwrap();
        assert!(after < before);

        let contents = store.log.read_at(0, after as usize).unwrap();
        let reopened = RecordStore::open(
            Box::new(MemoryBackend::with_data(contents)),
            false,
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(reopened.document_count(), 10);
    }

    #[test]
    fn sweep_rolls_back_expired_transactions() {
        let store = RecordStore::open(
            Box::new(MemoryBackend::new()),
            false,
            Duration::ZERO,
        )
        .unwrap();
        let tx = TxId::generate();
        store
            .batch(|actions| {
                actions.put(
                    Some("users/1".into()),
                    b"{}".to_vec(),
                    serde_json::Map::new(),
                    None,
                    Some(tx),
                )
            })
            .unwrap();

        assert_eq!(store.sweep_abandoned().unwrap(), 1);
        assert!(store.get_document("users/1").is_none());
        assert!(store.tables.read().transactions.is_empty());
    }

    #[test]
    fn claim_task_skips_in_flight_ids() {
        let store = open_store();
        let (first, second) = store
            .batch(|actions| {
                let a = actions.add_task(Task::Reduce {
                    index: "sales".into(),
                    reduce_key: "emea".into(),
                });
                let b = actions.add_task(Task::Reduce {
                    index: "byName".into(),
                    reduce_key: "x".into(),
                });
                Ok((a, b))
            })
            .unwrap();

        let mut in_flight = HashMap::new();
        in_flight.insert(first, "sales".to_string());
        let (claimed, _) = store.claim_task(&in_flight).unwrap();
        assert_eq!(claimed, second);
    }

    #[test]
    fn claim_task_serializes_one_index() {
        let store = open_store();
        let (first, _, third) = store
            .batch(|actions| {
                let a = actions.add_task(Task::Reindex {
                    index: "sales".into(),
                    keys: vec!["orders/1".into()],
                });
                let b = actions.add_task(Task::Reindex {
                    index: "sales".into(),
                    keys: vec!["orders/2".into()],
                });
                let c = actions.add_task(Task::Remove {
                    index: "byName".into(),
                    keys: vec!["users/1".into()],
                });
                Ok((a, b, c))
            })
            .unwrap();

        // While the first sales task runs, the second must wait for it
        // even though it is older than the byName task.
        let mut in_flight = HashMap::new();
        in_flight.insert(first, "sales".to_string());
        let (claimed, task) = store.claim_task(&in_flight).unwrap();
        assert_eq!(claimed, third);
        assert_eq!(task.index(), "byName");

        in_flight.insert(third, "byName".to_string());
        assert!(store.claim_task(&in_flight).is_none());
    }

    #[test]
    fn stats_accumulate_through_the_log() {
        let store = open_store();
        store
            .batch(|actions| {
                actions.bump_index_stats(
                    "byName",
                    IndexingStats {
                        attempts: 3,
                        successes: 2,
                        failures: 1,
                    },
                );
                Ok(())
            })
            .unwrap();
        store
            .batch(|actions| {
                actions.bump_index_stats(
                    "byName",
                    IndexingStats {
                        attempts: 1,
                        successes: 1,
                        failures: 0,
                    },
                );
                Ok(())
            })
            .unwrap();
        let stats = store.index_stats("byName");
        assert_eq!(stats.attempts, 4);
        assert_eq!(stats.successes, 3);
        assert_eq!(stats.failures, 1);
    }
}

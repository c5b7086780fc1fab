//! Batch-scoped storage actions.
//!
//! All writes go through a [`StorageActions`] handle inside a
//! [`crate::store::RecordStore::batch`] call. Actions stage log records in
//! the session instead of touching the shared tables; reads consult the
//! staged overlay first so a batch observes its own writes. Nothing is
//! published until the outermost batch closure returns `Ok` and the frame
//! is on disk.

use crate::document::{Document, PutResult};
use crate::error::{CoreError, CoreResult};
use crate::stats::IndexingStats;
use crate::store::record::{LogRecord, MappedResult};
use crate::store::tables::{ShadowWrite, Tables, TxRecord};
use crate::store::{RecordStore, SessionState};
use crate::tasks::Task;
use crate::types::{Etag, TaskId, TxId};
use parking_lot::RwLockReadGuard;
use std::cell::RefCell;
use std::collections::HashMap;
use uuid::Uuid;

/// Uncommitted effects of the current batch, layered over the shared
/// tables. `None` values are tombstones.
#[derive(Debug, Default)]
pub(crate) struct Overlay {
    documents: HashMap<String, Option<Document>>,
    transactions: HashMap<TxId, Option<TxRecord>>,
    tasks: HashMap<TaskId, Option<Task>>,
    mapped_results: HashMap<(String, String), Option<Vec<MappedResult>>>,
    index_stats: HashMap<String, IndexingStats>,
    next_task_id: Option<TaskId>,
}

impl Overlay {
    fn document<'a>(&'a self, base: &'a Tables, key: &str) -> Option<&'a Document> {
        match self.documents.get(key) {
            Some(slot) => slot.as_ref(),
            None => base.documents.get(key),
        }
    }

    fn transaction<'a>(&'a self, base: &'a Tables, tx: TxId) -> Option<&'a TxRecord> {
        match self.transactions.get(&tx) {
            Some(slot) => slot.as_ref(),
            None => base.transactions.get(&tx),
        }
    }

    fn next_task_id(&self, base: &Tables) -> TaskId {
        self.next_task_id.unwrap_or(base.next_task_id)
    }

    /// Transaction holding a shadow write on `key`, if any. Covers keys
    /// that were never published and so carry no `locked_by` stamp.
    fn shadow_owner(&self, base: &Tables, key: &str) -> Option<TxId> {
        for (tx, slot) in &self.transactions {
            if let Some(entry) = slot {
                if entry.shadows.contains_key(key) {
                    return Some(*tx);
                }
            }
        }
        base.transactions
            .iter()
            .find(|(tx, entry)| {
                !self.transactions.contains_key(tx) && entry.shadows.contains_key(key)
            })
            .map(|(tx, _)| *tx)
    }

    fn index_stats(&self, base: &Tables, index: &str) -> IndexingStats {
        self.index_stats
            .get(index)
            .or_else(|| base.index_stats.get(index))
            .copied()
            .unwrap_or_default()
    }

    /// Mirrors [`Tables::apply`] onto the overlay so batch-local reads see
    /// staged records.
    fn apply(&mut self, base: &Tables, record: &LogRecord) {
        match record {
            LogRecord::PutDocument { document } => {
                self.documents
                    .insert(document.key.clone(), Some(document.clone()));
            }

            LogRecord::DeleteDocument { key } => {
                self.documents.insert(key.clone(), None);
            }

            LogRecord::ShadowPut {
                tx,
                expires_at_ms,
                document,
            } => {
                let mut entry = self.transaction(base, *tx).cloned().unwrap_or_default();
                entry.expires_at_ms = *expires_at_ms;
                entry
                    .shadows
                    .insert(document.key.clone(), ShadowWrite::Put(document.clone()));
                self.transactions.insert(*tx, Some(entry));
                if let Some(published) = self.document(base, &document.key).cloned() {
                    let mut locked = published;
                    locked.locked_by = Some(*tx);
                    self.documents.insert(document.key.clone(), Some(locked));
                }
            }

            LogRecord::ShadowDelete {
                tx,
                expires_at_ms,
                key,
            } => {
                let mut entry = self.transaction(base, *tx).cloned().unwrap_or_default();
                entry.expires_at_ms = *expires_at_ms;
                entry.shadows.insert(key.clone(), ShadowWrite::Delete);
                self.transactions.insert(*tx, Some(entry));
                if let Some(published) = self.document(base, key).cloned() {
                    let mut locked = published;
                    locked.locked_by = Some(*tx);
                    self.documents.insert(key.clone(), Some(locked));
                }
            }

            LogRecord::CommitTransaction { tx } => {
                if let Some(entry) = self.transaction(base, *tx).cloned() {
                    for (key, shadow) in entry.shadows {
                        match shadow {
                            ShadowWrite::Put(mut document) => {
                                document.locked_by = None;
                                self.documents.insert(key, Some(document));
                            }
                            ShadowWrite::Delete => {
                                self.documents.insert(key, None);
                            }
                        }
                    }
                }
                self.transactions.insert(*tx, None);
            }

            LogRecord::RollbackTransaction { tx } => {
                if let Some(entry) = self.transaction(base, *tx).cloned() {
                    for key in entry.shadows.keys() {
                        if let Some(published) = self.document(base, key).cloned() {
                            if published.locked_by == Some(*tx) {
                                let mut unlocked = published;
                                unlocked.locked_by = None;
                                self.documents.insert(key.clone(), Some(unlocked));
                            }
                        }
                    }
                }
                self.transactions.insert(*tx, None);
            }

            LogRecord::AddTask { id, task } => {
                self.tasks.insert(*id, Some(task.clone()));
                if *id >= self.next_task_id(base) {
                    self.next_task_id = Some(id.next());
                }
            }

            LogRecord::RemoveTask { id } => {
                self.tasks.insert(*id, None);
            }

            LogRecord::PutMappedResults {
                index,
                doc_key,
                results,
            } => {
                self.mapped_results
                    .insert((index.clone(), doc_key.clone()), Some(results.clone()));
            }

            LogRecord::DeleteMappedResults { index, doc_key } => {
                self.mapped_results
                    .insert((index.clone(), doc_key.clone()), None);
            }

            LogRecord::SetIndexStats { index, stats } => {
                self.index_stats.insert(index.clone(), *stats);
            }

            LogRecord::PurgeIndex { index } => {
                for key in base.mapped_results.keys() {
                    if key.0 == *index {
                        self.mapped_results.insert(key.clone(), None);
                    }
                }
                for (key, slot) in self.mapped_results.iter_mut() {
                    if key.0 == *index {
                        *slot = None;
                    }
                }
                self.index_stats.insert(index.clone(), IndexingStats::default());
                for (id, task) in &base.tasks {
                    if task.index() == index {
                        self.tasks.insert(*id, None);
                    }
                }
                for slot in self.tasks.values_mut() {
                    if slot.as_ref().is_some_and(|task| task.index() == index) {
                        *slot = None;
                    }
                }
            }
        }
    }
}

/// Write handle passed to batch closures.
pub struct StorageActions<'a> {
    store: &'a RecordStore,
    session: &'a RefCell<Option<SessionState>>,
}

impl<'a> StorageActions<'a> {
    pub(crate) fn new(store: &'a RecordStore, session: &'a RefCell<Option<SessionState>>) -> Self {
        Self { store, session }
    }

    fn tables(&self) -> RwLockReadGuard<'_, Tables> {
        self.store.tables()
    }

    /// Stages a record and mirrors it onto the overlay.
    fn push(&mut self, record: LogRecord) {
        let tables = self.store.tables();
        let mut slot = self.session.borrow_mut();
        if let Some(state) = slot.as_mut() {
            state.overlay.apply(&tables, &record);
            state.records.push(record);
        }
    }

    fn with_overlay<T>(&self, f: impl FnOnce(&Overlay, &Tables) -> T) -> T {
        let tables = self.tables();
        let slot = self.session.borrow();
        match slot.as_ref() {
            Some(state) => f(&state.overlay, &tables),
            None => f(&Overlay::default(), &tables),
        }
    }

    /// Reads the version of `key` visible to `tx`.
    ///
    /// A transaction sees its own shadow writes; everyone else sees the
    /// last published version, even while another transaction holds a
    /// shadow write on the key.
    #[must_use]
    pub fn get(&self, key: &str, tx: Option<TxId>) -> Option<Document> {
        self.with_overlay(|overlay, tables| {
            if let Some(tx) = tx {
                if let Some(entry) = overlay.transaction(tables, tx) {
                    match entry.shadows.get(key) {
                        Some(ShadowWrite::Put(document)) => return Some(document.clone()),
                        Some(ShadowWrite::Delete) => return None,
                        None => {}
                    }
                }
            }
            overlay.document(tables, key).cloned()
        })
    }

    /// Stores a document, optionally inside a transaction.
    ///
    /// A `None` key generates one. When `expected_etag` is given the write
    /// only succeeds if it matches the version visible to the caller;
    /// `None` writes unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConcurrencyConflict`] on an etag mismatch or
    /// when another transaction holds a shadow write on the key.
    pub fn put(
        &mut self,
        key: Option<String>,
        data: Vec<u8>,
        metadata: serde_json::Map<String, serde_json::Value>,
        expected_etag: Option<Etag>,
        tx: Option<TxId>,
    ) -> CoreResult<PutResult> {
        let key = key.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.check_write(&key, expected_etag, tx)?;

        let document = Document::new(key.clone(), data, metadata);
        let etag = document.etag;
        match tx {
            Some(tx) => self.push(LogRecord::ShadowPut {
                tx,
                expires_at_ms: self.store.transaction_expiry_ms(),
                document,
            }),
            None => self.push(LogRecord::PutDocument { document }),
        }
        Ok(PutResult { key, etag })
    }

    /// Deletes a document, optionally inside a transaction. Deleting a
    /// missing key without an expected etag is a no-op returning `false`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConcurrencyConflict`] on an etag mismatch or
    /// when another transaction holds a shadow write on the key.
    pub fn delete(
        &mut self,
        key: &str,
        expected_etag: Option<Etag>,
        tx: Option<TxId>,
    ) -> CoreResult<bool> {
        self.check_write(key, expected_etag, tx)?;
        if self.get(key, tx).is_none() {
            return Ok(false);
        }

        match tx {
            Some(tx) => self.push(LogRecord::ShadowDelete {
                tx,
                expires_at_ms: self.store.transaction_expiry_ms(),
                key: key.to_string(),
            }),
            None => self.push(LogRecord::DeleteDocument {
                key: key.to_string(),
            }),
        }
        Ok(true)
    }

    /// Rejects the write when the key is locked by another transaction or
    /// the expected etag no longer matches the visible version.
    fn check_write(
        &self,
        key: &str,
        expected_etag: Option<Etag>,
        tx: Option<TxId>,
    ) -> CoreResult<()> {
        let (published_etag, owner) = self.with_overlay(|overlay, tables| {
            let published = overlay.document(tables, key);
            let owner = published
                .and_then(|current| current.locked_by)
                .or_else(|| overlay.shadow_owner(tables, key));
            (published.map(|current| current.etag), owner)
        });
        if let Some(owner) = owner {
            if tx != Some(owner) {
                return Err(CoreError::ConcurrencyConflict {
                    key: key.to_string(),
                    expected: expected_etag,
                    actual: published_etag,
                });
            }
        }

        if let Some(expected) = expected_etag {
            let visible = self.get(key, tx);
            let actual = visible.map(|document| document.etag);
            if actual != Some(expected) {
                return Err(CoreError::ConcurrencyConflict {
                    key: key.to_string(),
                    expected: Some(expected),
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Publishes every shadow write of `tx` and returns the touched keys.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionNotFound`] when the transaction is
    /// unknown, already committed, or already rolled back.
    pub fn commit_transaction(&mut self, tx: TxId) -> CoreResult<Vec<String>> {
        let keys = self.with_overlay(|overlay, tables| {
            overlay
                .transaction(tables, tx)
                .map(|entry| entry.shadows.keys().cloned().collect::<Vec<_>>())
        });
        let Some(keys) = keys else {
            return Err(CoreError::TransactionNotFound { id: tx.to_string() });
        };
        self.push(LogRecord::CommitTransaction { tx });
        Ok(keys)
    }

    /// Discards every shadow write of `tx`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionNotFound`] when the transaction is
    /// unknown.
    pub fn rollback_transaction(&mut self, tx: TxId) -> CoreResult<()> {
        let exists =
            self.with_overlay(|overlay, tables| overlay.transaction(tables, tx).is_some());
        if !exists {
            return Err(CoreError::TransactionNotFound { id: tx.to_string() });
        }
        self.push(LogRecord::RollbackTransaction { tx });
        Ok(())
    }

    /// Enqueues a background task and returns its ID.
    pub fn add_task(&mut self, task: Task) -> TaskId {
        let id = self.with_overlay(|overlay, tables| overlay.next_task_id(tables));
        self.push(LogRecord::AddTask { id, task });
        id
    }

    /// Removes a completed task from the queue.
    pub fn remove_task(&mut self, id: TaskId) {
        self.push(LogRecord::RemoveTask { id });
    }

    /// Replaces the stored map outputs of `doc_key` in `index`.
    pub fn put_mapped_results(
        &mut self,
        index: &str,
        doc_key: &str,
        results: Vec<MappedResult>,
    ) {
        self.push(LogRecord::PutMappedResults {
            index: index.to_string(),
            doc_key: doc_key.to_string(),
            results,
        });
    }

    /// Drops the stored map outputs of `doc_key` in `index`.
    pub fn delete_mapped_results(&mut self, index: &str, doc_key: &str) {
        self.push(LogRecord::DeleteMappedResults {
            index: index.to_string(),
            doc_key: doc_key.to_string(),
        });
    }

    /// Returns the complete reduce input for one group, overlay included.
    #[must_use]
    pub fn mapped_results_for(&self, index: &str, reduce_key: &str) -> Vec<MappedResult> {
        self.with_overlay(|overlay, tables| {
            let mut out = Vec::new();
            for ((owner, doc_key), results) in &tables.mapped_results {
                if owner != index {
                    continue;
                }
                if overlay
                    .mapped_results
                    .contains_key(&(owner.clone(), doc_key.clone()))
                {
                    continue;
                }
                out.extend(results.iter().filter(|r| r.reduce_key == reduce_key).cloned());
            }
            for ((owner, _), slot) in &overlay.mapped_results {
                if owner != index {
                    continue;
                }
                if let Some(results) = slot {
                    out.extend(results.iter().filter(|r| r.reduce_key == reduce_key).cloned());
                }
            }
            out
        })
    }

    /// Returns the distinct reduce keys currently stored for one document.
    #[must_use]
    pub fn reduce_keys_of(&self, index: &str, doc_key: &str) -> Vec<String> {
        self.with_overlay(|overlay, tables| {
            let slot = (index.to_string(), doc_key.to_string());
            let results = match overlay.mapped_results.get(&slot) {
                Some(Some(results)) => results.clone(),
                Some(None) => Vec::new(),
                None => tables.mapped_results.get(&slot).cloned().unwrap_or_default(),
            };
            let mut keys: Vec<String> = results.into_iter().map(|r| r.reduce_key).collect();
            keys.sort();
            keys.dedup();
            keys
        })
    }

    /// Adds a batch's counters to the persisted stats of `index`.
    pub fn bump_index_stats(&mut self, index: &str, delta: IndexingStats) {
        let mut stats = self.with_overlay(|overlay, tables| overlay.index_stats(tables, index));
        stats.absorb(delta);
        self.push(LogRecord::SetIndexStats {
            index: index.to_string(),
            stats,
        });
    }

    /// Drops every stored trace of `index`.
    pub fn purge_index(&mut self, index: &str) {
        self.push(LogRecord::PurgeIndex {
            index: index.to_string(),
        });
    }

    /// Returns every published document key, overlay included.
    #[must_use]
    pub fn document_keys(&self) -> Vec<String> {
        self.with_overlay(|overlay, tables| {
            let mut keys: Vec<String> = tables
                .documents
                .keys()
                .filter(|key| !overlay.documents.contains_key(*key))
                .cloned()
                .collect();
            for (key, slot) in &overlay.documents {
                if slot.is_some() {
                    keys.push(key.clone());
                }
            }
            keys.sort();
            keys
        })
    }
}

//! Database facade.

use crate::config::Config;
use crate::dir::DatabaseDir;
use crate::document::{Document, PutResult};
use crate::error::{CoreError, CoreResult};
use crate::index::{parse_query, IndexDefinition, IndexingError, QueryExpr, ViewCompiler};
use crate::manifest::Manifest;
use crate::registry::IndexRegistry;
use crate::stats::IndexingStats;
use crate::store::RecordStore;
use crate::tasks::{Task, WorkerPool};
use crate::types::{Etag, TxId};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One page of query results.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// The matching rows (or projections) for the requested page.
    pub results: Vec<Value>,
    /// Total matches in the snapshot that served the query.
    pub total: usize,
    /// `true` when indexing work for this index is still pending, so the
    /// results may not reflect all committed writes.
    pub is_stale: bool,
}

/// The main database handle.
///
/// `Database` ties together the record store, the index registry, and the
/// background workers. Writes are durable when `put` returns; indexes
/// catch up asynchronously and queries report staleness until they have.
///
/// # Opening a Database
///
/// ```rust,ignore
/// use corvus_core::{Database, IndexDefinition};
///
/// let db = Database::open(Path::new("my_database"), compiler)?;
/// let put = db.put(Some("users/1".into()), br#"{"name":"ada"}"#.to_vec(),
///                  Default::default(), None, None)?;
/// db.create_index(IndexDefinition::map_only("byName", "from doc select name"))?;
/// db.wait_for_non_stale("byName", Duration::from_secs(5))?;
/// let page = db.query("byName", "name:ada", 0, 25, &[])?;
/// db.close()?;
/// ```
///
/// # In-Memory Databases
///
/// For testing, use `Database::open_in_memory(compiler)`.
pub struct Database {
    /// Configuration.
    config: Config,
    /// Database directory (holds the lock). None for in-memory databases.
    dir: Option<Arc<DatabaseDir>>,
    /// Database manifest.
    manifest: Manifest,
    /// The record store.
    store: Arc<RecordStore>,
    /// The index registry.
    registry: Arc<IndexRegistry>,
    /// Background workers, present while the database is open.
    workers: Mutex<Option<WorkerPool>>,
    /// Whether the database is open.
    is_open: RwLock<bool>,
}

impl Database {
    /// Opens a database from a directory path with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process has the database locked (`DatabaseLocked`)
    /// - The on-disk schema version is unsupported (`SchemaVersionMismatch`)
    /// - The record log is corrupted
    /// - I/O errors occur
    pub fn open(path: &Path, compiler: Arc<dyn ViewCompiler>) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default(), compiler)
    }

    /// Opens a database from a directory path with custom configuration.
    ///
    /// # Errors
    ///
    /// See [`Database::open`].
    pub fn open_with_config(
        path: &Path,
        config: Config,
        compiler: Arc<dyn ViewCompiler>,
    ) -> CoreResult<Self> {
        use corvus_storage::FileBackend;

        let dir = Arc::new(DatabaseDir::open(path, config.create_if_missing)?);
        if config.error_if_exists && !dir.is_new_database() {
            return Err(CoreError::invalid_operation(format!(
                "database already exists: {}",
                path.display()
            )));
        }

        let manifest = match dir.load_manifest()? {
            Some(manifest) => {
                manifest.check_version()?;
                manifest
            }
            None => {
                let manifest = Manifest::new();
                dir.save_manifest(&manifest)?;
                manifest
            }
        };

        let backend = FileBackend::open(&dir.log_path())?;
        let store = Arc::new(RecordStore::open(
            Box::new(backend),
            config.sync_on_commit,
            config.transaction_timeout,
        )?);
        let registry = Arc::new(IndexRegistry::open(
            compiler,
            Some(Arc::clone(&dir)),
            config.error_log_capacity,
        )?);
        let workers = WorkerPool::start(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.worker_count,
        );

        tracing::info!(
            path = %path.display(),
            database_id = %manifest.database_id,
            indexes = registry.names().len(),
            "database opened"
        );
        Ok(Self {
            config,
            dir: Some(dir),
            manifest,
            store,
            registry,
            workers: Mutex::new(Some(workers)),
            is_open: RwLock::new(true),
        })
    }

    /// Opens an ephemeral database backed by memory. Nothing survives
    /// dropping the handle.
    ///
    /// # Errors
    ///
    /// Returns an error only if the empty store fails to initialize.
    pub fn open_in_memory(compiler: Arc<dyn ViewCompiler>) -> CoreResult<Self> {
        use corvus_storage::MemoryBackend;

        let config = Config::default().sync_on_commit(false);
        let store = Arc::new(RecordStore::open(
            Box::new(MemoryBackend::new()),
            false,
            config.transaction_timeout,
        )?);
        let registry = Arc::new(IndexRegistry::open(
            compiler,
            None,
            config.error_log_capacity,
        )?);
        let workers = WorkerPool::start(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.worker_count,
        );

        Ok(Self {
            config,
            dir: None,
            manifest: Manifest::new(),
            store,
            registry,
            workers: Mutex::new(Some(workers)),
            is_open: RwLock::new(true),
        })
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Returns the last published version of a document.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseClosed`] after `close`.
    pub fn get(&self, key: &str) -> CoreResult<Option<Document>> {
        self.ensure_open()?;
        Ok(self.store.get_document(key))
    }

    /// Returns the version of a document visible to a transaction: its
    /// own staged write if it has one, the published version otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseClosed`] after `close`.
    pub fn get_in_transaction(&self, key: &str, tx: TxId) -> CoreResult<Option<Document>> {
        self.ensure_open()?;
        self.store.batch(|actions| Ok(actions.get(key, Some(tx))))
    }

    /// Stores a document and queues reindexing against every index.
    ///
    /// With a `None` key one is generated. With `expected_etag` the write
    /// succeeds only against that exact version; `None` writes
    /// unconditionally. With `tx` the write is staged until
    /// [`Database::commit`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConcurrencyConflict`] when the etag check
    /// fails or another transaction holds the key.
    pub fn put(
        &self,
        key: Option<String>,
        data: Vec<u8>,
        metadata: serde_json::Map<String, Value>,
        expected_etag: Option<Etag>,
        tx: Option<TxId>,
    ) -> CoreResult<PutResult> {
        self.ensure_open()?;
        let names = self.registry.names();
        let result = self.store.batch(|actions| {
            let result = actions.put(key, data, metadata, expected_etag, tx)?;
            if tx.is_none() {
                for index in &names {
                    actions.add_task(Task::Reindex {
                        index: index.clone(),
                        keys: vec![result.key.clone()],
                    });
                }
            }
            Ok(result)
        })?;
        self.notify_workers();
        Ok(result)
    }

    /// Deletes a document and queues its removal from every index.
    /// Returns `false` when the key did not exist.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConcurrencyConflict`] when the etag check
    /// fails or another transaction holds the key.
    pub fn delete(
        &self,
        key: &str,
        expected_etag: Option<Etag>,
        tx: Option<TxId>,
    ) -> CoreResult<bool> {
        self.ensure_open()?;
        let names = self.registry.names();
        let existed = self.store.batch(|actions| {
            let existed = actions.delete(key, expected_etag, tx)?;
            if existed && tx.is_none() {
                for index in &names {
                    actions.add_task(Task::Remove {
                        index: index.clone(),
                        keys: vec![key.to_string()],
                    });
                }
            }
            Ok(existed)
        })?;
        self.notify_workers();
        Ok(existed)
    }

    /// Number of published documents.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseClosed`] after `close`.
    pub fn document_count(&self) -> CoreResult<usize> {
        self.ensure_open()?;
        Ok(self.store.document_count())
    }

    /// Number of background tasks not yet completed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseClosed`] after `close`.
    pub fn pending_task_count(&self) -> CoreResult<usize> {
        self.ensure_open()?;
        Ok(self.store.task_count())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Publishes every staged write of a transaction atomically and
    /// queues reindexing for the touched keys.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionNotFound`] for an unknown, expired,
    /// or already finished transaction.
    pub fn commit(&self, tx: TxId) -> CoreResult<()> {
        self.ensure_open()?;
        let names = self.registry.names();
        self.store.batch(|actions| {
            let keys = actions.commit_transaction(tx)?;
            // A reindex observes deletions too: missing keys are removed
            // from the index instead of remapped.
            for index in &names {
                actions.add_task(Task::Reindex {
                    index: index.clone(),
                    keys: keys.clone(),
                });
            }
            Ok(())
        })?;
        self.notify_workers();
        Ok(())
    }

    /// Discards every staged write of a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionNotFound`] for an unknown
    /// transaction.
    pub fn rollback(&self, tx: TxId) -> CoreResult<()> {
        self.ensure_open()?;
        self.store
            .batch(|actions| actions.rollback_transaction(tx))
    }

    // ========================================================================
    // Indexes
    // ========================================================================

    /// Registers an index and queues a full rebuild over the existing
    /// documents. An existing index of the same name is replaced, since
    /// definitions are immutable once created.
    ///
    /// # Errors
    ///
    /// Returns the compiler's error for a rejected definition; the prior
    /// index, if any, is untouched in that case.
    pub fn create_index(&self, definition: IndexDefinition) -> CoreResult<()> {
        self.ensure_open()?;
        let index = self.registry.create(&self.store, definition)?;
        let keys = self.store.document_keys();
        if !keys.is_empty() {
            self.store.batch(|actions| {
                actions.add_task(Task::Reindex {
                    index: index.name().to_string(),
                    keys,
                });
                Ok(())
            })?;
        }
        self.notify_workers();
        Ok(())
    }

    /// Deletes an index, its snapshots, and its stored state. Unknown
    /// names are a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error when removing index files fails.
    pub fn delete_index(&self, name: &str) -> CoreResult<()> {
        self.ensure_open()?;
        self.registry.delete(&self.store, name)
    }

    /// Registered index names, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseClosed`] after `close`.
    pub fn index_names(&self) -> CoreResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self.registry.names())
    }

    /// Runs a query against an index's current snapshot.
    ///
    /// An empty query browses every row. `start` and `page_size` page
    /// through matches; `fields` projects each result down to the named
    /// fields when non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexDoesNotExist`] for an unknown index and
    /// [`CoreError::InvalidQuery`] for an unparseable query.
    pub fn query(
        &self,
        index: &str,
        query: &str,
        start: usize,
        page_size: usize,
        fields: &[String],
    ) -> CoreResult<QueryResult> {
        self.ensure_open()?;
        let index = self.registry.for_query(index)?;
        let expr = if query.trim().is_empty() {
            QueryExpr::All
        } else {
            parse_query(query)?
        };
        let (results, total) = index.search(&expr, start, page_size, fields);
        let is_stale = index.is_indexing() || self.store.has_tasks_for(index.name());
        Ok(QueryResult {
            results,
            total,
            is_stale,
        })
    }

    /// Persisted indexing counters of an index.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexDoesNotExist`] for an unknown index.
    pub fn index_stats(&self, name: &str) -> CoreResult<IndexingStats> {
        self.ensure_open()?;
        self.registry.for_query(name)?;
        Ok(self.store.index_stats(name))
    }

    /// Recent view failures of an index, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexDoesNotExist`] for an unknown index.
    pub fn indexing_errors(&self, name: &str) -> CoreResult<Vec<IndexingError>> {
        self.ensure_open()?;
        Ok(self.registry.for_query(name)?.recent_errors())
    }

    /// Blocks until an index has caught up with all committed writes, or
    /// the timeout passes. Returns `true` when the index is fresh.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexDoesNotExist`] for an unknown index.
    pub fn wait_for_non_stale(&self, name: &str, timeout: Duration) -> CoreResult<bool> {
        self.ensure_open()?;
        let index = self.registry.for_query(name)?;
        let deadline = Instant::now() + timeout;
        loop {
            if !index.is_indexing() && !self.store.has_tasks_for(index.name()) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            self.notify_workers();
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Compacts the record log into a single snapshot frame.
    ///
    /// # Errors
    ///
    /// Returns an error when rewriting the log fails.
    pub fn checkpoint(&self) -> CoreResult<()> {
        self.ensure_open()?;
        self.store.checkpoint()
    }

    /// Closes the database: stops the workers, compacts the log, and
    /// releases the directory lock. Safe to call twice.
    ///
    /// # Errors
    ///
    /// Returns an error when the final checkpoint or manifest save fails.
    pub fn close(&self) -> CoreResult<()> {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return Ok(());
        }

        if let Some(mut workers) = self.workers.lock().take() {
            workers.stop();
        }
        self.store.checkpoint()?;
        if let Some(ref dir) = self.dir {
            dir.save_manifest(&self.manifest)?;
        }

        *is_open = false;
        tracing::info!(database_id = %self.manifest.database_id, "database closed");
        Ok(())
    }

    /// Returns `true` while the database accepts operations.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    /// Returns the database configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }

    fn notify_workers(&self) {
        if let Some(workers) = self.workers.lock().as_ref() {
            workers.notify();
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("database_id", &self.manifest.database_id)
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{MapFn, ReduceFn, ViewError, ViewGenerator};
    use serde_json::json;
    use tempfile::tempdir;

    /// Test compiler. The map source names a field each document must
    /// carry ("*" accepts everything); a reduce source of "sum" totals the
    /// `amount` field per group.
    struct FieldCompiler;

    impl ViewCompiler for FieldCompiler {
        fn compile(&self, definition: &IndexDefinition) -> CoreResult<ViewGenerator> {
            let required = definition.map.clone();
            let map: MapFn = Arc::new(move |value| {
                if required != "*" && value.get(&required).is_none() {
                    return Err(ViewError::new(format!("missing field {required}")));
                }
                Ok(vec![value.clone()])
            });
            let reduce: Option<ReduceFn> = definition.reduce.as_ref().map(|_| {
                let f: ReduceFn = Arc::new(|key: &str, values: &[Value]| {
                    let total: i64 = values
                        .iter()
                        .filter_map(|v| v.get("amount").and_then(Value::as_i64))
                        .sum();
                    Ok(json!({ "region": key, "total": total }))
                });
                f
            });
            Ok(ViewGenerator { map, reduce })
        }
    }

    fn create_db() -> Database {
        Database::open_in_memory(Arc::new(FieldCompiler)).unwrap()
    }

    fn put_json(db: &Database, key: &str, body: Value) -> PutResult {
        db.put(
            Some(key.to_string()),
            serde_json::to_vec(&body).unwrap(),
            serde_json::Map::new(),
            None,
            None,
        )
        .unwrap()
    }

    const WAIT: Duration = Duration::from_secs(10);

    #[test]
    fn put_get_delete_round_trip() {
        let db = create_db();
        let put = put_json(&db, "users/1", json!({"name": "alice"}));
        assert_eq!(put.key, "users/1");

        let doc = db.get("users/1").unwrap().unwrap();
        assert_eq!(doc.etag, put.etag);

        assert!(db.delete("users/1", None, None).unwrap());
        assert!(db.get("users/1").unwrap().is_none());
        assert!(!db.delete("users/1", None, None).unwrap());
    }

    #[test]
    fn missing_key_is_generated() {
        let db = create_db();
        let put = db
            .put(None, b"{}".to_vec(), serde_json::Map::new(), None, None)
            .unwrap();
        assert!(!put.key.is_empty());
        assert!(db.get(&put.key).unwrap().is_some());
    }

    #[test]
    fn stale_etag_conflicts() {
        let db = create_db();
        let first = put_json(&db, "users/1", json!({"v": 1}));
        put_json(&db, "users/1", json!({"v": 2}));

        let result = db.put(
            Some("users/1".into()),
            b"{\"v\":3}".to_vec(),
            serde_json::Map::new(),
            Some(first.etag),
            None,
        );
        assert!(matches!(&result, Err(CoreError::ConcurrencyConflict { .. })));
        assert!(result.unwrap_err().is_conflict());
    }

    #[test]
    fn closed_database_rejects_operations() {
        let db = create_db();
        db.close().unwrap();
        assert!(!db.is_open());
        assert!(matches!(db.get("k"), Err(CoreError::DatabaseClosed)));
        assert!(matches!(
            db.document_count(),
            Err(CoreError::DatabaseClosed)
        ));
        // Closing again is a no-op.
        db.close().unwrap();
    }

    #[test]
    fn index_lifecycle() {
        let db = create_db();
        db.create_index(IndexDefinition::map_only("byName", "*"))
            .unwrap();
        assert_eq!(db.index_names().unwrap(), vec!["byName".to_string()]);

        // Creating the same name again replaces the definition.
        db.create_index(IndexDefinition::map_reduce("byName", "amount", "sum", "region"))
            .unwrap();
        assert_eq!(db.index_names().unwrap(), vec!["byName".to_string()]);

        db.delete_index("byName").unwrap();
        assert!(db.index_names().unwrap().is_empty());
        assert!(matches!(
            db.query("byName", "name:a", 0, 10, &[]),
            Err(CoreError::IndexDoesNotExist { .. })
        ));
    }

    #[test]
    fn writes_flow_into_the_index() {
        let db = create_db();
        db.create_index(IndexDefinition::map_only("byName", "*"))
            .unwrap();
        put_json(&db, "users/1", json!({"name": "alice"}));
        put_json(&db, "users/2", json!({"name": "bob"}));
        assert!(db.wait_for_non_stale("byName", WAIT).unwrap());

        let page = db.query("byName", "name:alice", 0, 10, &[]).unwrap();
        assert_eq!(page.total, 1);
        assert!(!page.is_stale);
        assert_eq!(page.results[0]["name"], json!("alice"));

        db.delete("users/1", None, None).unwrap();
        assert!(db.wait_for_non_stale("byName", WAIT).unwrap());
        assert_eq!(db.query("byName", "name:alice", 0, 10, &[]).unwrap().total, 0);
    }

    #[test]
    fn index_created_late_rebuilds_over_existing_documents() {
        let db = create_db();
        put_json(&db, "users/1", json!({"name": "alice"}));
        put_json(&db, "users/2", json!({"name": "bob"}));

        db.create_index(IndexDefinition::map_only("byName", "*"))
            .unwrap();
        assert!(db.wait_for_non_stale("byName", WAIT).unwrap());
        assert_eq!(db.query("byName", "name:bob", 0, 10, &[]).unwrap().total, 1);
    }

    #[test]
    fn transaction_isolation_through_the_facade() {
        let db = create_db();
        db.create_index(IndexDefinition::map_only("byName", "*"))
            .unwrap();
        let tx = TxId::generate();
        db.put(
            Some("users/1".into()),
            serde_json::to_vec(&json!({"name": "alice"})).unwrap(),
            serde_json::Map::new(),
            None,
            Some(tx),
        )
        .unwrap();

        assert!(db.get("users/1").unwrap().is_none());
        assert!(db.get_in_transaction("users/1", tx).unwrap().is_some());
        assert_eq!(db.query("byName", "name:alice", 0, 10, &[]).unwrap().total, 0);

        db.commit(tx).unwrap();
        assert!(db.get("users/1").unwrap().is_some());
        assert!(db.wait_for_non_stale("byName", WAIT).unwrap());
        assert_eq!(db.query("byName", "name:alice", 0, 10, &[]).unwrap().total, 1);
    }

    #[test]
    fn rollback_discards_staged_writes() {
        let db = create_db();
        let tx = TxId::generate();
        db.put(
            Some("users/1".into()),
            b"{}".to_vec(),
            serde_json::Map::new(),
            None,
            Some(tx),
        )
        .unwrap();
        db.rollback(tx).unwrap();
        assert!(db.get("users/1").unwrap().is_none());
        assert!(matches!(
            db.commit(tx),
            Err(CoreError::TransactionNotFound { .. })
        ));
    }

    #[test]
    fn map_reduce_totals_per_group() {
        let db = create_db();
        db.create_index(IndexDefinition::map_reduce(
            "salesByRegion",
            "amount",
            "sum",
            "region",
        ))
        .unwrap();
        put_json(&db, "sales/1", json!({"region": "emea", "amount": 1}));
        put_json(&db, "sales/2", json!({"region": "emea", "amount": 2}));
        put_json(&db, "sales/3", json!({"region": "apac", "amount": 5}));
        assert!(db.wait_for_non_stale("salesByRegion", WAIT).unwrap());

        let page = db
            .query("salesByRegion", "region:emea", 0, 10, &[])
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.results[0]["total"], json!(3));

        // Moving a document between groups updates both aggregates.
        put_json(&db, "sales/3", json!({"region": "emea", "amount": 5}));
        assert!(db.wait_for_non_stale("salesByRegion", WAIT).unwrap());
        assert_eq!(
            db.query("salesByRegion", "region:emea", 0, 10, &[])
                .unwrap()
                .results[0]["total"],
            json!(8)
        );
        assert_eq!(
            db.query("salesByRegion", "region:apac", 0, 10, &[])
                .unwrap()
                .total,
            0
        );
    }

    #[test]
    fn bad_documents_are_isolated() {
        let db = create_db();
        db.create_index(IndexDefinition::map_only("byName", "name"))
            .unwrap();
        put_json(&db, "users/1", json!({"name": "alice"}));
        put_json(&db, "users/2", json!({"nickname": "no name here"}));
        put_json(&db, "users/3", json!({"name": "carol"}));
        assert!(db.wait_for_non_stale("byName", WAIT).unwrap());

        let page = db.query("byName", "NOT name:nobody", 0, 10, &[]).unwrap();
        assert_eq!(page.total, 2);

        let stats = db.index_stats("byName").unwrap();
        assert!(stats.failures >= 1);
        assert!(stats.successes >= 2);
        let errors = db.indexing_errors("byName").unwrap();
        assert!(errors.iter().any(|e| e.doc_key == "users/2"));
    }

    #[test]
    fn query_projection_and_paging() {
        let db = create_db();
        db.create_index(IndexDefinition::map_only("byKind", "*"))
            .unwrap();
        for i in 0..5 {
            put_json(&db, &format!("item/{i}"), json!({"kind": "tool", "n": i}));
        }
        assert!(db.wait_for_non_stale("byKind", WAIT).unwrap());

        let page = db
            .query("byKind", "kind:tool", 2, 2, &["n".to_string()])
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.results.len(), 2);
        assert!(page.results[0].get("kind").is_none());
        // Results stay addressable: the document key rides along.
        assert!(page.results[0]["__document_id"]
            .as_str()
            .is_some_and(|key| key.starts_with("item/")));
    }

    #[test]
    fn empty_query_browses_everything() {
        let db = create_db();
        db.create_index(IndexDefinition::map_only("byKind", "*"))
            .unwrap();
        for i in 0..3 {
            put_json(&db, &format!("item/{i}"), json!({"n": i}));
        }
        assert!(db.wait_for_non_stale("byKind", WAIT).unwrap());

        let page = db.query("byKind", "  ", 0, 10, &[]).unwrap();
        assert_eq!(page.total, 3);
    }

    #[test]
    fn invalid_query_is_rejected() {
        let db = create_db();
        db.create_index(IndexDefinition::map_only("byName", "*"))
            .unwrap();
        assert!(matches!(
            db.query("byName", "((", 0, 10, &[]),
            Err(CoreError::InvalidQuery { .. })
        ));
    }

    #[test]
    fn directory_database_survives_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db");
        let etag;
        {
            let db = Database::open(&path, Arc::new(FieldCompiler)).unwrap();
            etag = put_json(&db, "users/1", json!({"name": "alice"})).etag;
            db.create_index(IndexDefinition::map_only("byName", "*"))
                .unwrap();
            assert!(db.wait_for_non_stale("byName", WAIT).unwrap());
            db.close().unwrap();
        }

        let db = Database::open(&path, Arc::new(FieldCompiler)).unwrap();
        assert_eq!(db.get("users/1").unwrap().unwrap().etag, etag);
        assert_eq!(db.index_names().unwrap(), vec!["byName".to_string()]);
        // The snapshot reloads from its generation file, no reindex needed.
        assert_eq!(db.query("byName", "name:alice", 0, 10, &[]).unwrap().total, 1);
    }

    #[test]
    fn error_if_exists_rejects_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db");
        Database::open(&path, Arc::new(FieldCompiler)).unwrap();

        let config = Config::default().error_if_exists(true);
        assert!(Database::open_with_config(&path, config, Arc::new(FieldCompiler)).is_err());
    }

    #[test]
    fn second_handle_is_locked_out() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db");
        let _db = Database::open(&path, Arc::new(FieldCompiler)).unwrap();
        assert!(matches!(
            Database::open(&path, Arc::new(FieldCompiler)),
            Err(CoreError::DatabaseLocked)
        ));
    }
}

//! Durable background tasks and the worker pool that drains them.

use crate::document::Document;
use crate::error::CoreResult;
use crate::registry::IndexRegistry;
use crate::store::RecordStore;
use crate::types::TaskId;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A unit of background work, persisted in the record log until a worker
/// completes it.
///
/// Tasks deliver at-least-once: a crash between execution and removal
/// replays the task on the next open. Every task is therefore written to
/// be idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    /// Run the map function of `index` over the named documents.
    Reindex {
        /// Target index.
        index: String,
        /// Keys of documents to (re)map.
        keys: Vec<String>,
    },

    /// Remove the named documents from `index`.
    Remove {
        /// Target index.
        index: String,
        /// Keys of documents to remove.
        keys: Vec<String>,
    },

    /// Recompute the reduction of one group in a map-reduce index.
    Reduce {
        /// Target index.
        index: String,
        /// Group value whose aggregate is stale.
        reduce_key: String,
    },
}

impl Task {
    /// Returns the index this task targets.
    #[must_use]
    pub fn index(&self) -> &str {
        match self {
            Self::Reindex { index, .. } | Self::Remove { index, .. } | Self::Reduce { index, .. } => {
                index
            }
        }
    }
}

/// How long an idle worker sleeps before rechecking the queue. Wake-ups
/// from writers cut this short.
const IDLE_WAIT: Duration = Duration::from_millis(250);

struct PoolShared {
    store: Arc<RecordStore>,
    registry: Arc<IndexRegistry>,
    shutdown: AtomicBool,
    /// Tasks currently being executed, by id and target index. Claiming
    /// consults both so no two workers run tasks for the same index at
    /// once, which would let batches publish out of submission order.
    in_flight: Mutex<HashMap<TaskId, String>>,
    wakeup: Condvar,
}

/// Background threads draining the task queue.
///
/// Tasks execute before their queue record is removed, so a crash in
/// between replays the task: delivery is at-least-once and every task is
/// idempotent. A task that fails stays queued and is retried on a later
/// pass.
pub(crate) struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` workers over the store and registry.
    pub(crate) fn start(
        store: Arc<RecordStore>,
        registry: Arc<IndexRegistry>,
        count: usize,
    ) -> Self {
        let shared = Arc::new(PoolShared {
            store,
            registry,
            shutdown: AtomicBool::new(false),
            in_flight: Mutex::new(HashMap::new()),
            wakeup: Condvar::new(),
        });

        let handles = (0..count.max(1))
            .map(|n| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("corvus-worker-{n}"))
                    .spawn(move || worker_loop(&shared))
                    .unwrap_or_else(|e| panic!("failed to spawn worker thread: {e}"))
            })
            .collect();

        Self { shared, handles }
    }

    /// Wakes idle workers after new tasks were enqueued.
    pub(crate) fn notify(&self) {
        self.shared.wakeup.notify_all();
    }

    /// Stops the workers and waits for them to finish their current task.
    pub(crate) fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_all();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Arc<PoolShared>) {
    while !shared.shutdown.load(Ordering::SeqCst) {
        if let Err(err) = shared.store.sweep_abandoned() {
            tracing::error!(%err, "transaction sweep failed");
        }

        let claimed = {
            let mut in_flight = shared.in_flight.lock();
            match shared.store.claim_task(&in_flight) {
                Some((id, task)) => {
                    in_flight.insert(id, task.index().to_string());
                    Some((id, task))
                }
                None => None,
            }
        };

        match claimed {
            Some((id, task)) => {
                let outcome = execute_task(shared, &task);
                shared.in_flight.lock().remove(&id);
                match outcome {
                    Ok(()) => {
                        if let Err(err) = shared.store.batch(|actions| {
                            actions.remove_task(id);
                            Ok(())
                        }) {
                            tracing::error!(%id, %err, "could not remove finished task");
                        }
                    }
                    Err(err) => {
                        tracing::error!(%id, %err, "task failed, leaving it queued");
                    }
                }
            }
            None => {
                let mut guard = shared.in_flight.lock();
                shared.wakeup.wait_for(&mut guard, IDLE_WAIT);
            }
        }
    }
}

fn execute_task(shared: &Arc<PoolShared>, task: &Task) -> CoreResult<()> {
    match task {
        Task::Reindex { index, keys } => {
            // A key may have been deleted since the task was queued;
            // those become removals.
            let mut documents: Vec<Document> = Vec::new();
            let mut missing: Vec<String> = Vec::new();
            for key in keys {
                match shared.store.get_document(key) {
                    Some(document) => documents.push(document),
                    None => missing.push(key.clone()),
                }
            }
            if !documents.is_empty() {
                shared.registry.index_documents(&shared.store, index, &documents)?;
            }
            if !missing.is_empty() {
                shared.registry.remove_from_index(&shared.store, index, &missing)?;
            }
            Ok(())
        }
        Task::Remove { index, keys } => shared.registry.remove_from_index(&shared.store, index, keys),
        Task::Reduce { index, reduce_key } => shared.registry.reduce(&shared.store, index, reduce_key),
    }
}

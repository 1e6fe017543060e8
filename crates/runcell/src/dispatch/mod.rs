//! Dispatcher: queue, worker pool, and cancellation routing
//!
//! Holds pending submissions in a bounded priority queue and dispatches at
//! most `max_concurrent` of them at a time to long-lived workers. Dispatch
//! is at-most-once per submission id; cancellations remove pending jobs
//! atomically and signal running ones through their cancel flag.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use crate::dispatch::queue::{JobQueue, QueueFullError, QueuedJob};

mod queue;

use crate::cancel::CancelFlag;
use crate::runner::Executor;
use crate::store::SubmissionStore;
use crate::submission::{SubmissionStatus, TerminalOutcome};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    QueueFull(#[from] QueueFullError),
}

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still pending and has been removed without a spawn
    Removed,
    /// The job is running; its cancel flag has been signalled
    Cancelling,
    /// No such submission is known to the dispatcher or the store
    NotFound,
    /// The submission already reached a terminal state
    AlreadyDone,
}

/// Dispatcher counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DispatchStats {
    pub pending: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Queue plus worker pool bounded by `max_concurrent`
pub struct Dispatcher {
    queue: JobQueue,
    work_available: Notify,
    running: Mutex<HashMap<Uuid, CancelFlag>>,
    /// Serializes the queue-to-worker handoff against submit and cancel, so
    /// an id is always visible as either pending or running
    handoff: Mutex<()>,
    /// Cancels for ids the dispatcher no longer tracks but the store still
    /// shows live
    precancelled: Mutex<HashSet<Uuid>>,
    counters: Counters,
    executor: Arc<Executor>,
    store: Arc<dyn SubmissionStore>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        max_queue_size: usize,
        executor: Arc<Executor>,
        store: Arc<dyn SubmissionStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: JobQueue::new(max_queue_size),
            work_available: Notify::new(),
            running: Mutex::new(HashMap::new()),
            handoff: Mutex::new(()),
            precancelled: Mutex::new(HashSet::new()),
            counters: Counters::default(),
            executor,
            store,
            workers: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Spawn the long-lived worker tasks
    pub fn start(self: &Arc<Self>, worker_count: usize) {
        let mut workers = match self.workers.lock() {
            Ok(workers) => workers,
            Err(poisoned) => poisoned.into_inner(),
        };
        for worker_id in 0..worker_count {
            let dispatcher = Arc::clone(self);
            workers.push(tokio::spawn(worker_loop(dispatcher, worker_id)));
        }
        info!(worker_count, "dispatcher workers started");
    }

    /// Enqueue a submission for execution.
    ///
    /// Idempotent on submission id: re-submitting a pending or running id is
    /// a no-op. Returns `QueueFullError` when the backlog is at capacity.
    pub async fn submit(&self, submission_id: Uuid, priority: i32) -> Result<(), DispatchError> {
        let _handoff = self.handoff.lock().await;
        if self.running.lock().await.contains_key(&submission_id) {
            return Ok(());
        }
        let newly_queued = self.queue.push(submission_id, priority).await?;
        if newly_queued {
            debug!(%submission_id, priority, "submission queued");
            self.work_available.notify_one();
        }
        Ok(())
    }

    /// Cancel a submission wherever it currently is
    pub async fn cancel(&self, submission_id: Uuid) -> CancelOutcome {
        let handoff = self.handoff.lock().await;
        if self.queue.remove(submission_id).await {
            drop(handoff);
            // Removed before any process spawn; finalize the record directly
            match self.store.get(submission_id).await {
                Ok(Some(submission)) => {
                    let outcome = TerminalOutcome::status_message(
                        SubmissionStatus::Cancelled,
                        "Execution cancelled",
                    );
                    self.executor.finish(&submission, outcome).await;
                }
                Ok(None) => warn!(%submission_id, "cancelled pending job missing from store"),
                Err(e) => error!(%submission_id, error = %e, "store read failed during cancel"),
            }
            return CancelOutcome::Removed;
        }

        if let Some(flag) = self.running.lock().await.get(&submission_id) {
            flag.cancel();
            return CancelOutcome::Cancelling;
        }
        drop(handoff);

        match self.store.get(submission_id).await {
            Ok(Some(submission)) if submission.is_terminal() => CancelOutcome::AlreadyDone,
            Ok(Some(_)) => {
                // Races the queue-to-worker handoff; the worker picks the
                // flag up before spawning anything
                self.precancelled.lock().await.insert(submission_id);
                CancelOutcome::Cancelling
            }
            _ => CancelOutcome::NotFound,
        }
    }

    /// Current queue and worker counters
    pub async fn stats(&self) -> DispatchStats {
        DispatchStats {
            pending: self.queue.len().await,
            running: self.running.lock().await.len(),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Restart reconciliation against the store.
    ///
    /// Submissions left `running` by a dead engine are marked
    /// `internal_error`; `queued` ones are re-enqueued.
    pub async fn recover(&self) {
        match self.store.list_in_status(SubmissionStatus::Running).await {
            Ok(orphans) => {
                for orphan in orphans {
                    warn!(id = %orphan.id, "reconciling orphaned running submission");
                    let outcome = TerminalOutcome::status_message(
                        SubmissionStatus::InternalError,
                        "engine restart",
                    );
                    self.executor.finish(&orphan, outcome).await;
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => error!(error = %e, "restart reconciliation failed"),
        }

        match self.store.list_in_status(SubmissionStatus::Queued).await {
            Ok(pending) => {
                for submission in pending {
                    if let Err(e) = self.submit(submission.id, submission.priority).await {
                        warn!(id = %submission.id, error = %e, "could not re-enqueue after restart");
                    }
                }
            }
            Err(e) => error!(error = %e, "restart re-enqueue failed"),
        }
    }

    /// Stop all workers. In-flight child processes are killed by their
    /// sandbox guards.
    pub fn shutdown(&self) {
        let mut workers = match self.workers.lock() {
            Ok(workers) => workers,
            Err(poisoned) => poisoned.into_inner(),
        };
        for worker in workers.drain(..) {
            worker.abort();
        }
    }

    async fn take_precancelled(&self, submission_id: Uuid) -> bool {
        self.precancelled.lock().await.remove(&submission_id)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One long-lived worker: pull a job, execute it in a supervised task,
/// account for the result, repeat.
async fn worker_loop(dispatcher: Arc<Dispatcher>, worker_id: usize) {
    loop {
        let flag = CancelFlag::new();
        let job = {
            // Atomic handoff: the id moves from pending to running with no
            // window where submit or cancel can miss it
            let _handoff = dispatcher.handoff.lock().await;
            match dispatcher.queue.pop().await {
                Some(job) => {
                    dispatcher
                        .running
                        .lock()
                        .await
                        .insert(job.submission_id, flag.clone());
                    job
                }
                None => {
                    drop(_handoff);
                    dispatcher.work_available.notified().await;
                    continue;
                }
            }
        };

        let submission_id = job.submission_id;
        debug!(worker_id, %submission_id, "worker picked up job");

        if dispatcher.take_precancelled(submission_id).await {
            flag.cancel();
        }

        // Supervise the execution in its own task so a panic never takes
        // the worker (or its siblings) down
        let executor = Arc::clone(&dispatcher.executor);
        let task_flag = flag.clone();
        let supervised =
            tokio::spawn(async move { executor.execute(submission_id, task_flag).await }).await;

        if let Err(join_error) = supervised {
            if join_error.is_panic() {
                error!(worker_id, %submission_id, "execution panicked; recording internal error");
                let outcome = TerminalOutcome::status_message(
                    SubmissionStatus::InternalError,
                    "execution panicked",
                );
                if let Ok(Some(submission)) = dispatcher.store.get(submission_id).await {
                    dispatcher.executor.finish(&submission, outcome).await;
                }
            }
        }

        dispatcher.running.lock().await.remove(&submission_id);

        match dispatcher.store.get(submission_id).await {
            Ok(Some(record)) if record.status == SubmissionStatus::InternalError => {
                dispatcher.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Some(_)) => {
                dispatcher.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

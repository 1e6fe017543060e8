//! Engine handle
//!
//! Owns the configuration, store, dispatcher, and sandbox backend for one
//! engine instance. Nothing here is a process global, so several engines can
//! coexist in one process (integration tests rely on this).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::info;

use crate::callback::{CallbackEmitter, CallbackError};
use crate::config::Config;
use crate::dispatch::{CancelOutcome, DispatchStats, Dispatcher};
use crate::runner::Executor;
use crate::sandbox::{DirectSandbox, SandboxBackend};
use crate::store::{MemoryStore, StoreError, SubmissionStore};
use crate::submission::{
    render_view, render_view_fields, NewSubmission, StatusEvent, Submission, ViewError,
};

/// Extra wait allowed past the wall clock limit in `submit_wait`
const WAIT_SLACK: Duration = Duration::from_secs(2);

/// Wall clock allowance for the compile phase in `submit_wait`
const WAIT_COMPILE_ALLOWANCE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("language '{0}' is not supported")]
    UnsupportedLanguage(String),

    #[error("source code must not be empty")]
    EmptySource,

    #[error("submission queue is full")]
    QueueFull,

    #[error("submission not found")]
    NotFound,

    #[error("timed out waiting for a terminal state")]
    WaitTimedOut,

    #[error(transparent)]
    View(#[from] ViewError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Callback(#[from] CallbackError),
}

/// Engine-level counters
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineStats {
    pub pending: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub uptime_seconds: u64,
}

/// One engine instance: intake, dispatch, execution, retrieval
pub struct Engine {
    config: Arc<Config>,
    store: Arc<dyn SubmissionStore>,
    dispatcher: Arc<Dispatcher>,
    events: broadcast::Sender<StatusEvent>,
    /// Serializes intake so the queue-full check and the enqueue are atomic
    intake: Mutex<()>,
    started_at: DateTime<Utc>,
}

impl Engine {
    /// Engine with the in-memory store and the direct process sandbox
    pub async fn new(config: Config) -> Result<Self, EngineError> {
        Self::with_parts(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(DirectSandbox::new()),
        )
        .await
    }

    /// Engine over caller-provided store and sandbox backend.
    ///
    /// Performs restart reconciliation against the store before accepting
    /// work: orphaned `running` records become `internal_error`, surviving
    /// `queued` records are re-enqueued.
    pub async fn with_parts(
        config: Config,
        store: Arc<dyn SubmissionStore>,
        backend: Arc<dyn SandboxBackend>,
    ) -> Result<Self, EngineError> {
        let config = Arc::new(config);
        let (events, _) = broadcast::channel(256);
        let callbacks = CallbackEmitter::new(config.callback_timeout_ms)?;

        let executor = Arc::new(Executor::new(
            Arc::clone(&config),
            backend,
            Arc::clone(&store),
            callbacks,
            events.clone(),
        ));
        let dispatcher = Dispatcher::new(config.max_queue_size, executor, Arc::clone(&store));
        dispatcher.recover().await;
        dispatcher.start(config.max_concurrent);

        info!(
            max_concurrent = config.max_concurrent,
            max_queue_size = config.max_queue_size,
            languages = config.languages.len(),
            "engine started"
        );

        Ok(Self {
            config,
            store,
            dispatcher,
            events,
            intake: Mutex::new(()),
            started_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validate and enqueue a submission, returning the queued record.
    ///
    /// Intake faults (unknown language, empty source, queue full) are
    /// returned synchronously and never reach the executor.
    pub async fn submit(&self, new: NewSubmission) -> Result<Submission, EngineError> {
        let language = self
            .config
            .get_language(&new.language_key)
            .map_err(|_| EngineError::UnsupportedLanguage(new.language_key.clone()))?;
        if new.source_code.trim().is_empty() {
            return Err(EngineError::EmptySource);
        }

        let limits = self
            .config
            .effective_limits(language, Some(&new.limit_overrides()));
        let flags = new.execution_flags(self.config.enable_network_default);
        let priority = new.priority;
        let submission = Submission::queued(new, limits, flags);

        let _intake = self.intake.lock().await;
        if self.dispatcher.stats().await.pending >= self.config.max_queue_size {
            return Err(EngineError::QueueFull);
        }
        self.store.insert(submission.clone()).await?;
        self.dispatcher
            .submit(submission.id, priority)
            .await
            .map_err(|_| EngineError::QueueFull)?;

        Ok(submission)
    }

    /// Submit and block until the submission reaches a terminal state.
    ///
    /// The wait is bounded by the submission's wall clock limit plus a small
    /// slack (and a compile allowance for compiled languages).
    pub async fn submit_wait(&self, new: NewSubmission) -> Result<Submission, EngineError> {
        // Subscribe before submitting so the terminal event cannot be missed
        let mut events = self.events.subscribe();
        let submission = self.submit(new).await?;

        let mut deadline = Duration::from_secs_f64(
            submission.limits.wall_time_limit.unwrap_or(60.0),
        ) + WAIT_SLACK;
        let compiled = self
            .config
            .get_language(&submission.language_key)
            .map(|l| l.is_compiled())
            .unwrap_or(false);
        if compiled {
            deadline += WAIT_COMPILE_ALLOWANCE;
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) if event.id == submission.id && event.status.is_terminal() => {
                        return;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Missed events; fall back to checking the store
                        if let Ok(Some(record)) = self.store.get(submission.id).await {
                            if record.is_terminal() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        };

        if tokio::time::timeout(deadline, wait).await.is_err() {
            // One final check in case the terminal write raced the timeout
            if let Some(record) = self.store.get(submission.id).await? {
                if record.is_terminal() {
                    return Ok(record);
                }
            }
            return Err(EngineError::WaitTimedOut);
        }

        self.store
            .get(submission.id)
            .await?
            .ok_or(EngineError::NotFound)
    }

    /// Submit an ordered batch, returning per-item results in order
    pub async fn submit_batch(
        &self,
        batch: Vec<NewSubmission>,
    ) -> Vec<Result<Submission, EngineError>> {
        let mut results = Vec::with_capacity(batch.len());
        for new in batch {
            results.push(self.submit(new).await);
        }
        results
    }

    /// Current record by token, raw
    pub async fn get_record(&self, token: &str) -> Result<Submission, EngineError> {
        self.store
            .get_by_token(token)
            .await?
            .ok_or(EngineError::NotFound)
    }

    /// Current record by token, rendered for a client.
    ///
    /// `fields` projects the named subset; without `base64`, non-text bytes
    /// in a binary-safe field are a [`ViewError::Base64Required`] error.
    pub async fn get(
        &self,
        token: &str,
        base64: bool,
        fields: Option<&[&str]>,
    ) -> Result<Value, EngineError> {
        let submission = self.get_record(token).await?;
        let view = match fields {
            Some(fields) => render_view_fields(&submission, base64, fields)?,
            None => render_view(&submission, base64)?,
        };
        Ok(view)
    }

    /// Batch retrieval for a comma-separated token list; unknown tokens come
    /// back as explicit nulls, in order
    pub async fn get_batch(
        &self,
        tokens: &str,
        base64: bool,
        fields: Option<&[&str]>,
    ) -> Result<Vec<Value>, EngineError> {
        let mut views = Vec::new();
        for token in tokens.split(',').map(str::trim) {
            match self.store.get_by_token(token).await? {
                Some(submission) => {
                    let view = match fields {
                        Some(fields) => render_view_fields(&submission, base64, fields)?,
                        None => render_view(&submission, base64)?,
                    };
                    views.push(view);
                }
                None => views.push(Value::Null),
            }
        }
        Ok(views)
    }

    /// Cancel by token.
    ///
    /// Terminal submissions are returned untouched; there is nothing to
    /// cancel.
    pub async fn cancel(&self, token: &str) -> Result<Submission, EngineError> {
        let submission = self.get_record(token).await?;
        match self.dispatcher.cancel(submission.id).await {
            CancelOutcome::Removed
            | CancelOutcome::Cancelling
            | CancelOutcome::AlreadyDone => self.get_record(token).await,
            CancelOutcome::NotFound => Ok(submission),
        }
    }

    /// Engine counters
    pub async fn stats(&self) -> EngineStats {
        let DispatchStats {
            pending,
            running,
            completed,
            failed,
        } = self.dispatcher.stats().await;
        EngineStats {
            pending,
            running,
            completed,
            failed,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Subscribe to in-process status transition events
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Stop the worker pool
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Worker tasks hold the dispatcher alive; aborting them here breaks
        // the cycle when the engine goes away without an explicit shutdown
        self.dispatcher.shutdown();
    }
}

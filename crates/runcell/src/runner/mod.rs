//! Per-submission execution
//!
//! Drives one submission end-to-end: workspace staging, optional
//! compilation, the run loop, terminal classification, persistence, and the
//! webhook. Every await participates in cancellation; the workspace is
//! removed on every exit path.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, instrument, warn};
use uuid::Uuid;

pub use crate::runner::compile::{compile, CompileResult};
pub use crate::runner::execute::execute_runs;

mod compile;
mod execute;

use crate::callback::CallbackEmitter;
use crate::cancel::CancelFlag;
use crate::config::{Config, Language};
use crate::sandbox::{SandboxBackend, SandboxError, Workspace};
use crate::store::{MarkTerminal, StoreError, SubmissionStore};
use crate::submission::{
    render_view, StatusEvent, Submission, SubmissionStatus, TerminalOutcome,
};
use crate::types::{RunOutcome, Termination};

/// Upper bound on any single store operation; past it the submission is
/// treated as an engine fault
const STORE_TIMEOUT: Duration = Duration::from_secs(10);

/// Executes single submissions against a sandbox backend
pub struct Executor {
    config: Arc<Config>,
    backend: Arc<dyn SandboxBackend>,
    store: Arc<dyn SubmissionStore>,
    callbacks: CallbackEmitter,
    events: broadcast::Sender<StatusEvent>,
}

impl Executor {
    pub fn new(
        config: Arc<Config>,
        backend: Arc<dyn SandboxBackend>,
        store: Arc<dyn SubmissionStore>,
        callbacks: CallbackEmitter,
        events: broadcast::Sender<StatusEvent>,
    ) -> Self {
        Self {
            config,
            backend,
            store,
            callbacks,
            events,
        }
    }

    /// Bound a store operation by [`STORE_TIMEOUT`]
    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(STORE_TIMEOUT, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Backend("store operation timed out".into())),
        }
    }

    fn publish(&self, id: Uuid, token: &str, status: SubmissionStatus) {
        // No receivers is fine; observers subscribe on demand
        let _ = self.events.send(StatusEvent {
            id,
            token: token.to_owned(),
            status,
        });
    }

    /// Execute one submission to its terminal state.
    ///
    /// Engine faults surface as `internal_error` on the record; this method
    /// itself never fails the worker.
    #[instrument(skip(self, cancel), fields(%id))]
    pub async fn execute(&self, id: Uuid, cancel: CancelFlag) {
        let submission = match self.bounded(self.store.get(id)).await {
            Ok(Some(submission)) => submission,
            Ok(None) => {
                warn!("submission vanished before execution");
                return;
            }
            Err(e) => {
                error!(error = %e, "store read failed");
                return;
            }
        };
        if submission.is_terminal() {
            return;
        }

        match self
            .bounded(self.store.set_status(id, SubmissionStatus::Running))
            .await
        {
            Ok(_) => self.publish(id, &submission.token, SubmissionStatus::Running),
            Err(e) => error!(error = %e, "failed to mark submission running"),
        }

        let outcome = if cancel.is_cancelled() {
            cancelled_outcome()
        } else {
            self.run_submission(&submission, &cancel).await
        };

        self.finish(&submission, outcome).await;
    }

    async fn run_submission(
        &self,
        submission: &Submission,
        cancel: &CancelFlag,
    ) -> TerminalOutcome {
        let language = match self.config.get_language(&submission.language_key) {
            Ok(language) => language,
            Err(e) => return internal_error(e.to_string()),
        };

        let mut workspace = match Workspace::create(&self.config.workspace_root()).await {
            Ok(workspace) => workspace,
            Err(e) => return internal_error(format!("workspace preparation failed: {e}")),
        };

        let result = self
            .run_in_workspace(&workspace, language, submission, cancel)
            .await;

        if let Err(e) = workspace.cleanup().await {
            warn!(error = %e, "workspace cleanup failed");
        }

        match result {
            Ok(outcome) => outcome,
            Err(e) => internal_error(e.to_string()),
        }
    }

    async fn run_in_workspace(
        &self,
        workspace: &Workspace,
        language: &Language,
        submission: &Submission,
        cancel: &CancelFlag,
    ) -> Result<TerminalOutcome, SandboxError> {
        let source_name = language.source_name(&submission.source_code);
        workspace
            .write_file(&source_name, submission.source_code.as_bytes())
            .await?;
        if let Some(ref archive) = submission.additional_files {
            workspace.expand_archive(archive).await?;
        }

        if cancel.is_cancelled() {
            return Ok(cancelled_outcome());
        }

        let mut compile_output = None;
        if language.is_compiled() {
            let result = compile::compile(
                self.backend.as_ref(),
                workspace,
                language,
                submission,
                cancel,
            )
            .await?;

            if cancel.is_cancelled() || result.outcome.termination == Termination::Killed {
                return Ok(cancelled_outcome());
            }
            if let Termination::SpawnFailed(ref reason) = result.outcome.termination {
                return Ok(internal_error(format!("compiler failed to start: {reason}")));
            }

            compile_output = Some(result.output.clone());
            if !result.is_success() {
                return Ok(TerminalOutcome {
                    status: Some(SubmissionStatus::CompilationError),
                    compile_output,
                    ..Default::default()
                });
            }
        }

        if cancel.is_cancelled() {
            return Ok(cancelled_outcome());
        }

        let outcome = execute::execute_runs(
            self.backend.as_ref(),
            workspace,
            language,
            submission,
            cancel,
        )
        .await?;

        if cancel.is_cancelled() || outcome.termination == Termination::Killed {
            return Ok(cancelled_outcome());
        }

        Ok(classify_run(outcome, compile_output))
    }

    /// Persist the terminal record, broadcast the transition, and fire the
    /// webhook. Shared with the dispatcher for queue-removal cancellations.
    pub(crate) async fn finish(&self, submission: &Submission, outcome: TerminalOutcome) {
        match self
            .bounded(self.store.mark_terminal(submission.id, outcome))
            .await
        {
            Ok(MarkTerminal::Applied(record)) => {
                self.publish(record.id, &record.token, record.status);
                if let Some(ref url) = record.callback_url {
                    // Non-text outputs force base64 for the webhook payload
                    match render_view(&record, false).or_else(|_| render_view(&record, true)) {
                        Ok(payload) => self.callbacks.emit(url, &payload).await,
                        Err(e) => warn!(error = %e, "failed to render callback payload"),
                    }
                }
            }
            Ok(MarkTerminal::AlreadyTerminal(_)) => {}
            Ok(MarkTerminal::NotFound) => {
                warn!(id = %submission.id, "submission vanished before terminal update");
            }
            Err(e) => {
                error!(id = %submission.id, error = %e, "failed to persist terminal record");
            }
        }
    }
}

fn cancelled_outcome() -> TerminalOutcome {
    TerminalOutcome::status_message(SubmissionStatus::Cancelled, "Execution cancelled")
}

fn internal_error(message: impl Into<String>) -> TerminalOutcome {
    TerminalOutcome::status_message(SubmissionStatus::InternalError, message)
}

/// Map a run outcome to the terminal record fields
fn classify_run(outcome: RunOutcome, compile_output: Option<String>) -> TerminalOutcome {
    let (status, message) = match outcome.termination {
        Termination::CpuLimitExceeded => (
            SubmissionStatus::TimeLimitExceeded,
            Some("CPU time limit exceeded".to_owned()),
        ),
        Termination::WallLimitExceeded => (
            SubmissionStatus::TimeLimitExceeded,
            Some("Wall time limit exceeded".to_owned()),
        ),
        Termination::MemoryLimitExceeded => (SubmissionStatus::MemoryLimitExceeded, None),
        Termination::OutputLimitExceeded => (
            SubmissionStatus::RuntimeError,
            Some("Output size limit exceeded".to_owned()),
        ),
        Termination::Signalled(_) => (SubmissionStatus::RuntimeError, None),
        Termination::Exited(0) => (SubmissionStatus::Accepted, None),
        Termination::Exited(_) => (SubmissionStatus::RuntimeError, None),
        Termination::Killed => (
            SubmissionStatus::Cancelled,
            Some("Execution cancelled".to_owned()),
        ),
        Termination::SpawnFailed(ref reason) => {
            (SubmissionStatus::InternalError, Some(reason.clone()))
        }
    };

    TerminalOutcome {
        status: Some(status),
        stdout: Some(outcome.stdout),
        stderr: Some(outcome.stderr),
        compile_output,
        exit_code: outcome.exit_code,
        exit_signal: outcome.exit_signal,
        time: Some(outcome.cpu_time),
        wall_time: Some(outcome.wall_time),
        memory: Some(outcome.memory),
        message,
    }
}

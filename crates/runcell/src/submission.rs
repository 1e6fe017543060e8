//! Submission records and their client-visible projections.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ExecutionFlags, ResourceLimits};

/// Lifecycle states of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Queued,
    Running,
    Accepted,
    /// Reserved for transport layers that compare against `expected_output`;
    /// the engine never sets it.
    WrongAnswer,
    CompilationError,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    InternalError,
    Cancelled,
}

impl SubmissionStatus {
    /// Whether no further transitions can occur from this status
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubmissionStatus::Queued | SubmissionStatus::Running)
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SubmissionStatus::Queued => "queued",
            SubmissionStatus::Running => "running",
            SubmissionStatus::Accepted => "accepted",
            SubmissionStatus::WrongAnswer => "wrong_answer",
            SubmissionStatus::CompilationError => "compilation_error",
            SubmissionStatus::RuntimeError => "runtime_error",
            SubmissionStatus::TimeLimitExceeded => "time_limit_exceeded",
            SubmissionStatus::MemoryLimitExceeded => "memory_limit_exceeded",
            SubmissionStatus::InternalError => "internal_error",
            SubmissionStatus::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// A submission as received at intake
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSubmission {
    /// Language key resolved against the registry
    #[serde(alias = "language")]
    pub language_key: String,

    /// Program source text
    pub source_code: String,

    /// Standard input for the program (possibly empty)
    #[serde(default)]
    pub stdin: String,

    /// Free-form options appended to the compile command
    #[serde(default)]
    pub compiler_options: Option<String>,

    /// Free-form arguments appended to the run command
    #[serde(default)]
    pub command_line_arguments: Option<String>,

    /// Base64-encoded ZIP expanded into the workspace root
    #[serde(default)]
    pub additional_files: Option<String>,

    // Resource limits (registry defaults apply when absent)
    #[serde(default)]
    pub cpu_time_limit: Option<f64>,
    #[serde(default)]
    pub cpu_extra_time: Option<f64>,
    #[serde(default)]
    pub wall_time_limit: Option<f64>,
    #[serde(default)]
    pub memory_limit: Option<u64>,
    #[serde(default)]
    pub stack_limit: Option<u64>,
    #[serde(default)]
    pub max_processes_and_or_threads: Option<u32>,
    #[serde(default)]
    pub max_file_size: Option<u64>,

    /// Run the program this many times; results come from the last run
    #[serde(default)]
    pub number_of_runs: Option<u32>,

    // Execution flags
    #[serde(default)]
    pub redirect_stderr_to_stdout: Option<bool>,
    #[serde(default)]
    pub enable_network: Option<bool>,
    #[serde(default)]
    pub enable_per_process_and_thread_time_limit: Option<bool>,
    #[serde(default)]
    pub enable_per_process_and_thread_memory_limit: Option<bool>,

    /// Webhook fired once the submission reaches a terminal state
    #[serde(default)]
    pub callback_url: Option<String>,

    /// Expected output, persisted for downstream comparison only
    #[serde(default)]
    pub expected_output: Option<String>,

    /// Dispatch priority; higher dispatches first
    #[serde(default)]
    pub priority: i32,
}

impl NewSubmission {
    /// Per-submission limit overrides, to be layered over registry defaults
    pub fn limit_overrides(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_time_limit: self.cpu_time_limit,
            cpu_extra_time: self.cpu_extra_time,
            wall_time_limit: self.wall_time_limit,
            memory_limit: self.memory_limit,
            stack_limit: self.stack_limit,
            max_processes: self.max_processes_and_or_threads,
            max_file_size: self.max_file_size,
        }
    }

    /// Execution flags, falling back to `enable_network_default` for the
    /// network flag
    pub fn execution_flags(&self, enable_network_default: bool) -> ExecutionFlags {
        let defaults = ExecutionFlags::default();
        ExecutionFlags {
            redirect_stderr_to_stdout: self
                .redirect_stderr_to_stdout
                .unwrap_or(defaults.redirect_stderr_to_stdout),
            enable_network: self.enable_network.unwrap_or(enable_network_default),
            per_process_time_limit: self
                .enable_per_process_and_thread_time_limit
                .unwrap_or(defaults.per_process_time_limit),
            per_process_memory_limit: self
                .enable_per_process_and_thread_memory_limit
                .unwrap_or(defaults.per_process_memory_limit),
        }
    }
}

/// The unit of work tracked by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    /// Stable internal identifier
    pub id: Uuid,

    /// Opaque public handle, unique and never reassigned
    pub token: String,

    pub language_key: String,
    pub source_code: String,
    pub stdin: String,
    pub compiler_options: Option<String>,
    pub command_line_arguments: Option<String>,
    pub additional_files: Option<String>,

    /// Limits resolved from registry defaults at intake; persisted so the
    /// record is self-describing
    pub limits: ResourceLimits,
    pub number_of_runs: u32,
    pub flags: ExecutionFlags,

    pub callback_url: Option<String>,
    pub expected_output: Option<String>,
    pub priority: i32,

    pub status: SubmissionStatus,
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
    pub compile_output: Option<String>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    /// CPU time used in seconds
    pub time: Option<f64>,
    /// Wall clock time used in seconds
    pub wall_time: Option<f64>,
    /// Peak memory in kilobytes
    pub memory: Option<u64>,
    /// Free-form final reason
    pub message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Submission {
    /// Build a queued submission from intake data and resolved limits
    pub fn queued(
        new: NewSubmission,
        limits: ResourceLimits,
        flags: ExecutionFlags,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            token: Uuid::new_v4().to_string(),
            language_key: new.language_key,
            source_code: new.source_code,
            stdin: new.stdin,
            compiler_options: new.compiler_options,
            command_line_arguments: new.command_line_arguments,
            additional_files: new.additional_files,
            limits,
            number_of_runs: new.number_of_runs.unwrap_or(1).max(1),
            flags,
            callback_url: new.callback_url,
            expected_output: new.expected_output,
            priority: new.priority,
            status: SubmissionStatus::Queued,
            stdout: None,
            stderr: None,
            compile_output: None,
            exit_code: None,
            exit_signal: None,
            time: None,
            wall_time: None,
            memory: None,
            message: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Whether the submission has reached a terminal state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// In-process status transition event, broadcast on every change
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub id: Uuid,
    pub token: String,
    pub status: SubmissionStatus,
}

/// Fields applied atomically when a submission reaches a terminal state
#[derive(Debug, Clone, Default)]
pub struct TerminalOutcome {
    pub status: Option<SubmissionStatus>,
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
    pub compile_output: Option<String>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub time: Option<f64>,
    pub wall_time: Option<f64>,
    pub memory: Option<u64>,
    pub message: Option<String>,
}

impl TerminalOutcome {
    /// Terminal outcome carrying only a status and message
    pub fn status_message(status: SubmissionStatus, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Errors rendering a submission for a client
#[derive(Debug, Error)]
pub enum ViewError {
    #[error("field '{0}' contains non-text bytes; request base64 encoding")]
    Base64Required(&'static str),

    #[error("unknown field '{0}'")]
    UnknownField(String),
}

/// Field names accepted by [`render_view`] projections
pub const VIEW_FIELDS: &[&str] = &[
    "token",
    "language",
    "status",
    "source_code",
    "stdin",
    "stdout",
    "stderr",
    "compile_output",
    "exit_code",
    "exit_signal",
    "time",
    "wall_time",
    "memory",
    "message",
    "expected_output",
    "number_of_runs",
    "limits",
    "created_at",
    "finished_at",
];

fn render_bytes(
    bytes: Option<&[u8]>,
    field: &'static str,
    base64: bool,
) -> Result<Value, ViewError> {
    match bytes {
        None => Ok(Value::Null),
        Some(bytes) if base64 => Ok(Value::String(BASE64.encode(bytes))),
        Some(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Ok(Value::String(text.to_owned())),
            Err(_) => Err(ViewError::Base64Required(field)),
        },
    }
}

fn render_text(text: Option<&str>, base64: bool) -> Value {
    match text {
        None => Value::Null,
        Some(text) if base64 => Value::String(BASE64.encode(text.as_bytes())),
        Some(text) => Value::String(text.to_owned()),
    }
}

/// Render a submission as the client-visible record.
///
/// Binary-safe fields (`stdout`, `stderr`, `compile_output`, `source_code`)
/// come back as text when they are valid UTF-8; with `base64` set they are
/// always base64-encoded. A non-text field without base64 requested is an
/// error rather than a lossy conversion.
pub fn render_view(submission: &Submission, base64: bool) -> Result<Value, ViewError> {
    render_map(submission, base64).map(Value::Object)
}

fn render_map(submission: &Submission, base64: bool) -> Result<Map<String, Value>, ViewError> {
    let mut view = Map::new();
    view.insert("token".into(), json!(submission.token));
    view.insert("language".into(), json!(submission.language_key));
    view.insert("status".into(), json!(submission.status));
    view.insert(
        "source_code".into(),
        render_text(Some(&submission.source_code), base64),
    );
    view.insert("stdin".into(), render_text(Some(&submission.stdin), base64));
    view.insert(
        "stdout".into(),
        render_bytes(submission.stdout.as_deref(), "stdout", base64)?,
    );
    view.insert(
        "stderr".into(),
        render_bytes(submission.stderr.as_deref(), "stderr", base64)?,
    );
    view.insert(
        "compile_output".into(),
        render_text(submission.compile_output.as_deref(), base64),
    );
    view.insert("exit_code".into(), json!(submission.exit_code));
    view.insert("exit_signal".into(), json!(submission.exit_signal));
    view.insert("time".into(), json!(submission.time));
    view.insert("wall_time".into(), json!(submission.wall_time));
    view.insert("memory".into(), json!(submission.memory));
    view.insert("message".into(), json!(submission.message));
    view.insert(
        "expected_output".into(),
        json!(submission.expected_output),
    );
    view.insert("number_of_runs".into(), json!(submission.number_of_runs));
    view.insert("limits".into(), json!(submission.limits));
    view.insert("created_at".into(), json!(submission.created_at));
    view.insert("finished_at".into(), json!(submission.finished_at));
    Ok(view)
}

/// Render a submission keeping only the named fields, in registry order
pub fn render_view_fields(
    submission: &Submission,
    base64: bool,
    fields: &[&str],
) -> Result<Value, ViewError> {
    for field in fields {
        if !VIEW_FIELDS.contains(field) {
            return Err(ViewError::UnknownField((*field).to_owned()));
        }
    }

    let full = render_map(submission, base64)?;

    let mut view = Map::new();
    for (key, value) in full {
        if fields.contains(&key.as_str()) {
            view.insert(key, value);
        }
    }
    Ok(Value::Object(view))
}

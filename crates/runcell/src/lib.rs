//! A multi-language sandboxed code execution engine.
//!
//! Runcell accepts a source program plus an input stream, compiles and runs
//! it in a resource-bounded sandbox, and returns stdout/stderr, exit status,
//! and CPU/memory/time measurements. Submissions flow through a bounded
//! priority queue into a worker pool; clients submit synchronously or
//! asynchronously and retrieve results by token, with optional webhook
//! delivery on completion.
//!
//! # Features
//!
//! - **Sandboxed execution** — child processes under rlimits with `/proc`
//!   sampling, or containerised children via IOI isolate.
//! - **Multi-language** — TOML-configured catalog of compiled and
//!   interpreted languages with argv templates.
//! - **Bounded dispatch** — priority queue with backpressure, a worker pool
//!   capped at `max_concurrent`, and cancellation of pending and running
//!   submissions.
//! - **Resource enforcement** — CPU, wall clock, memory, stack, file size,
//!   process count, and network limits, with a classified termination for
//!   every run.
//! - **Durable work table** — the submission store is the source of truth;
//!   restart reconciliation recovers queued work and fails orphaned runs.

pub use callback::CallbackEmitter;
pub use cancel::CancelFlag;
pub use config::{Config, EXAMPLE_CONFIG};
pub use dispatch::{CancelOutcome, DispatchStats, Dispatcher};
pub use engine::{Engine, EngineError, EngineStats};
pub use sandbox::{DirectSandbox, IsolateSandbox, SandboxBackend, SandboxCommand, Workspace};
pub use store::{MemoryStore, SubmissionStore};
pub use submission::{
    NewSubmission, StatusEvent, Submission, SubmissionStatus, TerminalOutcome,
};
pub use types::{ExecutionFlags, ResourceLimits, RunOutcome, Termination};

pub mod callback;
pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod runner;
pub mod sandbox;
pub mod store;
pub mod submission;
pub mod types;

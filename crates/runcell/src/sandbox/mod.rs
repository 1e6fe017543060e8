//! Sandboxed execution of one command under enforced resource limits
//!
//! A [`Workspace`] stages the files for one submission, a [`SandboxCommand`]
//! describes one argv to run in it, and a [`SandboxBackend`] executes the
//! command and reports a structured [`RunOutcome`](crate::types::RunOutcome).
//!
//! Two backends are provided: [`DirectSandbox`] runs plain child processes
//! with rlimits and a `/proc` sampler, and [`IsolateSandbox`] delegates to
//! the IOI isolate binary for containerised children.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::cancel::CancelFlag;
pub use crate::sandbox::command::SandboxCommand;
pub use crate::sandbox::direct::DirectSandbox;
pub use crate::sandbox::isolate::IsolateSandbox;
pub use crate::sandbox::workspace::{Workspace, STDIN_FILE};
use crate::types::RunOutcome;

mod command;
mod direct;
mod isolate;
mod workspace;

/// Errors that occur operating the sandbox itself
///
/// Failures of the sandboxed program are not errors; they come back as a
/// [`RunOutcome`] with the matching termination. These variants cover the
/// engine's own I/O around the child.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("failed to decode additional files archive: {0}")]
    ArchiveDecode(#[from] base64::DecodeError),

    #[error("failed to expand additional files archive: {0}")]
    Archive(String),

    #[error("isolate command failed: {0}")]
    IsolateFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability to run one prepared command in one workspace
///
/// The executor depends only on this trait; the engine picks the backend at
/// construction time.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Run the command to completion and report how it ended.
    ///
    /// A set `cancel` flag terminates the whole child process group
    /// (graceful request, bounded grace, then force-kill) and the outcome
    /// reports `Termination::Killed`.
    async fn run(
        &self,
        command: SandboxCommand,
        cancel: &CancelFlag,
    ) -> Result<RunOutcome, SandboxError>;
}

/// Resolve the program in a command to an absolute path using the given
/// search path.
///
/// Bare command names (like `g++`) are resolved against `path_var`; commands
/// that already contain a `/` (like `./main` or `/usr/bin/g++`) are left
/// unchanged and resolve relative to the working directory.
pub(crate) fn resolve_program(command: &mut [String], path_var: &str) -> Result<(), SandboxError> {
    let first = match command.first_mut() {
        Some(first) => first,
        None => return Ok(()),
    };

    if first.contains('/') {
        return Ok(());
    }

    for dir in path_var.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = Path::new(dir).join(&*first);
        if candidate.exists() {
            // Canonicalize to resolve symlinks so the path stays valid for
            // children that cannot re-resolve across mount boundaries.
            *first = std::fs::canonicalize(&candidate)
                .unwrap_or(candidate)
                .to_string_lossy()
                .into_owned();
            return Ok(());
        }
    }

    Err(SandboxError::InvalidPath(format!(
        "command '{first}' not found in sandbox PATH"
    )))
}

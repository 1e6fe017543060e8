//! Compilation step
//!
//! Runs a language's compile command in the submission workspace under a
//! conservative compile-phase limit profile.

use tracing::{debug, instrument};

use crate::cancel::CancelFlag;
use crate::config::Language;
use crate::sandbox::{SandboxBackend, SandboxCommand, SandboxError, Workspace};
use crate::submission::Submission;
use crate::types::{ExecutionFlags, ResourceLimits, RunOutcome};

/// Result of a compilation
#[derive(Debug, Clone)]
pub struct CompileResult {
    /// Whether compilation succeeded
    pub success: bool,

    /// Run outcome of the compiler process
    pub outcome: RunOutcome,

    /// Compiler output, stdout and stderr merged
    pub output: String,
}

impl CompileResult {
    /// Check if compilation was successful
    pub fn is_success(&self) -> bool {
        self.success && self.outcome.exit_code == Some(0)
    }
}

/// Compile-phase limit profile
///
/// Compilers get a generous fixed budget; memory is never below the user's
/// run limit so a program that fits at runtime also builds.
fn compile_limits(user_limits: &ResourceLimits) -> ResourceLimits {
    let memory = user_limits
        .memory_limit
        .map_or(512 * ResourceLimits::MB, |kb| kb.max(512 * ResourceLimits::MB));
    ResourceLimits {
        cpu_time_limit: Some(30.0),
        cpu_extra_time: Some(1.0),
        wall_time_limit: Some(60.0),
        memory_limit: Some(memory),
        stack_limit: user_limits.stack_limit,
        max_processes: Some(16),
        max_file_size: Some(64 * ResourceLimits::MB),
    }
}

/// Compile the staged source in the workspace
#[instrument(skip_all, fields(language = %language.name))]
pub async fn compile(
    backend: &dyn SandboxBackend,
    workspace: &Workspace,
    language: &Language,
    submission: &Submission,
    cancel: &CancelFlag,
) -> Result<CompileResult, SandboxError> {
    let Some(ref compile_config) = language.compile else {
        // Interpreted language; nothing to do
        return Ok(CompileResult {
            success: true,
            outcome: RunOutcome::default(),
            output: String::new(),
        });
    };

    let class = language.class_name(&submission.source_code);
    let source_name = language.source_name(&submission.source_code);
    let output_name = compile_config.output_name.replace("{class}", &class);

    let mut argv =
        Language::expand_command(&compile_config.command, &source_name, &output_name, &class);
    if let Some(ref options) = submission.compiler_options {
        argv.extend(Language::split_options(options));
    }

    let limits = match compile_config.limits {
        Some(ref overrides) => compile_limits(&submission.limits).with_overrides(overrides),
        None => compile_limits(&submission.limits),
    };
    let flags = ExecutionFlags {
        redirect_stderr_to_stdout: false,
        enable_network: language.requires_network_for_build,
        ..ExecutionFlags::default()
    };

    let command = SandboxCommand::new(argv, workspace.path())
        .limits(limits)
        .flags(flags)
        .envs(compile_config.env.iter().map(|(k, v)| (k.clone(), v.clone())))
        .path_var(&language.run.path);

    let outcome = backend.run(command, cancel).await?;

    // Merge compiler stdout and stderr into one diagnostic blob
    let mut output = String::from_utf8_lossy(&outcome.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&outcome.stderr);
    if !output.is_empty() && !stderr.is_empty() {
        output.push('\n');
    }
    output.push_str(&stderr);

    let success = outcome.is_success();
    debug!(
        success,
        exit_code = ?outcome.exit_code,
        termination = ?outcome.termination,
        "compilation complete"
    );

    Ok(CompileResult {
        success,
        outcome,
        output,
    })
}

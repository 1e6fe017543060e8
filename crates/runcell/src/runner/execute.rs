//! Run step
//!
//! Executes the program with the submission's stdin and limits, honoring
//! `number_of_runs`: streams and exit status come from the last run, cpu,
//! wall, and memory are maxima across runs, and the first resource fault
//! stops the loop.

use tracing::{debug, instrument};

use crate::cancel::CancelFlag;
use crate::config::Language;
use crate::sandbox::{SandboxBackend, SandboxCommand, SandboxError, Workspace, STDIN_FILE};
use crate::submission::Submission;
use crate::types::{RunOutcome, Termination};

/// Run the program `number_of_runs` times and aggregate the outcome
#[instrument(skip_all, fields(language = %language.name, runs = submission.number_of_runs))]
pub async fn execute_runs(
    backend: &dyn SandboxBackend,
    workspace: &Workspace,
    language: &Language,
    submission: &Submission,
    cancel: &CancelFlag,
) -> Result<RunOutcome, SandboxError> {
    let class = language.class_name(&submission.source_code);
    let source_name = language.source_name(&submission.source_code);
    let binary = language
        .output_name(&submission.source_code)
        .unwrap_or_else(|| source_name.clone());

    let mut argv = Language::expand_command(&language.run.command, &source_name, &binary, &class);
    if let Some(ref arguments) = submission.command_line_arguments {
        argv.extend(Language::split_options(arguments));
    }

    workspace
        .write_file(STDIN_FILE, submission.stdin.as_bytes())
        .await?;

    let runs = submission.number_of_runs.max(1);
    let mut max_cpu = 0.0f64;
    let mut max_wall = 0.0f64;
    let mut max_memory = 0u64;
    let mut last = RunOutcome::default();

    for run_index in 1..=runs {
        debug!(run_index, runs, "executing run");

        let command = SandboxCommand::new(argv.clone(), workspace.path())
            .limits(submission.limits.clone())
            .flags(submission.flags)
            .envs(language.run.env.iter().map(|(k, v)| (k.clone(), v.clone())))
            .path_var(&language.run.path)
            .stdin_file(STDIN_FILE);

        let outcome = backend.run(command, cancel).await?;

        max_cpu = max_cpu.max(outcome.cpu_time);
        max_wall = max_wall.max(outcome.wall_time);
        max_memory = max_memory.max(outcome.memory);

        let stop = outcome.termination.is_resource_fault()
            || matches!(
                outcome.termination,
                Termination::Killed | Termination::SpawnFailed(_)
            );
        last = outcome;
        if stop {
            debug!(run_index, termination = ?last.termination, "stopping remaining runs");
            break;
        }
    }

    last.cpu_time = max_cpu;
    last.wall_time = max_wall;
    last.memory = max_memory;
    Ok(last)
}

//! IOI isolate sandbox backend
//!
//! Containerised flavor of [`SandboxBackend`]: each run initializes an
//! isolate box, copies the workspace in, executes under isolate's own limit
//! enforcement, and parses the meta file it leaves behind.
//!
//! References for isolate's CLI arguments and meta files:
//! - https://www.ucw.cz/isolate/isolate.1.html
//! - https://github.com/ioi/isolate

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::cancel::CancelFlag;
use crate::sandbox::{resolve_program, SandboxBackend, SandboxCommand, SandboxError};
use crate::sandbox::workspace::STDIN_FILE;
use crate::types::{LimitBreaches, ResourceLimits, RunOutcome};

/// Number of box ids the backend cycles through
const BOX_ID_RANGE: u32 = 100;

/// Sandbox backend delegating to the isolate binary
#[derive(Debug)]
pub struct IsolateSandbox {
    isolate_path: PathBuf,
    next_box_id: AtomicU32,
}

impl IsolateSandbox {
    /// Create a backend using the given isolate binary
    pub fn new(isolate_path: impl Into<PathBuf>) -> Self {
        Self {
            isolate_path: isolate_path.into(),
            next_box_id: AtomicU32::new(0),
        }
    }

    /// Create a backend that finds `isolate` on the engine's PATH
    pub fn with_defaults() -> Self {
        Self::new("isolate")
    }

    async fn control(&self, box_id: u32, flag: &str) -> Result<std::process::Output, SandboxError> {
        Command::new(&self.isolate_path)
            .arg(format!("--box-id={box_id}"))
            .arg(flag)
            .output()
            .await
            .map_err(SandboxError::Io)
    }

    async fn init_box(&self, box_id: u32) -> Result<PathBuf, SandboxError> {
        let output = self.control(box_id, "--init").await?;
        if !output.status.success() {
            return Err(SandboxError::IsolateFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let box_path = PathBuf::from(stdout.trim());
        if !box_path.exists() {
            return Err(SandboxError::IsolateFailed(format!(
                "box path does not exist: {}",
                box_path.display()
            )));
        }
        Ok(box_path)
    }

    async fn cleanup_box(&self, box_id: u32) {
        match self.control(box_id, "--cleanup").await {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(
                box_id,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "isolate cleanup failed"
            ),
            Err(e) => warn!(box_id, error = %e, "isolate cleanup failed"),
        }
    }
}

#[async_trait]
impl SandboxBackend for IsolateSandbox {
    #[instrument(skip_all, fields(workspace = %command.workspace_dir().display()))]
    async fn run(
        &self,
        mut command: SandboxCommand,
        cancel: &CancelFlag,
    ) -> Result<RunOutcome, SandboxError> {
        if command.argv().is_empty() {
            return Ok(RunOutcome::spawn_failed("empty command"));
        }
        // Isolate uses execve, which does not search PATH
        let path_var = command.path().to_string();
        if let Err(e) = resolve_program(command.argv_mut(), &path_var) {
            return Ok(RunOutcome::spawn_failed(e.to_string()));
        }

        let box_id = self.next_box_id.fetch_add(1, Ordering::SeqCst) % BOX_ID_RANGE;
        let box_path = self.init_box(box_id).await?;
        let box_root = box_path.join("box");

        let result = self
            .run_in_box(&command, cancel, box_id, &box_root)
            .await;
        self.cleanup_box(box_id).await;
        result
    }
}

impl IsolateSandbox {
    async fn run_in_box(
        &self,
        command: &SandboxCommand,
        cancel: &CancelFlag,
        box_id: u32,
        box_root: &Path,
    ) -> Result<RunOutcome, SandboxError> {
        copy_workspace(command.workspace_dir(), box_root).await?;

        // Isolate requires a stdin file even when empty
        if command.stdin().is_none() {
            tokio::fs::write(box_root.join(STDIN_FILE), b"").await?;
        }

        let meta_path = box_root.join("meta.txt");
        let args = build_run_args(
            &self.isolate_path,
            box_id,
            command,
            &meta_path,
        );
        debug!(?args, "running isolate command");

        let mut child = match Command::new(&args[0])
            .args(&args[1..])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return Ok(RunOutcome::spawn_failed(e.to_string())),
        };

        let mut breaches = LimitBreaches::default();
        tokio::select! {
            status = child.wait() => {
                status?;
            }
            _ = cancel.cancelled() => {
                breaches.killed = true;
                child.kill().await?;
                child.wait().await?;
            }
        }

        let meta = match tokio::fs::read_to_string(&meta_path).await {
            Ok(content) => Meta::parse(&content),
            Err(_) if breaches.killed => Meta::default(),
            Err(_) => {
                // No meta file means isolate itself refused to run
                let mut stderr = Vec::new();
                if let Some(mut pipe) = child.stderr.take() {
                    use tokio::io::AsyncReadExt;
                    let _ = pipe.read_to_end(&mut stderr).await;
                }
                return Ok(RunOutcome::spawn_failed(
                    String::from_utf8_lossy(&stderr).into_owned(),
                ));
            }
        };

        let limits = command.resource_limits();
        let cap_bytes = limits.max_file_size.map(|kb| (kb * 1024) as usize);
        let (stdout, stdout_truncated) =
            read_capped(&box_root.join("stdout.txt"), cap_bytes).await;
        let (stderr, stderr_truncated) =
            read_capped(&box_root.join("stderr.txt"), cap_bytes).await;

        Ok(meta.to_outcome(
            limits,
            breaches,
            stdout,
            stderr,
            stdout_truncated || stderr_truncated,
        ))
    }
}

/// Build the isolate argv for one run
fn build_run_args(
    isolate_path: &Path,
    box_id: u32,
    command: &SandboxCommand,
    meta_path: &Path,
) -> Vec<String> {
    let limits = command.resource_limits();
    let flags = command.execution_flags();

    let mut args = vec![
        isolate_path.to_string_lossy().into_owned(),
        format!("--box-id={box_id}"),
        "--run".to_string(),
    ];

    if let Some(cpu) = limits.cpu_time_limit {
        args.push(format!("--time={cpu}"));
    }
    if let Some(extra) = limits.cpu_extra_time {
        args.push(format!("--extra-time={extra}"));
    }
    if let Some(wall) = limits.wall_time_limit {
        args.push(format!("--wall-time={wall}"));
    }
    if let Some(memory) = limits.memory_limit {
        args.push(format!("--mem={memory}"));
    }
    if let Some(stack) = limits.stack_limit {
        args.push(format!("--stack={stack}"));
    }
    if let Some(procs) = limits.max_processes {
        args.push(format!("--processes={procs}"));
    }
    if let Some(fsize) = limits.max_file_size {
        args.push(format!("--fsize={fsize}"));
    }

    if flags.enable_network {
        args.push("--share-net".to_string());
    }
    if flags.redirect_stderr_to_stdout {
        args.push("--stderr-to-stdout".to_string());
    }

    args.push(format!("--env=PATH={}", command.path()));
    for (key, value) in command.environment() {
        args.push(format!("--env={key}={value}"));
    }

    args.push(format!("--meta={}", meta_path.display()));
    let stdin = command.stdin().unwrap_or(STDIN_FILE);
    args.push(format!("--stdin=/box/{stdin}"));
    args.push("--stdout=/box/stdout.txt".to_string());
    if !flags.redirect_stderr_to_stdout {
        args.push("--stderr=/box/stderr.txt".to_string());
    }
    args.push("--chdir=/box".to_string());

    args.push("--".to_string());
    args.extend(command.argv().iter().cloned());

    args
}

async fn copy_workspace(from: &Path, to: &Path) -> Result<(), SandboxError> {
    let from = from.to_path_buf();
    let to = to.to_path_buf();
    tokio::task::spawn_blocking(move || copy_dir_recursive(&from, &to))
        .await
        .map_err(|e| SandboxError::Archive(e.to_string()))?
}

fn copy_dir_recursive(from: &Path, to: &Path) -> Result<(), SandboxError> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

async fn read_capped(path: &Path, cap: Option<usize>) -> (Vec<u8>, bool) {
    let Ok(mut bytes) = tokio::fs::read(path).await else {
        return (Vec::new(), false);
    };
    match cap {
        Some(cap) if bytes.len() >= cap => {
            bytes.truncate(cap);
            (bytes, true)
        }
        _ => (bytes, false),
    }
}

/// Parsed isolate meta file
#[derive(Debug, Clone, Default)]
struct Meta {
    entries: HashMap<String, String>,
}

impl Meta {
    /// Parse meta file content; entries are colon-separated key-value lines
    fn parse(content: &str) -> Self {
        let mut entries = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim();
                // The value is everything after the first colon; messages
                // may themselves contain colons
                if !key.is_empty() {
                    entries.insert(key.to_string(), value.trim().to_string());
                }
            }
        }
        Self { entries }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    fn memory_kb(&self) -> u64 {
        // Prefer cgroup accounting when isolate reports it
        self.get_u64("cg-mem")
            .or_else(|| self.get_u64("max-rss"))
            .unwrap_or(0)
    }

    /// Convert the meta file into a classified run outcome
    fn to_outcome(
        &self,
        limits: &ResourceLimits,
        mut breaches: LimitBreaches,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        output_truncated: bool,
    ) -> RunOutcome {
        let status = self.get("status").unwrap_or("OK");
        let message = self.get("message").unwrap_or("").to_lowercase();

        if status == "TO" {
            if message.contains("wall") {
                breaches.wall = true;
            } else {
                breaches.cpu = true;
            }
        }
        let memory_kb = self.memory_kb();
        if message.contains("memory") || message.contains("out of memory") {
            breaches.memory = true;
        }
        if let Some(limit) = limits.memory_limit {
            if memory_kb >= limit {
                breaches.memory = true;
            }
        }
        if output_truncated || message.contains("output") {
            breaches.output = true;
        }

        RunOutcome {
            stdout,
            stderr,
            exit_code: self.get_i32("exitcode"),
            exit_signal: self.get_i32("exitsig"),
            cpu_time: self.get_f64("time").unwrap_or(0.0),
            wall_time: self.get_f64("time-wall").unwrap_or(0.0),
            memory: memory_kb,
            termination: breaches.classify(self.get_i32("exitcode"), self.get_i32("exitsig")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionFlags, Termination};

    fn sample_command(limits: ResourceLimits, flags: ExecutionFlags) -> SandboxCommand {
        SandboxCommand::new(["./main"], "/tmp/ws")
            .limits(limits)
            .flags(flags)
    }

    #[test]
    fn build_args_includes_limits() {
        let limits = ResourceLimits::none()
            .with_cpu_time_limit(2.0)
            .with_cpu_extra_time(0.5)
            .with_wall_time_limit(5.0)
            .with_memory_limit(262144)
            .with_stack_limit(65536)
            .with_max_processes(4)
            .with_max_file_size(1024);
        let command = sample_command(limits, ExecutionFlags::default());
        let args = build_run_args(Path::new("isolate"), 3, &command, Path::new("/tmp/meta.txt"));

        assert!(args.contains(&"--box-id=3".to_string()));
        assert!(args.contains(&"--time=2".to_string()));
        assert!(args.contains(&"--extra-time=0.5".to_string()));
        assert!(args.contains(&"--wall-time=5".to_string()));
        assert!(args.contains(&"--mem=262144".to_string()));
        assert!(args.contains(&"--stack=65536".to_string()));
        assert!(args.contains(&"--processes=4".to_string()));
        assert!(args.contains(&"--fsize=1024".to_string()));
        assert!(args.contains(&"--chdir=/box".to_string()));
        assert!(args.contains(&"--".to_string()));
        assert!(args.contains(&"./main".to_string()));
    }

    #[test]
    fn build_args_omits_unset_limits() {
        let command = sample_command(ResourceLimits::none(), ExecutionFlags::default());
        let args = build_run_args(Path::new("isolate"), 0, &command, Path::new("/tmp/meta.txt"));

        assert!(!args.iter().any(|a| a.starts_with("--time=")));
        assert!(!args.iter().any(|a| a.starts_with("--mem=")));
        assert!(!args.iter().any(|a| a.starts_with("--processes=")));
    }

    #[test]
    fn build_args_network_flag() {
        let flags = ExecutionFlags {
            enable_network: true,
            ..Default::default()
        };
        let command = sample_command(ResourceLimits::none(), flags);
        let args = build_run_args(Path::new("isolate"), 0, &command, Path::new("/tmp/meta.txt"));
        assert!(args.contains(&"--share-net".to_string()));
    }

    #[test]
    fn build_args_stderr_redirect() {
        let flags = ExecutionFlags {
            redirect_stderr_to_stdout: true,
            ..Default::default()
        };
        let command = sample_command(ResourceLimits::none(), flags);
        let args = build_run_args(Path::new("isolate"), 0, &command, Path::new("/tmp/meta.txt"));
        assert!(args.contains(&"--stderr-to-stdout".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--stderr=/box")));
    }

    #[test]
    fn meta_parse_success() {
        let meta = Meta::parse("time:0.042\ntime-wall:0.050\nmax-rss:3456\nexitcode:0\n");
        let outcome = meta.to_outcome(
            &ResourceLimits::default(),
            LimitBreaches::default(),
            b"hi\n".to_vec(),
            Vec::new(),
            false,
        );

        assert_eq!(outcome.termination, Termination::Exited(0));
        assert!((outcome.cpu_time - 0.042).abs() < 0.001);
        assert!((outcome.wall_time - 0.050).abs() < 0.001);
        assert_eq!(outcome.memory, 3456);
        assert_eq!(outcome.stdout, b"hi\n");
    }

    #[test]
    fn meta_parse_cpu_timeout() {
        let meta = Meta::parse("time:2.001\nstatus:TO\nmessage:Time limit exceeded\n");
        let outcome = meta.to_outcome(
            &ResourceLimits::default(),
            LimitBreaches::default(),
            Vec::new(),
            Vec::new(),
            false,
        );
        assert_eq!(outcome.termination, Termination::CpuLimitExceeded);
    }

    #[test]
    fn meta_parse_wall_timeout() {
        let meta = Meta::parse("time:1.0\nstatus:TO\nmessage:Time limit exceeded (wall clock)\n");
        let outcome = meta.to_outcome(
            &ResourceLimits::default(),
            LimitBreaches::default(),
            Vec::new(),
            Vec::new(),
            false,
        );
        assert_eq!(outcome.termination, Termination::WallLimitExceeded);
    }

    #[test]
    fn meta_parse_memory_from_reported_usage() {
        let meta = Meta::parse("status:SG\nexitsig:9\ncg-mem:262144\n");
        let limits = ResourceLimits::none().with_memory_limit(262144);
        let outcome = meta.to_outcome(
            &limits,
            LimitBreaches::default(),
            Vec::new(),
            Vec::new(),
            false,
        );
        assert_eq!(outcome.termination, Termination::MemoryLimitExceeded);
        assert_eq!(outcome.memory, 262144);
    }

    #[test]
    fn meta_parse_signal() {
        let meta = Meta::parse("status:SG\nexitsig:11\nmessage:Caught fatal signal 11\n");
        let outcome = meta.to_outcome(
            &ResourceLimits::default(),
            LimitBreaches::default(),
            Vec::new(),
            Vec::new(),
            false,
        );
        assert_eq!(outcome.termination, Termination::Signalled(11));
        assert_eq!(outcome.exit_signal, Some(11));
    }

    #[test]
    fn meta_parse_value_with_colons() {
        let meta = Meta::parse("message:Error at 12:30:45\n");
        assert_eq!(meta.get("message"), Some("Error at 12:30:45"));
    }

    #[test]
    fn meta_parse_skips_malformed_lines() {
        let meta = Meta::parse("time:0.042\ngarbage line\nexitcode:0\n");
        assert_eq!(meta.get_f64("time"), Some(0.042));
        assert_eq!(meta.get_i32("exitcode"), Some(0));
    }

    #[test]
    fn output_truncation_classifies() {
        let meta = Meta::parse("exitcode:0\n");
        let outcome = meta.to_outcome(
            &ResourceLimits::default(),
            LimitBreaches::default(),
            vec![b'x'; 16],
            Vec::new(),
            true,
        );
        assert_eq!(outcome.termination, Termination::OutputLimitExceeded);
    }
}

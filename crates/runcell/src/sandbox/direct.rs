//! Direct child-process sandbox
//!
//! Runs the command as a plain child process in its own session/process
//! group, with rlimits applied between fork and exec, a `/proc` sampler for
//! CPU and memory accounting, bounded output capture, and a wall clock
//! timer. Network isolation uses an unprivileged user+network namespace when
//! the kernel allows it.

use std::process::Stdio;
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid, SysconfVar};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, instrument, warn};

use crate::cancel::CancelFlag;
use crate::sandbox::{resolve_program, SandboxBackend, SandboxCommand, SandboxError};
use crate::types::{LimitBreaches, ResourceLimits, RunOutcome};

/// How often the sampler reads `/proc`
const SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// Grace between the termination request and the force-kill
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// How long to wait for output drains after the child exits
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

static NETNS_FALLBACK_WARNING: Once = Once::new();

/// Sandbox backend running plain child processes under rlimits
#[derive(Debug, Clone, Default)]
pub struct DirectSandbox {
    _private: (),
}

impl DirectSandbox {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SandboxBackend for DirectSandbox {
    #[instrument(skip_all, fields(workspace = %command.workspace_dir().display()))]
    async fn run(
        &self,
        mut command: SandboxCommand,
        cancel: &CancelFlag,
    ) -> Result<RunOutcome, SandboxError> {
        if command.argv().is_empty() {
            return Ok(RunOutcome::spawn_failed("empty command"));
        }
        let path_var = command.path().to_string();
        if let Err(e) = resolve_program(command.argv_mut(), &path_var) {
            return Ok(RunOutcome::spawn_failed(e.to_string()));
        }

        let limits = command.resource_limits().clone();
        let flags = command.execution_flags();
        let isolate_network = !flags.enable_network;

        debug!(argv = ?command.argv(), isolate_network, "spawning sandboxed child");

        let mut child = match build_child(&command, isolate_network)?.spawn() {
            Ok(child) => child,
            Err(first_err) if isolate_network => {
                // Kernels without unprivileged user namespaces refuse the
                // unshare in pre_exec; retry with a scrubbed environment only.
                NETNS_FALLBACK_WARNING.call_once(|| {
                    warn!(
                        error = %first_err,
                        "network namespace isolation unavailable; \
                         falling back to scrubbed environment"
                    );
                });
                match build_child(&command, false)?.spawn() {
                    Ok(child) => child,
                    Err(e) => return Ok(RunOutcome::spawn_failed(e.to_string())),
                }
            }
            Err(e) => return Ok(RunOutcome::spawn_failed(e.to_string())),
        };

        let pid = child.id();
        // setsid in pre_exec makes the child its own process group leader
        let pgid = pid.map(|p| Pid::from_raw(p as i32));

        let cap_bytes = limits.max_file_size.map(|kb| (kb * 1024) as usize);
        let stdout_sink = Arc::new(Mutex::new(OutputSink::new(cap_bytes)));
        let stderr_sink = if flags.redirect_stderr_to_stdout {
            Arc::clone(&stdout_sink)
        } else {
            Arc::new(Mutex::new(OutputSink::new(cap_bytes)))
        };

        let mut stdout_task = tokio::spawn(drain(child.stdout.take(), Arc::clone(&stdout_sink)));
        let mut stderr_task = tokio::spawn(drain(child.stderr.take(), Arc::clone(&stderr_sink)));

        let started = Instant::now();
        let ticks_per_sec = clock_ticks_per_sec();
        let cpu_budget = limits.cpu_budget();
        let wall_deadline = limits
            .wall_time_limit
            .map(|secs| started + Duration::from_secs_f64(secs));

        let mut breaches = LimitBreaches::default();
        let mut peak_rss_kb = 0u64;
        let mut vm_peak_kb = 0u64;
        let mut cpu_secs = 0.0f64;
        let mut shutdown_sent = false;

        let mut sampler = tokio::time::interval(SAMPLE_INTERVAL);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,

                _ = cancel.cancelled(), if !breaches.killed => {
                    breaches.killed = true;
                    if !shutdown_sent {
                        request_group_shutdown(pgid);
                        shutdown_sent = true;
                    }
                }

                _ = tokio::time::sleep_until(far_future_if_none(wall_deadline)),
                    if wall_deadline.is_some() && !breaches.wall =>
                {
                    breaches.wall = true;
                    if !shutdown_sent {
                        request_group_shutdown(pgid);
                        shutdown_sent = true;
                    }
                }

                _ = sampler.tick() => {
                    let Some(pid) = pid else { continue };
                    let Some(sample) = sample_proc(pid, ticks_per_sec).await else { continue };

                    peak_rss_kb = peak_rss_kb.max(sample.rss_peak_kb);
                    vm_peak_kb = vm_peak_kb.max(sample.vm_peak_kb);
                    cpu_secs = cpu_secs.max(sample.cpu_secs);

                    if let Some(limit) = limits.memory_limit {
                        if (peak_rss_kb >= limit || vm_peak_kb >= limit) && !breaches.memory {
                            breaches.memory = true;
                            if !shutdown_sent {
                                force_kill_group(pgid);
                                shutdown_sent = true;
                            }
                        }
                    }
                    if let Some(cpu_limit) = limits.cpu_time_limit {
                        if cpu_secs > cpu_limit {
                            breaches.cpu = true;
                        }
                        if cpu_secs >= cpu_budget.unwrap_or(cpu_limit) && !shutdown_sent {
                            force_kill_group(pgid);
                            shutdown_sent = true;
                        }
                    }
                }
            }
        };

        // Clear any straggling descendants still holding the pipes
        force_kill_group(pgid);

        let wall_time = started.elapsed().as_secs_f64();
        let exit_code = status.code();
        let exit_signal = std::os::unix::process::ExitStatusExt::signal(&status);

        // The hard RLIMIT_CPU kill can land between samples
        if exit_signal == Some(Signal::SIGXCPU as i32) {
            breaches.cpu = true;
        }

        if tokio::time::timeout(DRAIN_TIMEOUT, &mut stdout_task)
            .await
            .is_err()
        {
            stdout_task.abort();
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut stderr_task)
            .await
            .is_err()
        {
            stderr_task.abort();
        }

        let (stdout, stdout_truncated) = {
            let mut sink = stdout_sink.lock().await;
            (std::mem::take(&mut sink.data), sink.truncated)
        };
        let (stderr, stderr_truncated) = if flags.redirect_stderr_to_stdout {
            (Vec::new(), stdout_truncated)
        } else {
            let mut sink = stderr_sink.lock().await;
            (std::mem::take(&mut sink.data), sink.truncated)
        };
        if stdout_truncated || stderr_truncated {
            breaches.output = true;
        }

        // When the breach came from the address-space ceiling, report the
        // configured limit; the RSS peak alone can understate the fault.
        let memory = match (breaches.memory, limits.memory_limit) {
            (true, Some(limit)) => peak_rss_kb.max(limit),
            _ => peak_rss_kb,
        };

        let termination = breaches.classify(exit_code, exit_signal);

        debug!(
            ?termination,
            exit_code,
            exit_signal,
            cpu = cpu_secs,
            wall = wall_time,
            memory_kb = memory,
            "sandboxed child finished"
        );

        Ok(RunOutcome {
            stdout,
            stderr,
            exit_code,
            exit_signal,
            cpu_time: cpu_secs,
            wall_time,
            memory,
            termination,
        })
    }
}

fn build_child(
    command: &SandboxCommand,
    isolate_network: bool,
) -> Result<Command, SandboxError> {
    let argv = command.argv();
    let mut child = Command::new(&argv[0]);
    child
        .args(&argv[1..])
        .current_dir(command.workspace_dir())
        .env_clear()
        .env("PATH", command.path())
        .envs(command.environment())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match command.stdin() {
        Some(name) => {
            let file = std::fs::File::open(command.workspace_dir().join(name))?;
            child.stdin(Stdio::from(file));
        }
        None => {
            child.stdin(Stdio::null());
        }
    }

    let limits = command.resource_limits().clone();
    // Safety: the closure only calls async-signal-safe syscalls
    unsafe {
        child.pre_exec(move || apply_child_limits(&limits, isolate_network));
    }

    Ok(child)
}

/// Applied between fork and exec in the child
fn apply_child_limits(limits: &ResourceLimits, isolate_network: bool) -> std::io::Result<()> {
    // Own session and process group, so group signals reach every descendant
    setsid().map_err(std::io::Error::from)?;

    if isolate_network {
        unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)
            .map_err(std::io::Error::from)?;
    }

    if let Some(budget) = limits.cpu_budget() {
        let secs = budget.ceil() as u64;
        setrlimit(Resource::RLIMIT_CPU, secs, secs).map_err(std::io::Error::from)?;
    }
    if let Some(kb) = limits.memory_limit {
        let bytes = kb.saturating_mul(1024);
        setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(std::io::Error::from)?;
    }
    if let Some(kb) = limits.stack_limit {
        let bytes = kb.saturating_mul(1024);
        setrlimit(Resource::RLIMIT_STACK, bytes, bytes).map_err(std::io::Error::from)?;
    }
    if let Some(kb) = limits.max_file_size {
        let bytes = kb.saturating_mul(1024);
        setrlimit(Resource::RLIMIT_FSIZE, bytes, bytes).map_err(std::io::Error::from)?;
    }
    if let Some(procs) = limits.max_processes {
        setrlimit(Resource::RLIMIT_NPROC, procs as u64, procs as u64)
            .map_err(std::io::Error::from)?;
    }
    // No core dumps from sandboxed children
    setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(std::io::Error::from)?;

    Ok(())
}

/// Ask the whole group to stop, then force-kill after the grace period
fn request_group_shutdown(pgid: Option<Pid>) {
    let Some(pgid) = pgid else { return };
    let _ = killpg(pgid, Signal::SIGTERM);
    tokio::spawn(async move {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        let _ = killpg(pgid, Signal::SIGKILL);
    });
}

fn force_kill_group(pgid: Option<Pid>) {
    if let Some(pgid) = pgid {
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}

fn far_future_if_none(deadline: Option<Instant>) -> Instant {
    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
}

fn clock_ticks_per_sec() -> f64 {
    nix::unistd::sysconf(SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .map(|ticks| ticks as f64)
        .unwrap_or(100.0)
}

/// Bounded capture buffer for one output stream
struct OutputSink {
    data: Vec<u8>,
    cap: Option<usize>,
    truncated: bool,
}

impl OutputSink {
    fn new(cap: Option<usize>) -> Self {
        Self {
            data: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.truncated {
            return;
        }
        match self.cap {
            Some(cap) => {
                let remaining = cap.saturating_sub(self.data.len());
                if chunk.len() > remaining {
                    self.data.extend_from_slice(&chunk[..remaining]);
                    self.truncated = true;
                } else {
                    self.data.extend_from_slice(chunk);
                }
            }
            None => self.data.extend_from_slice(chunk),
        }
    }
}

async fn drain<R>(reader: Option<R>, sink: Arc<Mutex<OutputSink>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else { return };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.lock().await.push(&chunk[..n]),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ProcSample {
    rss_peak_kb: u64,
    vm_peak_kb: u64,
    cpu_secs: f64,
}

/// Read peak memory and CPU time for a live process from `/proc`
async fn sample_proc(pid: u32, ticks_per_sec: f64) -> Option<ProcSample> {
    let status = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
        .await
        .ok()?;
    let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat"))
        .await
        .ok()?;

    let mut sample = ProcSample::default();
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            sample.rss_peak_kb = parse_status_kb(rest);
        } else if let Some(rest) = line.strip_prefix("VmPeak:") {
            sample.vm_peak_kb = parse_status_kb(rest);
        }
    }

    // The comm field may contain spaces; fields are counted after the
    // closing paren. utime and stime are stat fields 14 and 15.
    let after_comm = stat.rfind(')')?;
    let fields: Vec<&str> = stat[after_comm + 1..].split_whitespace().collect();
    let utime: f64 = fields.get(11)?.parse().ok()?;
    let stime: f64 = fields.get(12)?.parse().ok()?;
    sample.cpu_secs = (utime + stime) / ticks_per_sec;

    Some(sample)
}

fn parse_status_kb(rest: &str) -> u64 {
    rest.trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .unwrap_or(0)
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time limit in seconds
    #[serde(default)]
    pub cpu_time_limit: Option<f64>,

    /// Grace added to the CPU limit before the process is killed, in seconds
    #[serde(default)]
    pub cpu_extra_time: Option<f64>,

    /// Wall clock time limit in seconds
    #[serde(default)]
    pub wall_time_limit: Option<f64>,

    /// Memory limit in kilobytes
    #[serde(default)]
    pub memory_limit: Option<u64>,

    /// Stack size limit in kilobytes
    #[serde(default)]
    pub stack_limit: Option<u64>,

    /// Maximum number of processes and/or threads
    #[serde(default)]
    pub max_processes: Option<u32>,

    /// Maximum size of any created file, and of each captured output stream,
    /// in kilobytes
    #[serde(default)]
    pub max_file_size: Option<u64>,
}

impl ResourceLimits {
    /// 1 kilobyte in kilobytes
    pub const KB: u64 = 1;
    /// 1 megabyte in kilobytes
    pub const MB: u64 = 1024;
    /// 1 gigabyte in kilobytes
    pub const GB: u64 = 1024 * 1024;

    /// Create new resource limits with all fields set to None
    pub fn new() -> Self {
        Self::none()
    }

    /// Resource limits with every field unset
    pub fn none() -> Self {
        Self {
            cpu_time_limit: None,
            cpu_extra_time: None,
            wall_time_limit: None,
            memory_limit: None,
            stack_limit: None,
            max_processes: None,
            max_file_size: None,
        }
    }

    /// Set the CPU time limit in seconds
    pub fn with_cpu_time_limit(mut self, seconds: f64) -> Self {
        self.cpu_time_limit = Some(seconds);
        self
    }

    /// Set the CPU grace period in seconds
    pub fn with_cpu_extra_time(mut self, seconds: f64) -> Self {
        self.cpu_extra_time = Some(seconds);
        self
    }

    /// Set the wall clock time limit in seconds
    pub fn with_wall_time_limit(mut self, seconds: f64) -> Self {
        self.wall_time_limit = Some(seconds);
        self
    }

    /// Set the memory limit in kilobytes
    pub fn with_memory_limit(mut self, kb: u64) -> Self {
        self.memory_limit = Some(kb);
        self
    }

    /// Set the stack size limit in kilobytes
    pub fn with_stack_limit(mut self, kb: u64) -> Self {
        self.stack_limit = Some(kb);
        self
    }

    /// Set the maximum number of processes/threads
    pub fn with_max_processes(mut self, count: u32) -> Self {
        self.max_processes = Some(count);
        self
    }

    /// Set the maximum file size in kilobytes
    pub fn with_max_file_size(mut self, kb: u64) -> Self {
        self.max_file_size = Some(kb);
        self
    }

    /// Apply overrides from another ResourceLimits, preferring values from
    /// `overrides`
    ///
    /// Returns a new ResourceLimits with values from `overrides` taking
    /// precedence over values from `self` when both are present.
    pub fn with_overrides(&self, overrides: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            cpu_time_limit: overrides.cpu_time_limit.or(self.cpu_time_limit),
            cpu_extra_time: overrides.cpu_extra_time.or(self.cpu_extra_time),
            wall_time_limit: overrides.wall_time_limit.or(self.wall_time_limit),
            memory_limit: overrides.memory_limit.or(self.memory_limit),
            stack_limit: overrides.stack_limit.or(self.stack_limit),
            max_processes: overrides.max_processes.or(self.max_processes),
            max_file_size: overrides.max_file_size.or(self.max_file_size),
        }
    }

    /// Total CPU budget including the grace period, in seconds
    pub fn cpu_budget(&self) -> Option<f64> {
        self.cpu_time_limit
            .map(|cpu| cpu + self.cpu_extra_time.unwrap_or(0.0))
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time_limit: Some(5.0),
            cpu_extra_time: Some(0.5),
            wall_time_limit: Some(10.0),
            memory_limit: Some(262144), // 256 MiB
            stack_limit: Some(65536),   // 64 MiB
            max_processes: Some(60),
            max_file_size: Some(1024), // 1 MiB
        }
    }
}

/// Execution flags carried by a submission into the sandbox
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionFlags {
    /// Merge stderr into stdout in arrival order
    #[serde(default)]
    pub redirect_stderr_to_stdout: bool,

    /// Allow the child to reach the network
    #[serde(default)]
    pub enable_network: bool,

    /// Apply the CPU limit per process/thread rather than per sandbox
    #[serde(default)]
    pub per_process_time_limit: bool,

    /// Apply the memory limit per process/thread rather than per sandbox
    #[serde(default = "default_true")]
    pub per_process_memory_limit: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ExecutionFlags {
    fn default() -> Self {
        Self {
            redirect_stderr_to_stdout: false,
            enable_network: false,
            per_process_time_limit: false,
            per_process_memory_limit: true,
        }
    }
}

/// How a sandboxed process came to an end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Process exited normally with this code
    Exited(i32),

    /// Process was killed by this signal
    Signalled(i32),

    /// Measured CPU time exceeded the CPU limit
    CpuLimitExceeded,

    /// The wall clock timer expired
    WallLimitExceeded,

    /// Peak memory reached the memory limit
    MemoryLimitExceeded,

    /// A captured output stream overflowed the file size cap
    OutputLimitExceeded,

    /// The sandbox killed the process on request (cancellation)
    Killed,

    /// The process could not be started at all
    SpawnFailed(String),
}

impl Termination {
    /// Whether this termination is a resource fault
    #[must_use]
    pub fn is_resource_fault(&self) -> bool {
        matches!(
            self,
            Termination::CpuLimitExceeded
                | Termination::WallLimitExceeded
                | Termination::MemoryLimitExceeded
                | Termination::OutputLimitExceeded
        )
    }
}

/// Limit breaches observed while the process ran
///
/// The sampler and the output capture record breaches independently of how
/// the OS ultimately stops the process; classification then picks the most
/// specific fault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitBreaches {
    /// Sampled peak memory reached the memory limit
    pub memory: bool,
    /// Sampled CPU time exceeded the CPU limit
    pub cpu: bool,
    /// The wall clock timer fired
    pub wall: bool,
    /// An output stream overflowed its cap
    pub output: bool,
    /// The sandbox killed the process group on request
    pub killed: bool,
}

impl LimitBreaches {
    /// Classify a termination from the observed breaches and the raw process
    /// exit.
    ///
    /// When several conditions fired at once the more specific resource
    /// fault wins: memory > cpu > wall > output > killed > signal > exit
    /// code.
    pub fn classify(&self, exit_code: Option<i32>, exit_signal: Option<i32>) -> Termination {
        if self.memory {
            Termination::MemoryLimitExceeded
        } else if self.cpu {
            Termination::CpuLimitExceeded
        } else if self.wall {
            Termination::WallLimitExceeded
        } else if self.output {
            Termination::OutputLimitExceeded
        } else if self.killed {
            Termination::Killed
        } else if let Some(signal) = exit_signal {
            Termination::Signalled(signal)
        } else {
            Termination::Exited(exit_code.unwrap_or(-1))
        }
    }
}

/// Result of running one command in the sandbox
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Captured standard output (merged when stderr is redirected)
    pub stdout: Vec<u8>,

    /// Captured standard error (empty when redirected)
    pub stderr: Vec<u8>,

    /// Exit code if the process exited normally
    pub exit_code: Option<i32>,

    /// Signal number if the process was killed by a signal
    pub exit_signal: Option<i32>,

    /// CPU time used in seconds
    pub cpu_time: f64,

    /// Wall clock time used in seconds
    pub wall_time: f64,

    /// Peak memory usage in kilobytes
    pub memory: u64,

    /// How the process came to an end
    pub termination: Termination,
}

impl RunOutcome {
    /// Check if the run completed normally with exit code 0
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.termination == Termination::Exited(0)
    }

    /// Build an outcome for a process that never started
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self {
            termination: Termination::SpawnFailed(reason.into()),
            ..Default::default()
        }
    }
}

impl Default for RunOutcome {
    fn default() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
            exit_signal: None,
            cpu_time: 0.0,
            wall_time: 0.0,
            memory: 0,
            termination: Termination::Exited(0),
        }
    }
}

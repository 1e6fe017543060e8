//! Command builder for sandboxed execution
//!
//! Describes one argv vector to run in one workspace under one set of
//! limits. Backends consume the built command; no shell is ever involved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::DEFAULT_SANDBOX_PATH;
use crate::types::{ExecutionFlags, ResourceLimits};

/// Builder for one sandboxed command invocation
#[derive(Debug, Clone)]
pub struct SandboxCommand {
    /// Program and arguments
    argv: Vec<String>,
    /// Workspace directory the command runs in
    workspace_dir: PathBuf,
    /// Resource limits enforced on the child
    limits: ResourceLimits,
    /// Execution flags (stderr redirect, network)
    flags: ExecutionFlags,
    /// Environment variables for the child
    env: HashMap<String, String>,
    /// PATH presented to the child (and used to resolve the program)
    path_var: String,
    /// Workspace-relative name of the stdin file, if any
    stdin_file: Option<String>,
}

impl SandboxCommand {
    /// Create a new command for the given argv and workspace
    pub fn new(argv: impl IntoIterator<Item = impl Into<String>>, workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            workspace_dir: workspace_dir.into(),
            limits: ResourceLimits::default(),
            flags: ExecutionFlags::default(),
            env: HashMap::new(),
            path_var: DEFAULT_SANDBOX_PATH.to_owned(),
            stdin_file: None,
        }
    }

    /// Set resource limits
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set execution flags
    pub fn flags(mut self, flags: ExecutionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set multiple environment variables
    pub fn envs(
        mut self,
        vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        for (key, value) in vars {
            self.env.insert(key.into(), value.into());
        }
        self
    }

    /// Set the PATH presented to the child
    pub fn path_var(mut self, path: impl Into<String>) -> Self {
        self.path_var = path.into();
        self
    }

    /// Supply stdin from this workspace-relative file
    pub fn stdin_file(mut self, name: impl Into<String>) -> Self {
        self.stdin_file = Some(name.into());
        self
    }

    /// Program and arguments
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Mutable program and arguments (for program resolution)
    pub(crate) fn argv_mut(&mut self) -> &mut [String] {
        &mut self.argv
    }

    /// Workspace directory the command runs in
    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    /// Resource limits enforced on the child
    pub fn resource_limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Execution flags
    pub fn execution_flags(&self) -> ExecutionFlags {
        self.flags
    }

    /// Environment variables for the child
    pub fn environment(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// PATH presented to the child
    pub fn path(&self) -> &str {
        &self.path_var
    }

    /// Workspace-relative stdin file name, if any
    pub fn stdin(&self) -> Option<&str> {
        self.stdin_file.as_deref()
    }
}

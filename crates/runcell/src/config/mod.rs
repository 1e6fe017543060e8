use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

pub use crate::config::language::{
    detect_public_class, CompileConfig, FileExtension, Language, RunConfig, DEFAULT_CLASS_NAME,
    DEFAULT_SANDBOX_PATH,
};
use crate::types::ResourceLimits;

pub mod language;
mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../runcell.example.toml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid characters in file extension")]
    InvalidFileExtChars,

    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("language '{0}' not found in configuration")]
    LanguageNotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine-wide configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Maximum number of submissions executing at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum number of submissions waiting in the queue before intake
    /// refuses new work
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Root directory for per-submission workspaces (OS temp dir if unset)
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,

    /// Hard timeout for webhook delivery, in milliseconds
    #[serde(default = "default_callback_timeout_ms")]
    pub callback_timeout_ms: u64,

    /// Whether children may reach the network unless the submission says
    /// otherwise
    #[serde(default)]
    pub enable_network_default: bool,

    /// Default resource limits applied to all executions.
    /// Per-language and per-submission limits override these field by field.
    #[serde(default)]
    pub default_limits: ResourceLimits,

    /// Language configurations keyed by language key
    #[serde(default)]
    pub languages: HashMap<String, Language>,
}

fn default_max_concurrent() -> usize {
    50
}

fn default_max_queue_size() -> usize {
    100
}

fn default_callback_timeout_ms() -> u64 {
    5000
}

impl Config {
    /// Create a new config with the embedded default language catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty config with no languages
    pub fn empty() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            workspace_root: None,
            callback_timeout_ms: default_callback_timeout_ms(),
            enable_network_default: false,
            default_limits: ResourceLimits::default(),
            languages: HashMap::new(),
        }
    }

    /// Get a language by key
    pub fn get_language(&self, key: &str) -> Result<&Language, ConfigError> {
        self.languages
            .get(key)
            .ok_or_else(|| ConfigError::LanguageNotFound(key.to_string()))
    }

    /// Root directory for per-submission workspaces
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Merge resource limits with defaults
    ///
    /// Layering: engine defaults → per-language run limits → caller
    /// overrides, each level winning field by field.
    pub fn effective_limits(
        &self,
        language: &Language,
        overrides: Option<&ResourceLimits>,
    ) -> ResourceLimits {
        let mut limits = self.default_limits.clone();
        if let Some(ref lang_limits) = language.run.limits {
            limits = limits.with_overrides(lang_limits);
        }
        if let Some(user_limits) = overrides {
            limits = limits.with_overrides(user_limits);
        }
        limits
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

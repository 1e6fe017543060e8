use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::config::ConfigError;
use crate::types::ResourceLimits;

const INVALID_FILE_EXT_CHARS: [char; 2] = ['/', '.'];

/// Fallback class name when a JVM-style source does not declare a public class
pub const DEFAULT_CLASS_NAME: &str = "Main";

/// Configuration for a programming language
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Language {
    /// Human-readable name for the language (e.g., "C++ (GCC)")
    pub name: String,

    /// File extension
    pub extension: FileExtension,

    /// Whether the compile step needs network access (e.g. module fetching)
    #[serde(default)]
    pub requires_network_for_build: bool,

    /// Derive the source file name from a `public class X` declaration
    #[serde(default)]
    pub class_from_source: bool,

    /// Compilation configuration (None for interpreted languages)
    #[serde(default)]
    pub compile: Option<CompileConfig>,

    /// Execution configuration
    pub run: RunConfig,
}

impl Language {
    /// Check if the language is compiled
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Class name to use for this source, applying the `public class X` rule
    /// when the language asks for it
    pub fn class_name(&self, source: &str) -> String {
        if self.class_from_source {
            detect_public_class(source).unwrap_or_else(|| DEFAULT_CLASS_NAME.to_owned())
        } else {
            DEFAULT_CLASS_NAME.to_owned()
        }
    }

    /// Get the source file name for this language and source text
    pub fn source_name(&self, source: &str) -> String {
        let class = self.class_name(source);
        if let Some(ref compile) = self.compile {
            compile.source_name.replace("{class}", &class)
        } else if self.class_from_source {
            format!("{}.{}", class, self.extension)
        } else {
            format!("main.{}", self.extension)
        }
    }

    /// Output binary name produced by the compile step, if any
    pub fn output_name(&self, source: &str) -> Option<String> {
        self.compile
            .as_ref()
            .map(|c| c.output_name.replace("{class}", &self.class_name(source)))
    }

    /// Expand placeholders in the given command
    pub fn expand_command(command: &[String], source: &str, binary: &str, class: &str) -> Vec<String> {
        command
            .iter()
            .map(|arg| {
                arg.replace("{source}", source)
                    .replace("{output}", binary)
                    .replace("{binary}", binary)
                    .replace("{class}", class)
            })
            .collect()
    }

    /// Split a free-form option string into argv entries
    ///
    /// Options are whitespace-separated and appended to the command vector;
    /// no shell is involved, so quoting is not interpreted.
    pub fn split_options(options: &str) -> Vec<String> {
        options.split_whitespace().map(str::to_owned).collect()
    }
}

/// Detect the public class declared in a JVM-style source file
pub fn detect_public_class(source: &str) -> Option<String> {
    static PUBLIC_CLASS: OnceLock<Regex> = OnceLock::new();
    let re = PUBLIC_CLASS.get_or_init(|| {
        Regex::new(r"public\s+(?:final\s+|abstract\s+)?class\s+([A-Za-z_][A-Za-z0-9_]*)")
            .expect("public-class pattern should be valid")
    });
    re.captures(source)
        .map(|captures| captures[1].to_owned())
}

/// File extension without dot (e.g., "cpp")
#[derive(Debug, Clone, Serialize)]
pub struct FileExtension(String);

impl FileExtension {
    pub fn new(extension: &str) -> Result<Self, ConfigError> {
        let contains_invalid = extension
            .chars()
            .any(|c| INVALID_FILE_EXT_CHARS.contains(&c));
        if contains_invalid {
            return Err(ConfigError::InvalidFileExtChars);
        }
        Ok(Self(extension.to_owned()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for FileExtension {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FileExtension::new(&s).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"a file extension without '/' or '.' characters",
            )
        })
    }
}

impl std::fmt::Display for FileExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for the compilation step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileConfig {
    /// Command and arguments with placeholders
    /// Placeholders: {source}, {output}, {binary}, {class}
    pub command: Vec<String>,

    /// Source file name in the workspace (e.g., "main.cpp", "{class}.java")
    pub source_name: String,

    /// Output artifact name (e.g., "main")
    pub output_name: String,

    /// Environment variables to set during compilation
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Resource limits for compilation (overrides the compile profile)
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

/// Default PATH for sandboxed children
pub const DEFAULT_SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Configuration for the execution step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Command and arguments with placeholders
    /// Placeholders: {source}, {output}, {binary}, {class}
    pub command: Vec<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// PATH environment variable for the child
    #[serde(default = "default_sandbox_path")]
    pub path: String,

    /// Resource limits for execution (overrides engine defaults)
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

fn default_sandbox_path() -> String {
    DEFAULT_SANDBOX_PATH.to_owned()
}


#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn file_extension_rejects_all_strings_with_slash(s in ".*/.*.") {
            prop_assert!(FileExtension::new(&s).is_err());
        }

        #[test]
        fn file_extension_accepts_alphanumeric(s in "[a-zA-Z0-9_-]+") {
            prop_assert!(FileExtension::new(&s).is_ok());
        }

        #[test]
        fn expand_command_length_preserved(cmd_len in 1usize..10) {
            let cmd: Vec<String> = (0..cmd_len).map(|i| format!("arg{i}")).collect();
            let result = Language::expand_command(&cmd, "source", "binary", "Main");
            prop_assert_eq!(result.len(), cmd_len);
        }

        #[test]
        fn detect_public_class_never_panics(source in ".*") {
            let _ = detect_public_class(&source);
        }

        #[test]
        fn detect_public_class_finds_declared_name(name in "[A-Z][A-Za-z0-9_]{0,12}") {
            let source = format!("public class {name} {{ }}");
            prop_assert_eq!(detect_public_class(&source), Some(name));
        }

        #[test]
        fn split_options_never_produces_empty_entries(s in ".*") {
            let parts = Language::split_options(&s);
            prop_assert!(parts.iter().all(|p| !p.is_empty()));
        }
    }
}

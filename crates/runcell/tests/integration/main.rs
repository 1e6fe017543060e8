//! Integration tests for runcell
//!
//! These tests spawn real child processes through the direct sandbox. Run
//! with: cargo test -p runcell --features integration-tests
//!
//! Tests that need language toolchains (python3, gcc, javac) are marked
//! `#[ignore]`. To include them:
//!    cargo test -p runcell --features integration-tests -- --include-ignored

#![cfg(feature = "integration-tests")]

use runcell::{Config, Engine, NewSubmission};

mod cancellation;
mod lifecycle;
mod queueing;
mod scenarios;

/// Engine config with shell-based languages that need no toolchains, plus
/// the real catalog entries used by the ignored scenario tests.
pub(crate) fn test_config(workspace_root: &std::path::Path) -> Config {
    let toml = r#"
max_concurrent = 4
max_queue_size = 8

[default_limits]
cpu_time_limit = 5.0
cpu_extra_time = 0.5
wall_time_limit = 10.0
memory_limit = 262144
stack_limit = 65536
max_file_size = 1024

[languages.sh]
name = "Shell"
extension = "sh"

[languages.sh.run]
command = ["/bin/sh", "{source}"]

# Compiled flavor without a real toolchain: the "compiler" is the staged
# build script itself, expected to produce main.sh
[languages.scripted]
name = "Scripted build"
extension = "sh"

[languages.scripted.compile]
command = ["/bin/sh", "{source}"]
source_name = "build.sh"
output_name = "main.sh"

[languages.scripted.run]
command = ["/bin/sh", "{binary}"]

[languages.python]
name = "Python 3"
extension = "py"

[languages.python.run]
command = ["python3", "{source}"]

[languages.c]
name = "C (GCC)"
extension = "c"

[languages.c.compile]
command = ["gcc", "-std=c17", "-O2", "-lm", "{source}", "-o", "{output}"]
source_name = "main.c"
output_name = "main"

[languages.c.run]
command = ["./{binary}"]

[languages.cpp]
name = "C++ (GCC)"
extension = "cpp"

[languages.cpp.compile]
command = ["g++", "-std=c++17", "-O2", "{source}", "-o", "{output}"]
source_name = "main.cpp"
output_name = "main"

[languages.cpp.run]
command = ["./{binary}"]

[languages.java]
name = "Java (OpenJDK)"
extension = "java"
class_from_source = true

[languages.java.compile]
command = ["javac", "{source}"]
source_name = "{class}.java"
output_name = "{class}.class"

[languages.java.run]
command = ["java", "{class}"]

[languages.java.run.limits]
memory_limit = 1048576
max_processes = 128
"#;
    let mut config = Config::parse_toml(toml).expect("test config should parse");
    config.workspace_root = Some(workspace_root.to_path_buf());
    config
}

/// Engine over a fresh workspace root; the TempDir must outlive the engine
pub(crate) async fn test_engine() -> (Engine, tempfile::TempDir) {
    let root = tempfile::tempdir().expect("workspace root");
    let engine = Engine::new(test_config(root.path()))
        .await
        .expect("engine should start");
    (engine, root)
}

pub(crate) fn submission(language: &str, source: &str) -> NewSubmission {
    NewSubmission {
        language_key: language.to_owned(),
        source_code: source.to_owned(),
        ..Default::default()
    }
}

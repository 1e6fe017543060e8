//! Runcell CLI
//!
//! A command-line front end for the runcell execution engine: run a source
//! file through the full submission pipeline, or manage configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use runcell::{Config, Engine, NewSubmission, SubmissionStatus, EXAMPLE_CONFIG};
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "runcell")]
#[command(about = "A sandboxed multi-language code execution engine")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: runcell.toml)
        #[arg(short, long, default_value = "runcell.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run a source file through the engine and print its output
    Run {
        /// Source file to run
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// Language key (e.g., python, cpp, java)
        #[arg(short, long)]
        language: String,

        /// File supplying the program's stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Arguments appended to the run command
        #[arg(short, long)]
        args: Option<String>,

        /// Options appended to the compile command
        #[arg(long)]
        compiler_options: Option<String>,

        /// CPU time limit in seconds
        #[arg(short, long)]
        time_limit: Option<f64>,

        /// Wall clock time limit in seconds
        #[arg(short, long)]
        wall_time_limit: Option<f64>,

        /// Memory limit in KiB
        #[arg(short, long)]
        memory_limit: Option<u64>,

        /// Run the program this many times (results from the last run)
        #[arg(short, long)]
        number_of_runs: Option<u32>,
    },

    /// List available languages
    Languages,

    /// Show effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::default()
    };

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Run {
            source,
            language,
            input,
            args,
            compiler_options,
            time_limit,
            wall_time_limit,
            memory_limit,
            number_of_runs,
        } => {
            run_source(RunArgs {
                config,
                source,
                language,
                input,
                args,
                compiler_options,
                time_limit,
                wall_time_limit,
                memory_limit,
                number_of_runs,
            })
            .await
        }
        Commands::Languages => {
            list_languages(&config);
            Ok(())
        }
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

struct RunArgs {
    config: Config,
    source: PathBuf,
    language: String,
    input: Option<PathBuf>,
    args: Option<String>,
    compiler_options: Option<String>,
    time_limit: Option<f64>,
    wall_time_limit: Option<f64>,
    memory_limit: Option<u64>,
    number_of_runs: Option<u32>,
}

async fn run_source(run: RunArgs) -> Result<()> {
    let source_code = tokio::fs::read_to_string(&run.source)
        .await
        .context("failed to read source file")?;

    let stdin = match run.input {
        Some(ref path) => tokio::fs::read_to_string(path)
            .await
            .context("failed to read input file")?,
        None => String::new(),
    };

    let engine = Engine::new(run.config)
        .await
        .context("failed to start engine")?;

    let submission = NewSubmission {
        language_key: run.language,
        source_code,
        stdin,
        command_line_arguments: run.args,
        compiler_options: run.compiler_options,
        cpu_time_limit: run.time_limit,
        wall_time_limit: run.wall_time_limit,
        memory_limit: run.memory_limit,
        number_of_runs: run.number_of_runs,
        ..Default::default()
    };

    let record = engine
        .submit_wait(submission)
        .await
        .context("execution failed")?;
    engine.shutdown();

    if record.status == SubmissionStatus::CompilationError {
        eprintln!("Compilation failed:");
        if let Some(ref output) = record.compile_output {
            eprintln!("{output}");
        }
        std::process::exit(1);
    }

    if let Some(ref stdout) = record.stdout {
        print!("{}", String::from_utf8_lossy(stdout));
    }
    if let Some(ref stderr) = record.stderr {
        let err = String::from_utf8_lossy(stderr);
        if !err.is_empty() {
            eprint!("{err}");
        }
    }

    // Log execution info via tracing (stderr), keeping stdout clean for piping
    info!(
        status = %record.status,
        time = format_args!("{:.3}s", record.time.unwrap_or(0.0)),
        wall_time = format_args!("{:.3}s", record.wall_time.unwrap_or(0.0)),
        memory = format_args!("{} KiB", record.memory.unwrap_or(0)),
        exit_code = record.exit_code,
        exit_signal = record.exit_signal,
        "execution result"
    );
    if let Some(ref message) = record.message {
        info!(message = %message, "final reason");
    }

    match record.status {
        SubmissionStatus::Accepted => Ok(()),
        _ => std::process::exit(record.exit_code.unwrap_or(1).max(1)),
    }
}

fn list_languages(config: &Config) {
    println!("Available languages:\n");

    let mut languages: Vec<_> = config.languages.iter().collect();
    languages.sort_by_key(|(key, _)| *key);

    for (key, language) in languages {
        let kind = if language.is_compiled() {
            "compiled"
        } else {
            "interpreted"
        };
        println!("  {key:<15} {} ({kind})", language.name);
    }
}

fn show_config(config: &Config) {
    println!("Engine:");
    println!("  Max concurrent executions: {}", config.max_concurrent);
    println!("  Max queue size: {}", config.max_queue_size);
    println!("  Workspace root: {}", config.workspace_root().display());
    println!("  Callback timeout: {} ms", config.callback_timeout_ms);
    println!(
        "  Network enabled by default: {}",
        config.enable_network_default
    );
    println!();
    println!("Default resource limits:");
    println!(
        "  CPU time limit: {:?} s",
        config.default_limits.cpu_time_limit
    );
    println!(
        "  CPU extra time: {:?} s",
        config.default_limits.cpu_extra_time
    );
    println!(
        "  Wall time limit: {:?} s",
        config.default_limits.wall_time_limit
    );
    println!(
        "  Memory limit: {:?} KiB",
        config.default_limits.memory_limit
    );
    println!("  Stack limit: {:?} KiB", config.default_limits.stack_limit);
    println!("  Max processes: {:?}", config.default_limits.max_processes);
    println!(
        "  Max file size: {:?} KiB",
        config.default_limits.max_file_size
    );
    println!();
    println!("Languages configured: {}", config.languages.len());
}

async fn init_config(output: &PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}

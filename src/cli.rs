// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `agentdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "agentdag",
    version,
    about = "Run agent wrapper processes across a workflow DAG.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the workflow definition (YAML).
    #[arg(long, value_name = "PATH")]
    pub workflow: PathBuf,

    /// Target repository the agents act on.
    #[arg(long, value_name = "PATH", default_value = ".")]
    pub repo: PathBuf,

    /// Path to the engine config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Agentdag.toml")]
    pub config: PathBuf,

    /// Reuse an existing run id. When its run directory already holds a
    /// persisted state, the run is resumed instead of started fresh.
    #[arg(long, value_name = "ID")]
    pub run_id: Option<String>,

    /// Reset this step and everything depending on it before resuming.
    #[arg(long, value_name = "STEP")]
    pub start_at: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `AGENTDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate the workflow, print the plan, run nothing.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

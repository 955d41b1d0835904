// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `nodeward`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "nodeward",
    version,
    about = "Node-local agent that runs, supervises and cleans up scheduled tasks.",
    long_about = None
)]
pub struct CliArgs {
    /// Base path of the layered configuration.
    ///
    /// `<BASE>.toml` is read first, then `<BASE>.properties` overrides it.
    #[arg(long, value_name = "BASE", default_value = "/etc/nodeward/nodeward")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `NODEWARD_LOG`, `[logging].level` or `info` is used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Supervise tasks found in the task definition directory.
    Executor {
        /// Only launch these task ids (default: every definition found).
        #[arg(long = "task-id", value_name = "ID")]
        task_ids: Vec<String>,
    },

    /// Reclaim directories of finished tasks.
    Cleanup {
        /// Run a single sweep and exit.
        #[arg(long)]
        once: bool,
    },

    /// Upload logs of finished tasks described by upload metadata files.
    Uploader,

    /// Serve the local coalescing artifact download service.
    DownloadService,

    /// Print the effective (redacted) configuration and any violations.
    CheckConfig,
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

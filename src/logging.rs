// src/logging.rs

//! Logging setup for `nodeward` using `tracing` + `tracing-subscriber`.
//!
//! The base filter comes from the first of:
//! 1. `--log-level` CLI flag
//! 2. `NODEWARD_LOG`, either a level ("debug") or full `EnvFilter`
//!    directives ("info,nodeward::cleanup=debug")
//! 3. `[logging].level` from the config file
//! 4. `info`
//!
//! HTTP and watcher crates are held at `warn` unless the base filter names
//! them or is already `warn` or quieter. Logs go to STDERR; task output is
//! redirected into each task's service log and never reaches the agent's
//! streams.

use anyhow::{anyhow, Context, Result};
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "NODEWARD_LOG";

const QUIET_DEPENDENCIES: [&str; 4] = ["hyper", "reqwest", "rustls", "notify"];

/// Initialise the global subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>, config_level: Option<&str>) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();
    let directives = filter_directives(cli_level, env.as_deref(), config_level);
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid log filter {directives:?}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("installing log subscriber: {e}"))
}

/// The `EnvFilter` directive string for the given sources.
pub fn filter_directives(
    cli_level: Option<LogLevel>,
    env: Option<&str>,
    config_level: Option<&str>,
) -> String {
    let base = match cli_level {
        Some(lvl) => level_name(level_from_log_level(lvl)).to_string(),
        None => env
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| match parse_level_str(s) {
                Some(level) => level_name(level).to_string(),
                None => s.to_string(),
            })
            .or_else(|| config_level.and_then(parse_level_str).map(|l| level_name(l).to_string()))
            .unwrap_or_else(|| level_name(Level::INFO).to_string()),
    };

    let already_quiet = matches!(parse_level_str(&base), Some(Level::WARN | Level::ERROR));
    let mut directives = vec![base.clone()];
    if !already_quiet {
        for dep in QUIET_DEPENDENCIES {
            if !base.contains(dep) {
                directives.push(format!("{dep}=warn"));
            }
        }
    }
    directives.join(",")
}

fn level_from_log_level(lvl: LogLevel) -> Level {
    match lvl {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        _ => "trace",
    }
}

pub(crate) fn parse_level_str(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

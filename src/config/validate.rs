// src/config/validate.rs

use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::config::model::ConfigFile;
use crate::types::UploadDelivery;

/// Smallest accepted cleanup grace period.
pub const MIN_GRACE_PERIOD_MILLIS: u64 = 60_000;

/// A single problem found in a loaded configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigViolation {
    /// Dotted key, e.g. `executor.kill_threads`.
    pub field: String,
    pub message: String,
}

impl ConfigViolation {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a configuration for semantic problems.
///
/// Pure: no filesystem access, no partial results. An empty list means the
/// configuration is usable.
pub fn validate_config(cfg: &ConfigFile) -> Vec<ConfigViolation> {
    let mut out = Vec::new();
    validate_executor(cfg, &mut out);
    validate_logrotate(cfg, &mut out);
    validate_s3(cfg, &mut out);
    validate_artifacts(cfg, &mut out);
    validate_cleanup(cfg, &mut out);
    if cfg.history.path.is_some() {
        require_min(&mut out, "history.timeout_millis", cfg.history.timeout_millis, 1);
    }
    out
}

fn require_path(out: &mut Vec<ConfigViolation>, field: &str, path: &Path) {
    if path.as_os_str().is_empty() {
        out.push(ConfigViolation::new(field, "must not be empty"));
    }
}

fn require_text(out: &mut Vec<ConfigViolation>, field: &str, value: &str) {
    if value.trim().is_empty() {
        out.push(ConfigViolation::new(field, "must not be empty"));
    }
}

fn require_min(out: &mut Vec<ConfigViolation>, field: &str, value: u64, min: u64) {
    if value < min {
        out.push(ConfigViolation::new(
            field,
            format!("must be >= {min} (got {value})"),
        ));
    }
}

fn validate_executor(cfg: &ConfigFile, out: &mut Vec<ConfigViolation>) {
    let ex = &cfg.executor;
    require_path(out, "executor.task_definition_directory", &ex.task_definition_directory);
    require_text(out, "executor.task_definition_suffix", &ex.task_definition_suffix);
    require_text(out, "executor.service_log", &ex.service_log);
    require_text(out, "executor.task_app_directory", &ex.task_app_directory);
    require_text(out, "executor.service_finished_tail_log", &ex.service_finished_tail_log);
    require_min(out, "executor.hard_kill_after_millis", ex.hard_kill_after_millis, 1);
    require_min(out, "executor.kill_threads", ex.kill_threads as u64, 1);
    require_min(out, "executor.thread_check_threads", ex.thread_check_threads as u64, 1);
    require_min(out, "executor.check_threads_every_millis", ex.check_threads_every_millis, 1);
    require_min(out, "executor.max_task_message_length", ex.max_task_message_length as u64, 1);

    if ex.service_log == ex.service_finished_tail_log {
        out.push(ConfigViolation::new(
            "executor.service_finished_tail_log",
            "must differ from executor.service_log",
        ));
    }
    if let Some(0) = ex.max_task_threads {
        out.push(ConfigViolation::new(
            "executor.max_task_threads",
            "must be >= 1 when set",
        ));
    }
}

fn validate_logrotate(cfg: &ConfigFile, out: &mut Vec<ConfigViolation>) {
    let lr = &cfg.logrotate;
    require_text(out, "logrotate.command", &lr.command);
    require_path(out, "logrotate.conf_directory", &lr.conf_directory);
    require_text(out, "logrotate.to_directory", &lr.to_directory);
    require_text(out, "logrotate.dateformat", &lr.dateformat);
    require_min(out, "logrotate.count", lr.count as u64, 1);
    if let Some(bytes) = lr.rotate_after_bytes {
        require_min(out, "logrotate.rotate_after_bytes", bytes, 1);
    }
    for pattern in &lr.extras_files {
        if let Err(e) = globset::Glob::new(pattern) {
            out.push(ConfigViolation::new(
                "logrotate.extras_files",
                format!("invalid glob {pattern:?}: {e}"),
            ));
        }
    }
}

fn validate_s3(cfg: &ConfigFile, out: &mut Vec<ConfigViolation>) {
    let s3 = &cfg.s3;
    require_text(out, "s3.bucket", &s3.bucket);
    require_text(out, "s3.key_pattern", &s3.key_pattern);
    require_text(out, "s3.endpoint", &s3.endpoint);
    require_min(out, "s3.upload_threads", s3.upload_threads as u64, 1);
    require_min(out, "s3.upload_max_attempts", s3.upload_max_attempts as u64, 1);
    require_min(out, "s3.upload_attempt_timeout_millis", s3.upload_attempt_timeout_millis, 1);

    if !s3.key_pattern.contains("%filename") && !s3.key_pattern.contains("%filebase") {
        out.push(ConfigViolation::new(
            "s3.key_pattern",
            "must contain %filename or %filebase so files of one task get distinct keys",
        ));
    }
    if s3.delivery == UploadDelivery::Metadata {
        require_path(out, "s3.metadata_directory", &s3.metadata_directory);
    }
    for pattern in &s3.additional_files_to_backup {
        if let Err(e) = globset::Glob::new(pattern) {
            out.push(ConfigViolation::new(
                "s3.additional_files_to_backup",
                format!("invalid glob {pattern:?}: {e}"),
            ));
        }
    }
}

fn validate_artifacts(cfg: &ConfigFile, out: &mut Vec<ConfigViolation>) {
    let a = &cfg.artifacts;
    require_min(out, "artifacts.download_threads", a.download_threads as u64, 1);
    require_min(out, "artifacts.fetch_timeout_millis", a.fetch_timeout_millis, 1);
    if a.use_local_download_service {
        require_path(
            out,
            "artifacts.local_download_service_socket",
            &a.local_download_service_socket,
        );
        require_min(
            out,
            "artifacts.local_download_service_timeout_millis",
            a.local_download_service_timeout_millis,
            1,
        );
        require_min(
            out,
            "artifacts.local_download_service_retention_millis",
            a.local_download_service_retention_millis,
            1,
        );
    }
}

fn validate_cleanup(cfg: &ConfigFile, out: &mut Vec<ConfigViolation>) {
    let c = &cfg.cleanup;
    require_path(out, "cleanup.results_directory", &c.results_directory);
    require_text(out, "cleanup.results_suffix", &c.results_suffix);
    require_min(out, "cleanup.grace_period_millis", c.grace_period_millis, MIN_GRACE_PERIOD_MILLIS);
    require_min(out, "cleanup.live_tasks_timeout_millis", c.live_tasks_timeout_millis, 1);

    if c.results_suffix == cfg.executor.task_definition_suffix
        && c.results_directory == cfg.executor.task_definition_directory
    {
        out.push(ConfigViolation::new(
            "cleanup.results_suffix",
            "cleanup records would collide with task definition files",
        ));
    }
}

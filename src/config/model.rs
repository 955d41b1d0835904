// src/config/model.rs

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::UploadDelivery;

/// Top-level agent configuration.
///
/// Every section is optional; fields fall back to the defaults below. Paths
/// that have no sensible default (task definition directory, cleanup results
/// directory, S3 bucket) default to empty and are reported by
/// [`validate_config`](crate::config::validate::validate_config).
///
/// ```toml
/// [executor]
/// task_definition_directory = "/var/lib/nodeward/tasks"
/// hard_kill_after_millis = 180000
///
/// [s3]
/// bucket = "task-logs"
/// key_pattern = "%requestId/%Y/%m/%taskId/%filename"
///
/// [cleanup]
/// results_directory = "/var/lib/nodeward/cleanup"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub logrotate: LogrotateSection,
    #[serde(default)]
    pub s3: S3Section,
    #[serde(default)]
    pub artifacts: ArtifactsSection,
    #[serde(default)]
    pub cleanup: CleanupSection,
    #[serde(default)]
    pub logwatcher: LogWatcherSection,
    #[serde(default)]
    pub history: HistorySection,
    #[serde(default)]
    pub webhooks: WebhooksSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[executor]`: task supervision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSection {
    /// Where TaskDefinitionFiles are claimed.
    #[serde(default)]
    pub task_definition_directory: PathBuf,

    #[serde(default = "default_task_definition_suffix")]
    pub task_definition_suffix: String,

    /// Primary log file name, relative to the task directory.
    #[serde(default = "default_service_log")]
    pub service_log: String,

    /// Working directory of the task process, relative to the task directory.
    #[serde(default = "default_task_app_directory")]
    pub task_app_directory: String,

    #[serde(default = "default_hard_kill_after_millis")]
    pub hard_kill_after_millis: u64,

    #[serde(default = "default_one")]
    pub kill_threads: usize,

    #[serde(default = "default_one")]
    pub thread_check_threads: usize,

    #[serde(default = "default_check_threads_every_millis")]
    pub check_threads_every_millis: u64,

    #[serde(default = "default_idle_executor_shutdown_wait_millis")]
    pub idle_executor_shutdown_wait_millis: u64,

    #[serde(default = "default_stop_driver_after_millis")]
    pub stop_driver_after_millis: u64,

    /// Upper bound on how long a daemon shutdown waits for tasks to finish.
    #[serde(default = "default_shutdown_timeout_wait_millis")]
    pub shutdown_timeout_wait_millis: u64,

    /// Concurrently supervised tasks. Unset means unbounded.
    #[serde(default)]
    pub max_task_threads: Option<usize>,

    /// Status messages sent to the scheduler are cut to this many characters.
    #[serde(default = "default_max_task_message_length")]
    pub max_task_message_length: usize,

    #[serde(default = "default_tail_log_lines_to_save")]
    pub tail_log_lines_to_save: usize,

    #[serde(default = "default_service_finished_tail_log")]
    pub service_finished_tail_log: String,

    /// Run tasks as this user when the descriptor does not name one.
    #[serde(default)]
    pub default_user: Option<String>,
}

fn default_task_definition_suffix() -> String {
    ".task.json".to_string()
}

fn default_service_log() -> String {
    "service.log".to_string()
}

fn default_task_app_directory() -> String {
    "app".to_string()
}

fn default_hard_kill_after_millis() -> u64 {
    3 * 60 * 1000
}

fn default_one() -> usize {
    1
}

fn default_check_threads_every_millis() -> u64 {
    5_000
}

fn default_idle_executor_shutdown_wait_millis() -> u64 {
    30_000
}

fn default_stop_driver_after_millis() -> u64 {
    5_000
}

fn default_shutdown_timeout_wait_millis() -> u64 {
    5 * 60 * 1000
}

fn default_max_task_message_length() -> usize {
    80
}

fn default_tail_log_lines_to_save() -> usize {
    500
}

fn default_service_finished_tail_log() -> String {
    "tail_of_finished_service.log".to_string()
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            task_definition_directory: PathBuf::new(),
            task_definition_suffix: default_task_definition_suffix(),
            service_log: default_service_log(),
            task_app_directory: default_task_app_directory(),
            hard_kill_after_millis: default_hard_kill_after_millis(),
            kill_threads: default_one(),
            thread_check_threads: default_one(),
            check_threads_every_millis: default_check_threads_every_millis(),
            idle_executor_shutdown_wait_millis: default_idle_executor_shutdown_wait_millis(),
            stop_driver_after_millis: default_stop_driver_after_millis(),
            shutdown_timeout_wait_millis: default_shutdown_timeout_wait_millis(),
            max_task_threads: None,
            max_task_message_length: default_max_task_message_length(),
            tail_log_lines_to_save: default_tail_log_lines_to_save(),
            service_finished_tail_log: default_service_finished_tail_log(),
            default_user: None,
        }
    }
}

/// `[logrotate]`: per-task rotation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogrotateSection {
    #[serde(default = "default_logrotate_command")]
    pub command: String,

    /// State file, relative to the task directory unless absolute.
    #[serde(default = "default_logrotate_state_file")]
    pub state_file: String,

    /// One generated config per task lands here.
    #[serde(default = "default_logrotate_conf_directory")]
    pub conf_directory: PathBuf,

    /// Rotated logs go here, relative to the task directory unless absolute.
    #[serde(default = "default_logrotate_to_directory")]
    pub to_directory: String,

    #[serde(default = "default_logrotate_maxage_days")]
    pub maxage_days: u32,

    #[serde(default = "default_logrotate_count")]
    pub count: u32,

    #[serde(default = "default_logrotate_dateformat")]
    pub dateformat: String,

    #[serde(default = "default_logrotate_extras_dateformat")]
    pub extras_dateformat: String,

    /// Extra files (globs relative to the task directory) rotated alongside
    /// the service log.
    #[serde(default)]
    pub extras_files: Vec<String>,

    /// Rotate by size instead of daily.
    #[serde(default)]
    pub rotate_after_bytes: Option<u64>,

    #[serde(default = "default_logrotate_timeout_millis")]
    pub command_timeout_millis: u64,
}

fn default_logrotate_command() -> String {
    "logrotate".to_string()
}

fn default_logrotate_state_file() -> String {
    "logrotate.status".to_string()
}

fn default_logrotate_conf_directory() -> PathBuf {
    PathBuf::from("/etc/logrotate.d")
}

fn default_logrotate_to_directory() -> String {
    "logs".to_string()
}

fn default_logrotate_maxage_days() -> u32 {
    7
}

fn default_logrotate_count() -> u32 {
    20
}

fn default_logrotate_dateformat() -> String {
    "-%Y%m%d%s".to_string()
}

fn default_logrotate_extras_dateformat() -> String {
    "-%Y%m%d".to_string()
}

fn default_logrotate_timeout_millis() -> u64 {
    60_000
}

impl Default for LogrotateSection {
    fn default() -> Self {
        Self {
            command: default_logrotate_command(),
            state_file: default_logrotate_state_file(),
            conf_directory: default_logrotate_conf_directory(),
            to_directory: default_logrotate_to_directory(),
            maxage_days: default_logrotate_maxage_days(),
            count: default_logrotate_count(),
            dateformat: default_logrotate_dateformat(),
            extras_dateformat: default_logrotate_extras_dateformat(),
            extras_files: Vec::new(),
            rotate_after_bytes: None,
            command_timeout_millis: default_logrotate_timeout_millis(),
        }
    }
}

/// `[s3]`: log upload target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Section {
    #[serde(default)]
    pub bucket: String,

    /// Tokens: `%requestId`, `%taskId`, `%filename`, `%filebase`,
    /// `%fileext`, `%Y`, `%m`, `%d`, `%H`, `%M`, `%S`, `%s`, `%%`.
    #[serde(default = "default_key_pattern")]
    pub key_pattern: String,

    /// Object store endpoint; `s3://bucket/key` maps to
    /// `{endpoint}/{bucket}/{key}`.
    #[serde(default = "default_s3_endpoint")]
    pub endpoint: String,

    /// Extra globs (relative to the task directory) uploaded next to the
    /// service log.
    #[serde(default)]
    pub additional_files_to_backup: Vec<String>,

    #[serde(default = "default_upload_threads")]
    pub upload_threads: usize,

    #[serde(default = "default_upload_max_attempts")]
    pub upload_max_attempts: u32,

    #[serde(default = "default_upload_initial_backoff_millis")]
    pub upload_initial_backoff_millis: u64,

    #[serde(default = "default_upload_max_backoff_millis")]
    pub upload_max_backoff_millis: u64,

    /// Hard timeout for a single upload attempt.
    #[serde(default = "default_upload_attempt_timeout_millis")]
    pub upload_attempt_timeout_millis: u64,

    #[serde(default)]
    pub delivery: UploadDelivery,

    /// Where upload metadata files are written when `delivery = "metadata"`.
    #[serde(default)]
    pub metadata_directory: PathBuf,

    #[serde(default = "default_s3_metadata_suffix")]
    pub metadata_suffix: String,

    /// How often the uploader daemon rescans for metadata it could not finish.
    #[serde(default = "default_rescan_interval_millis")]
    pub rescan_interval_millis: u64,
}

fn default_key_pattern() -> String {
    "%requestId/%Y/%m/%taskId/%filename".to_string()
}

fn default_s3_endpoint() -> String {
    "https://s3.amazonaws.com".to_string()
}

fn default_upload_threads() -> usize {
    4
}

fn default_upload_max_attempts() -> u32 {
    3
}

fn default_upload_initial_backoff_millis() -> u64 {
    500
}

fn default_upload_max_backoff_millis() -> u64 {
    10_000
}

fn default_upload_attempt_timeout_millis() -> u64 {
    5 * 60 * 1000
}

fn default_s3_metadata_suffix() -> String {
    ".s3.json".to_string()
}

fn default_rescan_interval_millis() -> u64 {
    60_000
}

impl Default for S3Section {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            key_pattern: default_key_pattern(),
            endpoint: default_s3_endpoint(),
            additional_files_to_backup: Vec::new(),
            upload_threads: default_upload_threads(),
            upload_max_attempts: default_upload_max_attempts(),
            upload_initial_backoff_millis: default_upload_initial_backoff_millis(),
            upload_max_backoff_millis: default_upload_max_backoff_millis(),
            upload_attempt_timeout_millis: default_upload_attempt_timeout_millis(),
            delivery: UploadDelivery::default(),
            metadata_directory: PathBuf::new(),
            metadata_suffix: default_s3_metadata_suffix(),
            rescan_interval_millis: default_rescan_interval_millis(),
        }
    }
}

/// `[artifacts]`: bootstrap artifact fetching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactsSection {
    #[serde(default)]
    pub use_local_download_service: bool,

    #[serde(default = "default_download_service_socket")]
    pub local_download_service_socket: PathBuf,

    #[serde(default = "default_download_service_timeout_millis")]
    pub local_download_service_timeout_millis: u64,

    /// Staging area of the download service.
    #[serde(default = "default_download_service_staging")]
    pub local_download_service_staging_directory: PathBuf,

    /// Staged transfers older than this are evicted and fetched again.
    #[serde(default = "default_download_service_retention_millis")]
    pub local_download_service_retention_millis: u64,

    #[serde(default = "default_fetch_timeout_millis")]
    pub fetch_timeout_millis: u64,

    #[serde(default = "default_download_threads")]
    pub download_threads: usize,

    /// Artifacts with a `cacheKey` are kept here between tasks.
    #[serde(default)]
    pub cache_directory: Option<PathBuf>,

    #[serde(default = "default_fetch_initial_backoff_millis")]
    pub retry_initial_backoff_millis: u64,

    #[serde(default = "default_fetch_max_backoff_millis")]
    pub retry_max_backoff_millis: u64,
}

fn default_download_service_socket() -> PathBuf {
    PathBuf::from("/var/run/nodeward/download.sock")
}

fn default_download_service_timeout_millis() -> u64 {
    3 * 60 * 1000
}

fn default_download_service_staging() -> PathBuf {
    PathBuf::from("/var/cache/nodeward/downloads")
}

fn default_download_service_retention_millis() -> u64 {
    6 * 60 * 60 * 1000
}

fn default_fetch_timeout_millis() -> u64 {
    30 * 60 * 1000
}

fn default_download_threads() -> usize {
    25
}

fn default_fetch_initial_backoff_millis() -> u64 {
    1_000
}

fn default_fetch_max_backoff_millis() -> u64 {
    30_000
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        Self {
            use_local_download_service: false,
            local_download_service_socket: default_download_service_socket(),
            local_download_service_timeout_millis: default_download_service_timeout_millis(),
            local_download_service_staging_directory: default_download_service_staging(),
            local_download_service_retention_millis: default_download_service_retention_millis(),
            fetch_timeout_millis: default_fetch_timeout_millis(),
            download_threads: default_download_threads(),
            cache_directory: None,
            retry_initial_backoff_millis: default_fetch_initial_backoff_millis(),
            retry_max_backoff_millis: default_fetch_max_backoff_millis(),
        }
    }
}

/// `[cleanup]`: the reaper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupSection {
    #[serde(default)]
    pub results_directory: PathBuf,

    #[serde(default = "default_cleanup_results_suffix")]
    pub results_suffix: String,

    /// Minimum age of a CleanupRecord before its task may be reclaimed.
    #[serde(default = "default_grace_period_millis")]
    pub grace_period_millis: u64,

    /// Abort the sweep when the live task list cannot be confirmed.
    #[serde(default = "default_true")]
    pub safe_mode: bool,

    #[serde(default = "default_sweep_interval_millis")]
    pub sweep_interval_millis: u64,

    /// Endpoint returning a JSON array of live task ids.
    #[serde(default)]
    pub live_tasks_url: Option<String>,

    #[serde(default = "default_live_tasks_timeout_millis")]
    pub live_tasks_timeout_millis: u64,
}

fn default_cleanup_results_suffix() -> String {
    ".cleanup.json".to_string()
}

fn default_grace_period_millis() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval_millis() -> u64 {
    5 * 60 * 1000
}

fn default_live_tasks_timeout_millis() -> u64 {
    30_000
}

impl Default for CleanupSection {
    fn default() -> Self {
        Self {
            results_directory: PathBuf::new(),
            results_suffix: default_cleanup_results_suffix(),
            grace_period_millis: default_grace_period_millis(),
            safe_mode: default_true(),
            sweep_interval_millis: default_sweep_interval_millis(),
            live_tasks_url: None,
            live_tasks_timeout_millis: default_live_tasks_timeout_millis(),
        }
    }
}

/// `[logwatcher]`: metadata telling log forwarders what to tail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogWatcherSection {
    /// Empty disables the metadata files.
    #[serde(default)]
    pub metadata_directory: PathBuf,

    #[serde(default = "default_logwatcher_suffix")]
    pub metadata_suffix: String,
}

fn default_logwatcher_suffix() -> String {
    ".tail.json".to_string()
}

impl Default for LogWatcherSection {
    fn default() -> Self {
        Self {
            metadata_directory: PathBuf::new(),
            metadata_suffix: default_logwatcher_suffix(),
        }
    }
}

/// `[history]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySection {
    /// JSON-lines file; unset disables history.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Upper bound on a single append; slower writes are dropped.
    #[serde(default = "default_history_timeout_millis")]
    pub timeout_millis: u64,
}

fn default_history_timeout_millis() -> u64 {
    5_000
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            path: None,
            timeout_millis: default_history_timeout_millis(),
        }
    }
}

/// `[webhooks]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhooksSection {
    #[serde(default)]
    pub urls: Vec<String>,

    #[serde(default = "default_http_timeout_millis")]
    pub timeout_millis: u64,
}

impl Default for WebhooksSection {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            timeout_millis: default_http_timeout_millis(),
        }
    }
}

/// `[scheduler]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Status updates are POSTed here; unset logs them instead.
    #[serde(default)]
    pub status_url: Option<String>,

    #[serde(default = "default_http_timeout_millis")]
    pub timeout_millis: u64,
}

fn default_http_timeout_millis() -> u64 {
    10_000
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            status_url: None,
            timeout_millis: default_http_timeout_millis(),
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: Option<String>,

    /// Keys whose values are masked when the config is printed.
    #[serde(default)]
    pub obfuscate_keys: Vec<String>,
}

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nodeward::artifacts::{ArtifactStore, ObjectStore};
use nodeward::config::model::ConfigFile;
use nodeward::events::{DeployEventNotifier, LoggingDeploySink, TaskHistoryRecorder};
use nodeward::exec::idle::ActivityTracker;
use nodeward::exec::{ProcessBackend, StatusReporter, SupervisorDeps};
use nodeward::fs::{FileSystem, RealFileSystem};
use nodeward::logs::LogRotationPlanner;
use nodeward::model::{ArtifactReference, DeployMarker, ResourceLimits, TaskDescriptor};
use nodeward::pool::WorkerPools;
use nodeward::types::UploadDelivery;
use nodeward::upload::ArtifactUploader;

/// Builder for a `ConfigFile` whose every directory lives under one root,
/// with timings short enough for tests.
pub struct ConfigFileBuilder {
    config: ConfigFile,
}

impl ConfigFileBuilder {
    pub fn new(root: &Path) -> Self {
        let mut config = ConfigFile::default();

        let ex = &mut config.executor;
        ex.task_definition_directory = root.join("definitions");
        ex.check_threads_every_millis = 20;
        ex.hard_kill_after_millis = 500;
        ex.idle_executor_shutdown_wait_millis = 200;
        ex.stop_driver_after_millis = 200;
        ex.shutdown_timeout_wait_millis = 5_000;
        ex.tail_log_lines_to_save = 10;

        let lr = &mut config.logrotate;
        lr.command = "true".to_string();
        lr.conf_directory = root.join("logrotate.d");
        lr.command_timeout_millis = 5_000;

        let s3 = &mut config.s3;
        s3.bucket = "task-logs".to_string();
        s3.key_pattern = "%requestId/%taskId/%filename".to_string();
        s3.upload_initial_backoff_millis = 10;
        s3.upload_max_backoff_millis = 20;
        s3.upload_attempt_timeout_millis = 5_000;
        s3.metadata_directory = root.join("upload-requests");
        s3.rescan_interval_millis = 200;

        let art = &mut config.artifacts;
        art.fetch_timeout_millis = 5_000;
        art.retry_initial_backoff_millis = 10;
        art.retry_max_backoff_millis = 50;
        art.local_download_service_staging_directory = root.join("staging");
        art.local_download_service_socket = root.join("download.sock");
        art.local_download_service_timeout_millis = 5_000;

        config.cleanup.results_directory = root.join("cleanup");
        config.cleanup.grace_period_millis = 60_000;
        config.cleanup.live_tasks_timeout_millis = 1_000;
        config.logwatcher.metadata_directory = root.join("tail-metadata");

        Self { config }
    }

    pub fn hard_kill_after_millis(mut self, ms: u64) -> Self {
        self.config.executor.hard_kill_after_millis = ms;
        self
    }

    pub fn check_every_millis(mut self, ms: u64) -> Self {
        self.config.executor.check_threads_every_millis = ms;
        self
    }

    pub fn max_task_threads(mut self, n: usize) -> Self {
        self.config.executor.max_task_threads = Some(n);
        self
    }

    pub fn additional_file(mut self, pattern: &str) -> Self {
        self.config.s3.additional_files_to_backup.push(pattern.to_string());
        self
    }

    pub fn delivery(mut self, delivery: UploadDelivery) -> Self {
        self.config.s3.delivery = delivery;
        self
    }

    pub fn safe_mode(mut self, on: bool) -> Self {
        self.config.cleanup.safe_mode = on;
        self
    }

    pub fn grace_period_millis(mut self, ms: u64) -> Self {
        self.config.cleanup.grace_period_millis = ms;
        self
    }

    pub fn build(self) -> ConfigFile {
        self.config
    }
}

/// Builder for `TaskDescriptor`.
pub struct TaskDescriptorBuilder {
    task: TaskDescriptor,
}

impl TaskDescriptorBuilder {
    pub fn new(task_id: &str, app_directory: impl Into<PathBuf>) -> Self {
        Self {
            task: TaskDescriptor {
                task_id: task_id.to_string(),
                request_name: "req-1".to_string(),
                app_directory: app_directory.into(),
                command: "./run.sh".to_string(),
                artifacts: vec![],
                limits: ResourceLimits::default(),
                user: None,
                env: Default::default(),
                deploy: None,
            },
        }
    }

    pub fn request(mut self, name: &str) -> Self {
        self.task.request_name = name.to_string();
        self
    }

    pub fn command(mut self, cmd: &str) -> Self {
        self.task.command = cmd.to_string();
        self
    }

    pub fn artifact(mut self, uri: &str, target: &str) -> Self {
        self.task.artifacts.push(ArtifactReference::new(uri, target));
        self
    }

    pub fn max_threads(mut self, n: u32) -> Self {
        self.task.limits.max_threads = Some(n);
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.task.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn deploy(mut self, request_id: &str, deploy_id: &str) -> Self {
        self.task.deploy = Some(DeployMarker::new(request_id, deploy_id));
        self
    }

    pub fn build(self) -> TaskDescriptor {
        self.task
    }
}

/// Supervisor collaborators wired to the given fakes. History is disabled,
/// deploy events are only logged and the real filesystem is used.
pub fn supervisor_deps(
    config: ConfigFile,
    backend: Arc<dyn ProcessBackend>,
    store: Arc<dyn ObjectStore>,
    reporter: Arc<dyn StatusReporter>,
) -> anyhow::Result<SupervisorDeps> {
    let config = Arc::new(config);
    let pools = WorkerPools::from_config(&config);
    let history = TaskHistoryRecorder::disabled();
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);

    Ok(SupervisorDeps {
        backend,
        artifacts: ArtifactStore::from_config(
            &config.artifacts,
            Arc::clone(&store),
            pools.download.clone(),
        ),
        rotation: LogRotationPlanner::new(Arc::clone(&config)),
        uploader: ArtifactUploader::new(store, Arc::clone(&config), pools.upload.clone())?,
        reporter,
        deploys: DeployEventNotifier::new(Arc::new(LoggingDeploySink), history.clone()),
        history,
        fs,
        pools,
        activity: Arc::new(ActivityTracker::new()),
        config,
    })
}

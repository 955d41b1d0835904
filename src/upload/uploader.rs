// src/upload/uploader.rs

//! Finished-task log upload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::artifacts::object_store::ObjectStore;
use crate::config::model::{ConfigFile, S3Section};
use crate::errors::UploadError;
use crate::fs::FileSystem;
use crate::model::task::{sanitize_task_id, TaskDescriptor};
use crate::pool::BoundedPool;
use crate::retry::RetryPolicy;
use crate::types::{TaskOutcome, TerminationOutcome};
use crate::upload::key::{render_key, KeyContext};
use crate::upload::patterns::UploadProfile;

/// Everything needed to upload a finished task's files. Also the on-disk
/// form of an upload metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub task_id: String,
    pub request_name: String,
    pub task_directory: PathBuf,
    pub outcome: TaskOutcome,
    pub finished_at: DateTime<Utc>,
}

impl UploadRequest {
    pub fn new(task: &TaskDescriptor, outcome: &TerminationOutcome) -> Self {
        Self {
            task_id: task.task_id.clone(),
            request_name: task.request_name.clone(),
            task_directory: task.app_directory.clone(),
            outcome: outcome.outcome,
            finished_at: outcome.finished_at,
        }
    }

    pub fn path_for(cfg: &S3Section, task_id: &str) -> PathBuf {
        cfg.metadata_directory
            .join(format!("{}{}", sanitize_task_id(task_id), cfg.metadata_suffix))
    }

    pub fn write(&self, fs: &dyn FileSystem, cfg: &S3Section) -> Result<PathBuf> {
        let path = Self::path_for(cfg, &self.task_id);
        let json = serde_json::to_vec_pretty(self).context("serializing upload request")?;
        fs.write_atomic(&path, &json)?;
        Ok(path)
    }

    pub fn read(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        let text = fs.read_to_string(path)?;
        serde_json::from_str(&text).with_context(|| format!("parsing upload request {:?}", path))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUploadResult {
    pub path: PathBuf,
    pub key: String,
    pub attempts: u32,
    pub error: Option<UploadError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub task_id: String,
    pub files: Vec<FileUploadResult>,
}

impl UploadReport {
    pub fn uploaded(&self) -> impl Iterator<Item = &FileUploadResult> {
        self.files.iter().filter(|f| f.error.is_none())
    }

    pub fn failed(&self) -> impl Iterator<Item = &FileUploadResult> {
        self.files.iter().filter(|f| f.error.is_some())
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactUploader {
    store: Arc<dyn ObjectStore>,
    config: Arc<ConfigFile>,
    profile: UploadProfile,
    pool: BoundedPool,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl ArtifactUploader {
    pub fn new(store: Arc<dyn ObjectStore>, config: Arc<ConfigFile>, pool: BoundedPool) -> Result<Self> {
        let s3 = &config.s3;
        let retry = RetryPolicy::new(
            s3.upload_max_attempts,
            s3.upload_initial_backoff_millis,
            s3.upload_max_backoff_millis,
        );
        let attempt_timeout = Duration::from_millis(s3.upload_attempt_timeout_millis);
        let profile = UploadProfile::from_config(&config)?;
        Ok(Self {
            store,
            config,
            profile,
            pool,
            retry,
            attempt_timeout,
        })
    }

    /// Upload every matching file of a finished task. Per-file failures are
    /// recorded in the report; they never stop sibling uploads.
    pub async fn upload_completed(
        &self,
        task: &TaskDescriptor,
        outcome: &TerminationOutcome,
    ) -> Result<UploadReport> {
        self.upload_request(&UploadRequest::new(task, outcome)).await
    }

    pub async fn upload_request(&self, req: &UploadRequest) -> Result<UploadReport> {
        let candidates = self.profile.collect_upload_candidates(&req.task_directory)?;
        let ctx = KeyContext {
            request_id: &req.request_name,
            task_id: &req.task_id,
            finished_at: req.finished_at,
        };

        let mut set = JoinSet::new();
        for path in candidates {
            let key = render_key(&self.config.s3.key_pattern, &ctx, &path);
            let job = UploadJob {
                store: Arc::clone(&self.store),
                pool: self.pool.clone(),
                retry: self.retry,
                attempt_timeout: self.attempt_timeout,
                bucket: self.config.s3.bucket.clone(),
                key,
                path,
            };
            set.spawn(job.run());
        }

        let mut files = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => files.push(result),
                Err(e) => warn!(task_id = %req.task_id, error = %e, "upload job panicked"),
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let report = UploadReport {
            task_id: req.task_id.clone(),
            files,
        };
        info!(
            task_id = %req.task_id,
            uploaded = report.uploaded().count(),
            failed = report.failed().count(),
            "task upload finished"
        );
        Ok(report)
    }
}

struct UploadJob {
    store: Arc<dyn ObjectStore>,
    pool: BoundedPool,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    bucket: String,
    key: String,
    path: PathBuf,
}

impl UploadJob {
    async fn run(self) -> FileUploadResult {
        let store = &self.store;
        let pool = &self.pool;
        let bucket = self.bucket.as_str();
        let key = self.key.as_str();
        let path = self.path.as_path();
        let limit = self.attempt_timeout;

        let retried = self
            .retry
            .run(
                "upload",
                |_| async move {
                    pool.run(async {
                        match timeout(limit, store.put(bucket, key, path)).await {
                            Ok(result) => result.map_err(UploadError::from),
                            Err(_) => Err(UploadError::Timeout(limit.as_millis() as u64)),
                        }
                    })
                    .await
                },
                UploadError::is_retryable,
            )
            .await;

        match &retried.result {
            Ok(()) => info!(key = %self.key, file = %self.path.display(), "uploaded"),
            Err(e) => warn!(
                key = %self.key,
                file = %self.path.display(),
                attempts = retried.attempts,
                error = %e,
                "upload failed"
            ),
        }

        FileUploadResult {
            error: retried.result.err(),
            attempts: retried.attempts,
            key: self.key,
            path: self.path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::artifacts::object_store::FsObjectStore;
    use crate::errors::ObjectStoreError;
    use crate::model::task::ResourceLimits;

    /// Fails the first `failures` puts of every key containing `flaky`.
    #[derive(Debug)]
    struct FlakyStore {
        inner: FsObjectStore,
        failures: u32,
        seen: Mutex<BTreeMap<String, u32>>,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn get(&self, uri: &str, dest: &Path) -> Result<u64, ObjectStoreError> {
            self.inner.get(uri, dest).await
        }

        async fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), ObjectStoreError> {
            if key.contains("flaky") {
                let mut seen = self.seen.lock().expect("lock");
                let count = seen.entry(key.to_string()).or_insert(0);
                *count += 1;
                if *count <= self.failures {
                    return Err(ObjectStoreError::Unreachable("connection reset".into()));
                }
            }
            if key.contains("denied") {
                return Err(ObjectStoreError::Rejected("403".into()));
            }
            self.inner.put(bucket, key, source).await
        }
    }

    fn fixture(root: &Path) -> (TaskDescriptor, TerminationOutcome) {
        let task = TaskDescriptor {
            task_id: "t1".into(),
            request_name: "web".into(),
            app_directory: root.to_path_buf(),
            command: "true".into(),
            artifacts: vec![],
            limits: ResourceLimits::default(),
            user: None,
            env: BTreeMap::new(),
            deploy: None,
        };
        let outcome = TerminationOutcome {
            task_id: "t1".into(),
            outcome: TaskOutcome::Success,
            reason: "exited 0".into(),
            exit_code: Some(0),
            process_started: true,
            finished_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single().expect("time"),
        };
        (task, outcome)
    }

    fn config(additional: &[&str]) -> Arc<ConfigFile> {
        let mut cfg = ConfigFile::default();
        cfg.s3.bucket = "logs".into();
        cfg.s3.key_pattern = "%requestId/%taskId/%filename".into();
        cfg.s3.upload_initial_backoff_millis = 1;
        cfg.s3.upload_max_backoff_millis = 2;
        cfg.s3.additional_files_to_backup = additional.iter().map(|s| s.to_string()).collect();
        Arc::new(cfg)
    }

    #[tokio::test]
    async fn transient_failures_are_retried_and_failures_isolated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let task_dir = dir.path().join("task");
        std::fs::create_dir_all(task_dir.join("app")).expect("mkdir");
        std::fs::write(task_dir.join("service.log"), b"log").expect("write");
        std::fs::write(task_dir.join("app/flaky.log"), b"f").expect("write");
        std::fs::write(task_dir.join("app/denied.log"), b"d").expect("write");

        let store = Arc::new(FlakyStore {
            inner: FsObjectStore::new(dir.path().join("store")),
            failures: 2,
            seen: Mutex::new(BTreeMap::new()),
        });
        let uploader = ArtifactUploader::new(
            store,
            config(&["app/*.log"]),
            BoundedPool::new("upload", 2),
        )
        .expect("uploader");

        let (task, outcome) = fixture(&task_dir);
        let report = uploader.upload_completed(&task, &outcome).await.expect("report");

        assert_eq!(report.files.len(), 3);
        let by_key = |k: &str| report.files.iter().find(|f| f.key == k).expect("file");
        assert_eq!(by_key("web/t1/flaky.log").attempts, 3);
        assert!(by_key("web/t1/flaky.log").error.is_none());
        assert_eq!(by_key("web/t1/denied.log").attempts, 1);
        assert!(by_key("web/t1/denied.log").error.is_some());
        assert!(dir.path().join("store/logs/web/t1/service.log").is_file());
    }

    #[test]
    fn upload_request_metadata_round_trip() {
        let fs = crate::fs::mock::MockFileSystem::new();
        let mut s3 = S3Section::default();
        s3.metadata_directory = PathBuf::from("/var/lib/uploads");
        let (task, outcome) = fixture(Path::new("/tasks/t1"));

        let req = UploadRequest::new(&task, &outcome);
        let path = req.write(&fs, &s3).expect("write");
        assert_eq!(path, PathBuf::from("/var/lib/uploads/t1.s3.json"));
        assert_eq!(UploadRequest::read(&fs, &path).expect("read"), req);
    }
}

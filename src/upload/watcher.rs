// src/upload/watcher.rs

//! The `uploader` daemon: performs uploads described by metadata files that
//! supervisors drop when `[s3].delivery = "metadata"`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::model::S3Section;
use crate::fs::FileSystem;
use crate::model::task::has_suffix;
use crate::upload::uploader::{ArtifactUploader, UploadRequest};
use crate::watch::watch_directory;

#[derive(Debug, Clone)]
pub struct MetadataUploader {
    fs: Arc<dyn FileSystem>,
    uploader: ArtifactUploader,
    cfg: S3Section,
}

impl MetadataUploader {
    pub fn new(fs: Arc<dyn FileSystem>, uploader: ArtifactUploader, cfg: S3Section) -> Self {
        Self { fs, uploader, cfg }
    }

    /// Upload one metadata file and delete it. Returns `false` when the file
    /// was already gone (a duplicate watch event).
    pub async fn process(&self, path: &Path) -> Result<bool> {
        if !self.fs.is_file(path) {
            return Ok(false);
        }
        let req = UploadRequest::read(self.fs.as_ref(), path)?;
        let report = self.uploader.upload_request(&req).await?;
        if report.failed().next().is_some() {
            warn!(
                task_id = %req.task_id,
                failed = report.failed().count(),
                "some files could not be uploaded; giving up on them"
            );
        }
        self.fs.remove_file(path)?;
        Ok(true)
    }

    async fn process_logged(&self, path: &Path) {
        match self.process(path).await {
            Ok(true) => debug!(metadata = %path.display(), "upload metadata processed"),
            Ok(false) => {}
            Err(e) => warn!(metadata = %path.display(), error = %e, "upload metadata failed"),
        }
    }

    /// Process every pending metadata file. Returns how many were handled.
    pub async fn rescan(&self) -> Result<usize> {
        let dir = &self.cfg.metadata_directory;
        if !self.fs.is_dir(dir) {
            return Ok(0);
        }
        let mut pending: Vec<_> = self
            .fs
            .read_dir(dir)?
            .into_iter()
            .filter(|p| has_suffix(p, &self.cfg.metadata_suffix))
            .collect();
        pending.sort();

        let count = pending.len();
        for path in pending {
            self.process_logged(&path).await;
        }
        Ok(count)
    }

    /// Watch the metadata directory until cancelled, rescanning periodically
    /// for files whose events were missed or whose upload failed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let dir = self.cfg.metadata_directory.clone();
        self.fs.create_dir_all(&dir)?;
        let (_watcher, mut events) = watch_directory(&dir, &self.cfg.metadata_suffix)?;

        let mut tick = interval(Duration::from_millis(self.cfg.rescan_interval_millis.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(dir = %dir.display(), "uploader daemon started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(path) = events.recv() => self.process_logged(&path).await,
                _ = tick.tick() => {
                    if let Err(e) = self.rescan().await {
                        warn!(error = %e, "upload metadata rescan failed");
                    }
                }
            }
        }
        info!("uploader daemon stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::artifacts::object_store::FsObjectStore;
    use crate::config::model::ConfigFile;
    use crate::fs::RealFileSystem;
    use crate::pool::BoundedPool;
    use crate::types::TaskOutcome;

    #[tokio::test]
    async fn rescan_uploads_and_removes_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let task_dir = dir.path().join("task");
        std::fs::create_dir_all(&task_dir).expect("mkdir");
        std::fs::write(task_dir.join("service.log"), b"bye").expect("write");

        let mut cfg = ConfigFile::default();
        cfg.s3.bucket = "logs".into();
        cfg.s3.key_pattern = "%taskId/%filename".into();
        cfg.s3.metadata_directory = dir.path().join("meta");
        let cfg = Arc::new(cfg);

        let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
        let req = UploadRequest {
            task_id: "t9".into(),
            request_name: "web".into(),
            task_directory: task_dir,
            outcome: TaskOutcome::Failed,
            finished_at: Utc::now(),
        };
        let meta = req.write(fs.as_ref(), &cfg.s3).expect("write");

        let uploader = ArtifactUploader::new(
            Arc::new(FsObjectStore::new(dir.path().join("store"))),
            Arc::clone(&cfg),
            BoundedPool::new("upload", 1),
        )
        .expect("uploader");
        let daemon = MetadataUploader::new(Arc::clone(&fs), uploader, cfg.s3.clone());

        assert_eq!(daemon.rescan().await.expect("rescan"), 1);
        assert!(!meta.exists());
        assert!(dir.path().join("store/logs/t9/service.log").is_file());
        assert!(!daemon.process(&meta).await.expect("duplicate event"));
    }
}

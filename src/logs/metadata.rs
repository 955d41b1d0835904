// src/logs/metadata.rs

//! Log-watcher metadata: tells log forwarders which file to tail for a task
//! and when the task is done writing to it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::model::LogWatcherSection;
use crate::fs::FileSystem;
use crate::model::task::sanitize_task_id;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TailMetadata {
    pub task_id: String,
    pub request_name: String,
    pub filename: PathBuf,
    pub tag: String,
    pub finished: bool,
}

impl TailMetadata {
    pub fn for_service_log(task_id: &str, request_name: &str, service_log: &Path) -> Self {
        Self {
            task_id: task_id.to_string(),
            request_name: request_name.to_string(),
            filename: service_log.to_path_buf(),
            tag: "service".to_string(),
            finished: false,
        }
    }

    /// `None` when no metadata directory is configured.
    pub fn path_for(cfg: &LogWatcherSection, task_id: &str) -> Option<PathBuf> {
        if cfg.metadata_directory.as_os_str().is_empty() {
            return None;
        }
        Some(
            cfg.metadata_directory
                .join(format!("{}{}", sanitize_task_id(task_id), cfg.metadata_suffix)),
        )
    }

    /// Write (or rewrite) the metadata file. Returns the path written, if any.
    pub fn write(&self, fs: &dyn FileSystem, cfg: &LogWatcherSection) -> Result<Option<PathBuf>> {
        let Some(path) = Self::path_for(cfg, &self.task_id) else {
            return Ok(None);
        };
        let json = serde_json::to_vec_pretty(self).context("serializing tail metadata")?;
        fs.write_atomic(&path, &json)?;
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    #[test]
    fn disabled_without_directory() {
        let fs = MockFileSystem::new();
        let meta = TailMetadata::for_service_log("t1", "web", Path::new("/tasks/t1/service.log"));
        assert_eq!(meta.write(&fs, &LogWatcherSection::default()).expect("write"), None);
    }

    #[test]
    fn rewritten_when_finished() {
        let fs = MockFileSystem::new();
        let cfg = LogWatcherSection {
            metadata_directory: PathBuf::from("/var/lib/tail"),
            ..LogWatcherSection::default()
        };
        let mut meta = TailMetadata::for_service_log("a/b", "web", Path::new("/tasks/ab/service.log"));
        let path = meta.write(&fs, &cfg).expect("write").expect("enabled");
        assert_eq!(path, PathBuf::from("/var/lib/tail/a_b.tail.json"));

        meta.finished = true;
        meta.write(&fs, &cfg).expect("rewrite");
        let back: TailMetadata =
            serde_json::from_str(&fs.read_to_string(&path).expect("read")).expect("parse");
        assert!(back.finished);
        assert_eq!(back.request_name, "web");
    }
}

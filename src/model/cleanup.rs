// src/model/cleanup.rs

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::model::CleanupSection;
use crate::fs::FileSystem;
use crate::model::task::sanitize_task_id;
use crate::types::TaskOutcome;

/// Written by the supervisor when a task finishes; consumed by the reaper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRecord {
    pub task_id: String,
    pub request_name: String,
    pub outcome: TaskOutcome,
    pub app_directory: PathBuf,
    /// Milliseconds since the Unix epoch.
    pub finished_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CleanupRecord {
    pub fn path_for(cfg: &CleanupSection, task_id: &str) -> PathBuf {
        cfg.results_directory
            .join(format!("{}{}", sanitize_task_id(task_id), cfg.results_suffix))
    }

    pub fn finished_at_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.finished_at)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Age relative to `now`; negative ages (clock skew) count as zero.
    pub fn age_millis(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from(now.timestamp_millis() - self.finished_at).unwrap_or(0)
    }

    pub fn write(&self, fs: &dyn FileSystem, cfg: &CleanupSection) -> Result<PathBuf> {
        let path = Self::path_for(cfg, &self.task_id);
        let json = serde_json::to_vec_pretty(self).context("serializing cleanup record")?;
        fs.write_atomic(&path, &json)?;
        Ok(path)
    }

    pub fn read(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        let text = fs.read_to_string(path)?;
        serde_json::from_str(&text).with_context(|| format!("parsing cleanup record {:?}", path))
    }
}

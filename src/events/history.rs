// src/events/history.rs

//! Append-only task history.
//!
//! The recorder never fails its caller: every sink error is logged and
//! dropped, and an append that outlives the recorder's timeout is abandoned.

use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::warn;

use crate::exec::state::TaskState;
use crate::model::deploy::DeployEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusRecord {
    pub task_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployEventRecord {
    pub request_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub payload: serde_json::Value,
    pub driver_status: String,
    pub timestamp: DateTime<Utc>,
}

/// One line of the history file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    TaskStatus(TaskStatusRecord),
    DeployEvent(DeployEventRecord),
}

#[async_trait]
pub trait HistorySink: Send + Sync + Debug {
    async fn append(&self, entry: &HistoryEntry) -> Result<()>;
}

/// Appends one JSON object per line.
#[derive(Debug)]
pub struct JsonLinesHistorySink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesHistorySink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl HistorySink for JsonLinesHistorySink {
    async fn append(&self, entry: &HistoryEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry).context("serializing history entry")?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening history file {:?}", self.path))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("appending to history file {:?}", self.path))?;
        file.flush().await?;
        Ok(())
    }
}

/// History disabled.
#[derive(Debug, Clone, Default)]
pub struct NullHistorySink;

#[async_trait]
impl HistorySink for NullHistorySink {
    async fn append(&self, _entry: &HistoryEntry) -> Result<()> {
        Ok(())
    }
}

/// Bound on one append unless configured otherwise.
pub const DEFAULT_APPEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TaskHistoryRecorder {
    sink: Arc<dyn HistorySink>,
    append_timeout: Duration,
}

impl TaskHistoryRecorder {
    pub fn new(sink: Arc<dyn HistorySink>) -> Self {
        Self {
            sink,
            append_timeout: DEFAULT_APPEND_TIMEOUT,
        }
    }

    pub fn with_append_timeout(mut self, append_timeout: Duration) -> Self {
        self.append_timeout = append_timeout;
        self
    }

    async fn append(&self, entry: &HistoryEntry) -> Result<()> {
        match timeout(self.append_timeout, self.sink.append(entry)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "history append timed out after {}ms",
                self.append_timeout.as_millis()
            )),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NullHistorySink))
    }

    pub async fn record_transition(&self, task_id: &str, state: TaskState, message: Option<&str>) {
        let entry = HistoryEntry::TaskStatus(TaskStatusRecord {
            task_id: task_id.to_string(),
            status: state.label().to_string(),
            message: message.map(str::to_string),
            timestamp: Utc::now(),
        });
        if let Err(e) = self.append(&entry).await {
            warn!(task_id, status = %state, error = %e, "failed to record task history");
        }
    }

    pub async fn record_deploy_event(
        &self,
        event: &DeployEvent,
        task_id: Option<&str>,
        driver_status: &str,
    ) {
        let payload = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to serialize deploy event for history");
                return;
            }
        };
        let entry = HistoryEntry::DeployEvent(DeployEventRecord {
            request_name: event.marker().request_id.clone(),
            task_id: task_id.map(str::to_string),
            payload,
            driver_status: driver_status.to_string(),
            timestamp: Utc::now(),
        });
        if let Err(e) = self.append(&entry).await {
            warn!(
                request = %event.marker().request_id,
                deploy_id = %event.marker().deploy_id,
                error = %e,
                "failed to record deploy event history"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskOutcome;

    #[derive(Debug)]
    struct BrokenSink;

    #[async_trait]
    impl HistorySink for BrokenSink {
        async fn append(&self, _entry: &HistoryEntry) -> Result<()> {
            Err(anyhow::anyhow!("disk full"))
        }
    }

    #[tokio::test]
    async fn appends_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history/agent.jsonl");
        let recorder = TaskHistoryRecorder::new(Arc::new(JsonLinesHistorySink::new(&path)));

        recorder.record_transition("t1", TaskState::Running, None).await;
        recorder
            .record_transition("t1", TaskState::Finished(TaskOutcome::Success), Some("exit 0"))
            .await;

        let text = std::fs::read_to_string(&path).expect("read");
        let entries: Vec<HistoryEntry> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(entries.len(), 2);
        match &entries[1] {
            HistoryEntry::TaskStatus(r) => {
                assert_eq!(r.status, "FINISHED_SUCCESS");
                assert_eq!(r.message.as_deref(), Some("exit 0"));
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[derive(Debug)]
    struct StuckSink;

    #[async_trait]
    impl HistorySink for StuckSink {
        async fn append(&self, _entry: &HistoryEntry) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_sink_is_abandoned_after_timeout() {
        let recorder = TaskHistoryRecorder::new(Arc::new(StuckSink))
            .with_append_timeout(Duration::from_secs(2));
        let started = tokio::time::Instant::now();
        recorder.record_transition("t1", TaskState::Running, None).await;
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn sink_errors_are_swallowed() {
        let recorder = TaskHistoryRecorder::new(Arc::new(BrokenSink));
        recorder.record_transition("t1", TaskState::Running, None).await;
    }
}

// src/cleanup/live_tasks.rs

//! The scheduler's authoritative list of live task ids.

use std::collections::HashSet;
use std::fmt::Debug;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

use crate::errors::CleanupError;

#[async_trait]
pub trait LiveTaskSource: Send + Sync + Debug {
    async fn live_task_ids(&self) -> Result<HashSet<String>, CleanupError>;
}

/// GETs a JSON array of task ids.
#[derive(Debug, Clone)]
pub struct HttpLiveTaskSource {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpLiveTaskSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building live task HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    fn classify(&self, err: reqwest::Error) -> CleanupError {
        if err.is_timeout() {
            CleanupError::LiveListTimeout(self.timeout.as_millis() as u64)
        } else {
            CleanupError::LiveListUnavailable(format!("{}: {err}", self.url))
        }
    }
}

#[async_trait]
impl LiveTaskSource for HttpLiveTaskSource {
    async fn live_task_ids(&self) -> Result<HashSet<String>, CleanupError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| self.classify(e))?;
        let ids: Vec<String> = response.json().await.map_err(|e| self.classify(e))?;
        Ok(ids.into_iter().collect())
    }
}

/// Used when no live-task endpoint is configured: the list is never
/// available, so a safe-mode reaper never deletes anything.
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredLiveTasks;

#[async_trait]
impl LiveTaskSource for UnconfiguredLiveTasks {
    async fn live_task_ids(&self) -> Result<HashSet<String>, CleanupError> {
        Err(CleanupError::LiveListUnavailable(
            "no live task endpoint configured".to_string(),
        ))
    }
}

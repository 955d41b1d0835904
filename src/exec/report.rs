// src/exec/report.rs

//! Scheduler-facing status reports.

use std::fmt::Debug;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub task_id: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait StatusReporter: Send + Sync + Debug {
    async fn report(&self, update: &StatusUpdate) -> Result<()>;
}

/// POSTs each update as JSON.
#[derive(Debug, Clone)]
pub struct HttpStatusReporter {
    client: reqwest::Client,
    url: String,
}

impl HttpStatusReporter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building status reporter HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl StatusReporter for HttpStatusReporter {
    async fn report(&self, update: &StatusUpdate) -> Result<()> {
        self.client
            .post(&self.url)
            .json(update)
            .send()
            .await
            .with_context(|| format!("sending status update to {}", self.url))?
            .error_for_status()
            .context("scheduler rejected status update")?;
        Ok(())
    }
}

/// Used when no scheduler endpoint is configured.
#[derive(Debug, Clone, Default)]
pub struct LoggingStatusReporter;

#[async_trait]
impl StatusReporter for LoggingStatusReporter {
    async fn report(&self, update: &StatusUpdate) -> Result<()> {
        info!(
            task_id = %update.task_id,
            state = %update.state,
            message = update.message.as_deref().unwrap_or(""),
            "task status"
        );
        Ok(())
    }
}

/// Cut `message` to at most `max_chars` characters.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

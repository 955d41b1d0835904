// src/events/deploy.rs

//! Deploy lifecycle notifications.
//!
//! Building an event is pure. Delivery is fire-and-forget: the notifier
//! hands the event to a sink on a detached task and records the delivery
//! result in history.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::history::TaskHistoryRecorder;
use crate::model::deploy::{DeployEvent, DeployMarker, DeployResult, DeploySpec};

#[async_trait]
pub trait DeploySink: Send + Sync + Debug {
    async fn deliver(&self, event: &DeployEvent) -> Result<()>;
}

/// POSTs the event JSON to every configured webhook.
#[derive(Debug, Clone)]
pub struct WebhookDeploySink {
    client: reqwest::Client,
    urls: Vec<String>,
}

impl WebhookDeploySink {
    pub fn new(urls: Vec<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook HTTP client")?;
        Ok(Self { client, urls })
    }
}

#[async_trait]
impl DeploySink for WebhookDeploySink {
    async fn deliver(&self, event: &DeployEvent) -> Result<()> {
        let mut failures = Vec::new();
        for url in &self.urls {
            let sent = self
                .client
                .post(url)
                .json(event)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            if let Err(e) = sent {
                failures.push(format!("{url}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("webhook delivery failed: {}", failures.join("; ")))
        }
    }
}

/// Used when no webhook is configured.
#[derive(Debug, Clone, Default)]
pub struct LoggingDeploySink;

#[async_trait]
impl DeploySink for LoggingDeploySink {
    async fn deliver(&self, event: &DeployEvent) -> Result<()> {
        info!(
            request = %event.marker().request_id,
            deploy_id = %event.marker().deploy_id,
            event_type = ?event.event_type(),
            "deploy event"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeployEventNotifier {
    sink: Arc<dyn DeploySink>,
    history: TaskHistoryRecorder,
}

impl DeployEventNotifier {
    pub fn new(sink: Arc<dyn DeploySink>, history: TaskHistoryRecorder) -> Self {
        Self { sink, history }
    }

    pub fn starting(marker: DeployMarker, deploy: Option<DeploySpec>) -> DeployEvent {
        DeployEvent::Starting {
            deploy_marker: marker,
            deploy,
        }
    }

    pub fn finished(
        marker: DeployMarker,
        deploy: Option<DeploySpec>,
        result: DeployResult,
    ) -> DeployEvent {
        DeployEvent::Finished {
            deploy_marker: marker,
            deploy,
            deploy_result: result,
        }
    }

    /// Deliver `event` in the background. The returned handle is only for
    /// callers that want to wait (tests, shutdown); dropping it is fine.
    pub fn notify(&self, event: DeployEvent, task_id: Option<String>) -> JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        let history = self.history.clone();
        tokio::spawn(async move {
            let driver_status = match sink.deliver(&event).await {
                Ok(()) => {
                    debug!(deploy_id = %event.marker().deploy_id, "deploy event delivered");
                    "DELIVERED"
                }
                Err(e) => {
                    warn!(
                        request = %event.marker().request_id,
                        deploy_id = %event.marker().deploy_id,
                        error = %e,
                        "deploy event delivery failed"
                    );
                    "DELIVERY_FAILED"
                }
            };
            history
                .record_deploy_event(&event, task_id.as_deref(), driver_status)
                .await;
        })
    }
}

// src/model/deploy.rs

//! Deploy lifecycle events.
//!
//! The webhook payload is
//! `{"eventType": "...", "deployMarker": {...}, "deploy"?: {...}, "deployResult"?: {...}}`.
//! `DeployEvent` is an enum tagged on `eventType`, so a FINISHED event
//! without a result cannot be built.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployMarker {
    pub request_id: String,
    pub deploy_id: String,
}

impl DeployMarker {
    pub fn new(request_id: impl Into<String>, deploy_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            deploy_id: deploy_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployOutcome {
    Succeeded,
    Failed,
    Canceled,
    Overdue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    pub outcome: DeployOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The deploy being rolled out, as far as the agent knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploySpec {
    pub request_id: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployEventType {
    Starting,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "eventType",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum DeployEvent {
    Starting {
        deploy_marker: DeployMarker,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deploy: Option<DeploySpec>,
    },
    Finished {
        deploy_marker: DeployMarker,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deploy: Option<DeploySpec>,
        deploy_result: DeployResult,
    },
}

impl DeployEvent {
    pub fn event_type(&self) -> DeployEventType {
        match self {
            DeployEvent::Starting { .. } => DeployEventType::Starting,
            DeployEvent::Finished { .. } => DeployEventType::Finished,
        }
    }

    pub fn marker(&self) -> &DeployMarker {
        match self {
            DeployEvent::Starting { deploy_marker, .. }
            | DeployEvent::Finished { deploy_marker, .. } => deploy_marker,
        }
    }

    pub fn result(&self) -> Option<&DeployResult> {
        match self {
            DeployEvent::Starting { .. } => None,
            DeployEvent::Finished { deploy_result, .. } => Some(deploy_result),
        }
    }
}

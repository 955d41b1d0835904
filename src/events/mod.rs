// src/events/mod.rs

//! Deploy notifications and task history.

pub mod deploy;
pub mod history;

pub use deploy::{DeployEventNotifier, DeploySink, LoggingDeploySink, WebhookDeploySink};
pub use history::{HistorySink, JsonLinesHistorySink, NullHistorySink, TaskHistoryRecorder};

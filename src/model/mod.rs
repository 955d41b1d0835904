// src/model/mod.rs

//! On-disk and on-wire data shared by the agent's components.

pub mod cleanup;
pub mod deploy;
pub mod task;

pub use cleanup::CleanupRecord;
pub use deploy::{DeployEvent, DeployEventType, DeployMarker, DeployOutcome, DeployResult, DeploySpec};
pub use task::{ArtifactReference, ResourceLimits, TaskDescriptor, TaskPaths};

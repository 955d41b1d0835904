// src/errors.rs

//! Crate-wide error types.
//!
//! Each subsystem has its own error enum so callers can match on the failure
//! class (retryable, fatal-to-task, safety abort). `AgentError` is the
//! umbrella used at the daemon / CLI level.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::validate::ConfigViolation;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("invalid configuration:\n{}", format_violations(.0))]
    InvalidConfig(Vec<ConfigViolation>),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Rotation(#[from] RotationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_violations(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("  - {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Failure classes for materializing a task artifact.
///
/// `Clone` because a single coalesced transfer fans its result out to every
/// waiter. The serde form is the wire shape used by the local download
/// service (`{"kind": "...", "message": ...}`).
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ArtifactError {
    #[error("artifact source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("artifact source rejected the request: {0}")]
    SourceRejected(String),

    #[error("artifact checksum or format error: {0}")]
    ChecksumOrFormat(String),

    #[error("local I/O error while materializing artifact: {0}")]
    LocalIo(String),

    #[error("artifact fetch timed out after {0} ms")]
    Timeout(u64),
}

impl ArtifactError {
    /// Only an unreachable source is worth retrying; everything else is fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ArtifactError::SourceUnreachable(_))
    }
}

/// Errors returned by an [`ObjectStore`](crate::artifacts::object_store::ObjectStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object store unreachable: {0}")]
    Unreachable(String),

    #[error("object store rejected request: {0}")]
    Rejected(String),

    #[error("local I/O error: {0}")]
    Io(String),
}

impl From<ObjectStoreError> for ArtifactError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound(m) => ArtifactError::NotFound(m),
            ObjectStoreError::Unreachable(m) => ArtifactError::SourceUnreachable(m),
            ObjectStoreError::Rejected(m) => ArtifactError::SourceRejected(m),
            ObjectStoreError::Io(m) => ArtifactError::LocalIo(m),
        }
    }
}

/// Per-file upload failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error(transparent)]
    Store(#[from] ObjectStoreError),

    #[error("upload attempt timed out after {0} ms")]
    Timeout(u64),
}

impl UploadError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::Timeout(_) | UploadError::Store(ObjectStoreError::Unreachable(_))
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("supervisor at capacity ({limit} tasks)")]
    AtCapacity { limit: usize },

    #[error("task '{0}' is already supervised")]
    DuplicateTask(String),

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CleanupError {
    #[error("live task list unavailable: {0}")]
    LiveListUnavailable(String),

    #[error("live task query timed out after {0} ms")]
    LiveListTimeout(u64),
}

#[derive(Error, Debug)]
pub enum RotationError {
    #[error("refusing to write rotation config for unsafe path {0:?}")]
    UnsafePath(std::path::PathBuf),

    #[error("rotation I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rotation command timed out after {0} ms")]
    Timeout(u64),

    #[error("rotation command failed: {0}")]
    CommandFailed(String),
}

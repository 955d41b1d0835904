// src/types.rs

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final outcome of a supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Success,
    Failed,
    Killed,
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskOutcome::Success => "SUCCESS",
            TaskOutcome::Failed => "FAILED",
            TaskOutcome::Killed => "KILLED",
        };
        f.write_str(s)
    }
}

/// Which phase of the two-phase termination is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopMode {
    /// SIGTERM to the process group.
    Graceful,
    /// SIGKILL to the process group.
    Forced,
}

/// How finished-task logs reach the uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadDelivery {
    /// The supervisor calls the uploader directly after the task ends.
    #[default]
    Inline,
    /// The supervisor drops an upload metadata file that the `uploader`
    /// daemon picks up.
    Metadata,
}

/// What `await_termination` hands back once a task reaches FINISHED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationOutcome {
    pub task_id: String,
    pub outcome: TaskOutcome,
    pub reason: String,
    pub exit_code: Option<i32>,
    /// False when the task never got past bootstrap.
    pub process_started: bool,
    pub finished_at: DateTime<Utc>,
}

// src/exec/state.rs

//! Pure per-task lifecycle state machine.
//!
//! ```text
//! LAUNCHING ──> RUNNING ──> STOPPING(graceful) ──> STOPPING(forced)
//!     │            │               │                      │
//!     │            └───────────────┴──────────┬───────────┘
//!     ├──> STOPPING(forced) ─────────────────>│
//!     └──────────────────────────────────> FINISHED{SUCCESS|FAILED|KILLED}
//! ```
//!
//! No Tokio, no IO: the async task runner asks this machine what to do and
//! performs the side effects. FINISHED is terminal and reached exactly once.

use std::fmt;

use thiserror::Error;

use crate::types::{StopMode, TaskOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Launching,
    Running,
    Stopping(StopMode),
    Finished(TaskOutcome),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished(_))
    }

    /// Name used in status reports and history.
    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Launching => "LAUNCHING",
            TaskState::Running => "RUNNING",
            TaskState::Stopping(StopMode::Graceful) => "STOPPING_GRACEFUL",
            TaskState::Stopping(StopMode::Forced) => "STOPPING_FORCED",
            TaskState::Finished(TaskOutcome::Success) => "FINISHED_SUCCESS",
            TaskState::Finished(TaskOutcome::Failed) => "FINISHED_FAILED",
            TaskState::Finished(TaskOutcome::Killed) => "FINISHED_KILLED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("task already finished as {0}")]
    AlreadyFinished(TaskState),
    #[error("illegal transition {from} -> {to}")]
    Illegal { from: TaskState, to: TaskState },
}

/// What the runner must do in response to a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    /// Already stopping or finished.
    None,
    /// Abort the launch; no process exists yet.
    AbortLaunch,
    /// Send the graceful signal and arm the hard-kill deadline.
    SignalGraceful,
}

#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    state: TaskState,
    history: Vec<TaskState>,
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStateMachine {
    pub fn new() -> Self {
        Self {
            state: TaskState::Launching,
            history: vec![TaskState::Launching],
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Every state visited, in order, starting with LAUNCHING.
    pub fn history(&self) -> &[TaskState] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn stop_requested(&self) -> bool {
        matches!(self.state, TaskState::Stopping(_))
    }

    fn allowed(from: TaskState, to: TaskState) -> bool {
        use TaskState::*;
        match (from, to) {
            (Launching, Running) => true,
            (Launching, Stopping(StopMode::Forced)) => true,
            (Launching, Finished(TaskOutcome::Failed)) => true,
            (Running, Stopping(StopMode::Graceful)) => true,
            (Running, Finished(_)) => true,
            (Stopping(StopMode::Graceful), Stopping(StopMode::Forced)) => true,
            (Stopping(_), Finished(_)) => true,
            _ => false,
        }
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(&mut self, to: TaskState) -> Result<TaskState, TransitionError> {
        let from = self.state;
        if from.is_terminal() {
            return Err(TransitionError::AlreadyFinished(from));
        }
        if !Self::allowed(from, to) {
            return Err(TransitionError::Illegal { from, to });
        }
        self.state = to;
        self.history.push(to);
        Ok(from)
    }

    /// Apply a stop request.
    pub fn on_stop_requested(&mut self) -> StopAction {
        match self.state {
            TaskState::Launching => {
                self.state = TaskState::Stopping(StopMode::Forced);
                self.history.push(self.state);
                StopAction::AbortLaunch
            }
            TaskState::Running => {
                self.state = TaskState::Stopping(StopMode::Graceful);
                self.history.push(self.state);
                StopAction::SignalGraceful
            }
            TaskState::Stopping(_) | TaskState::Finished(_) => StopAction::None,
        }
    }

    /// The hard-kill deadline elapsed. Returns true when a forced kill must
    /// be issued now.
    pub fn on_deadline_elapsed(&mut self) -> bool {
        if self.state == TaskState::Stopping(StopMode::Graceful) {
            self.state = TaskState::Stopping(StopMode::Forced);
            self.history.push(self.state);
            true
        } else {
            false
        }
    }

    /// Outcome implied by the process having exited (`success` from its
    /// status). A task that was asked to stop ends KILLED regardless of how
    /// it exited.
    pub fn outcome_for_exit(&self, success: bool) -> TaskOutcome {
        match (self.state, success) {
            (TaskState::Stopping(_), _) => TaskOutcome::Killed,
            (_, true) => TaskOutcome::Success,
            (_, false) => TaskOutcome::Failed,
        }
    }

    /// Enter FINISHED. Only the first call succeeds.
    pub fn finish(&mut self, outcome: TaskOutcome) -> Result<TaskState, TransitionError> {
        self.transition(TaskState::Finished(outcome))
    }
}

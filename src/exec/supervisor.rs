// src/exec/supervisor.rs

//! Admission and bookkeeping for concurrently supervised tasks.
//!
//! Each accepted task gets its own Tokio task running a [`TaskRunner`]. The
//! supervisor only tracks handles: at most one live instance per task id,
//! and at most `max_task_threads` at once. Launches beyond the limit are
//! rejected, never queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::artifacts::store::ArtifactStore;
use crate::config::model::ConfigFile;
use crate::errors::SupervisorError;
use crate::events::deploy::DeployEventNotifier;
use crate::events::history::TaskHistoryRecorder;
use crate::exec::backend::ProcessBackend;
use crate::exec::idle::ActivityTracker;
use crate::exec::report::StatusReporter;
use crate::exec::state::TaskState;
use crate::exec::task_runner::TaskRunner;
use crate::fs::FileSystem;
use crate::logs::rotation::LogRotationPlanner;
use crate::model::task::TaskDescriptor;
use crate::pool::WorkerPools;
use crate::types::{TaskOutcome, TerminationOutcome};
use crate::upload::uploader::ArtifactUploader;

/// Collaborators shared by every task runner.
#[derive(Debug, Clone)]
pub struct SupervisorDeps {
    pub config: Arc<ConfigFile>,
    pub backend: Arc<dyn ProcessBackend>,
    pub artifacts: ArtifactStore,
    pub rotation: LogRotationPlanner,
    pub uploader: ArtifactUploader,
    pub reporter: Arc<dyn StatusReporter>,
    pub history: TaskHistoryRecorder,
    pub deploys: DeployEventNotifier,
    pub fs: Arc<dyn FileSystem>,
    pub pools: WorkerPools,
    pub activity: Arc<ActivityTracker>,
}

/// Caller's view of one supervised task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task_id: String,
    state: watch::Receiver<TaskState>,
    outcome: watch::Receiver<Option<TerminationOutcome>>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state.clone()
    }

    pub fn outcome(&self) -> Option<TerminationOutcome> {
        self.outcome.borrow().clone()
    }
}

struct Entry {
    stop: watch::Sender<Option<String>>,
    handle: TaskHandle,
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<String, Entry>,
    shutting_down: bool,
}

#[derive(Clone)]
pub struct TaskSupervisor {
    deps: Arc<SupervisorDeps>,
    registry: Arc<Mutex<Registry>>,
    limit: Option<usize>,
}

impl std::fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("limit", &self.limit)
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl TaskSupervisor {
    pub fn new(deps: SupervisorDeps) -> Self {
        let limit = deps.config.executor.max_task_threads;
        Self {
            deps: Arc::new(deps),
            registry: Arc::new(Mutex::new(Registry::default())),
            limit,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn deps(&self) -> &SupervisorDeps {
        &self.deps
    }

    pub fn active_count(&self) -> usize {
        self.registry().tasks.len()
    }

    pub fn is_supervising(&self, task_id: &str) -> bool {
        self.registry().tasks.contains_key(task_id)
    }

    pub fn handles(&self) -> Vec<TaskHandle> {
        self.registry()
            .tasks
            .values()
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Accept `task` and start supervising it.
    pub fn launch(&self, task: TaskDescriptor) -> Result<TaskHandle, SupervisorError> {
        let mut registry = self.registry();
        if registry.shutting_down {
            return Err(SupervisorError::ShuttingDown);
        }
        if registry.tasks.contains_key(&task.task_id) {
            return Err(SupervisorError::DuplicateTask(task.task_id));
        }
        if let Some(limit) = self.limit {
            if registry.tasks.len() >= limit {
                warn!(task_id = %task.task_id, limit, "rejecting task: at capacity");
                return Err(SupervisorError::AtCapacity { limit });
            }
        }

        let task_id = task.task_id.clone();
        let (stop_tx, stop_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(TaskState::Launching);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let handle = TaskHandle {
            task_id: task_id.clone(),
            state: state_rx,
            outcome: outcome_rx,
        };
        registry.tasks.insert(
            task_id.clone(),
            Entry {
                stop: stop_tx,
                handle: handle.clone(),
            },
        );
        drop(registry);

        self.deps.activity.task_started();

        let runner = TaskRunner::new(task, Arc::clone(&self.deps), state_tx);
        let registry = Arc::clone(&self.registry);
        let activity = Arc::clone(&self.deps.activity);
        tokio::spawn(async move {
            let outcome = match tokio::spawn(runner.run(stop_rx)).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "task runner crashed");
                    TerminationOutcome {
                        task_id: task_id.clone(),
                        outcome: TaskOutcome::Failed,
                        reason: format!("supervisor error: {e}"),
                        exit_code: None,
                        process_started: false,
                        finished_at: Utc::now(),
                    }
                }
            };
            registry
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .tasks
                .remove(&task_id);
            outcome_tx.send_replace(Some(outcome));
            activity.task_finished();
        });

        Ok(handle)
    }

    /// Ask a task to stop. The first reason wins; stopping a finished task
    /// is a no-op.
    pub fn request_stop(&self, handle: &TaskHandle, reason: &str) -> Result<(), SupervisorError> {
        let registry = self.registry();
        match registry.tasks.get(handle.task_id()) {
            Some(entry) => {
                entry.stop.send_if_modified(|current| {
                    if current.is_some() {
                        return false;
                    }
                    *current = Some(reason.to_string());
                    true
                });
                Ok(())
            }
            None if handle.outcome().is_some() => Ok(()),
            None => Err(SupervisorError::UnknownTask(handle.task_id().to_string())),
        }
    }

    /// Wait for the task to reach FINISHED.
    pub async fn await_termination(&self, handle: &TaskHandle) -> TerminationOutcome {
        let mut rx = handle.outcome.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| TerminationOutcome {
            task_id: handle.task_id.clone(),
            outcome: TaskOutcome::Failed,
            reason: "supervisor lost track of task".to_string(),
            exit_code: None,
            process_started: false,
            finished_at: Utc::now(),
        })
    }

    /// Refuse new launches, stop every task and wait up to `wait` for them.
    pub async fn shutdown(&self, reason: &str, wait: Duration) -> Vec<TerminationOutcome> {
        let handles = {
            let mut registry = self.registry();
            registry.shutting_down = true;
            registry
                .tasks
                .values()
                .map(|e| e.handle.clone())
                .collect::<Vec<_>>()
        };
        info!(tasks = handles.len(), reason, "shutting down supervisor");

        for handle in &handles {
            if let Err(e) = self.request_stop(handle, reason) {
                warn!(task_id = %handle.task_id(), error = %e, "could not stop task");
            }
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        let all = async {
            for handle in &handles {
                outcomes.push(self.await_termination(handle).await);
            }
        };
        if timeout(wait, all).await.is_err() {
            warn!(
                finished = outcomes.len(),
                total = handles.len(),
                "tasks still running at shutdown timeout"
            );
        }
        outcomes
    }
}

// src/exec/daemon.rs

//! The `executor` daemon.
//!
//! Supervises every task whose definition file appears in the definition
//! directory. A definition and its supervised instance co-terminate: a task
//! whose definition disappears is stopped, and a finished task is not
//! relaunched while its cleanup record exists.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::SupervisorError;
use crate::exec::idle::{wait_for_idle, IdleExit};
use crate::exec::supervisor::TaskSupervisor;
use crate::model::cleanup::CleanupRecord;
use crate::model::task::{definition_path, list_definitions, read_definition};
use crate::watch::watch_directory;

#[derive(Debug)]
pub struct ExecutorDaemon {
    supervisor: TaskSupervisor,
    /// Only these task ids are picked up when non-empty.
    only: HashSet<String>,
}

impl ExecutorDaemon {
    pub fn new(supervisor: TaskSupervisor, only: impl IntoIterator<Item = String>) -> Self {
        Self {
            supervisor,
            only: only.into_iter().collect(),
        }
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    /// Launch the task described by `path` unless it is filtered out, already
    /// supervised or already finished. Returns whether a launch happened.
    pub fn consider(&self, path: &Path) -> bool {
        let deps = self.supervisor.deps();
        let fs = deps.fs.as_ref();
        if !fs.is_file(path) {
            return false;
        }
        let task = match read_definition(fs, path) {
            Ok(task) => task,
            Err(e) => {
                warn!(definition = %path.display(), error = %e, "unreadable task definition");
                return false;
            }
        };

        if !self.only.is_empty() && !self.only.contains(&task.task_id) {
            return false;
        }
        if self.supervisor.is_supervising(&task.task_id) {
            return false;
        }
        if fs.exists(&CleanupRecord::path_for(&deps.config.cleanup, &task.task_id)) {
            debug!(task_id = %task.task_id, "task already finished; waiting for cleanup");
            return false;
        }

        let task_id = task.task_id.clone();
        match self.supervisor.launch(task) {
            Ok(_) => true,
            Err(SupervisorError::DuplicateTask(_)) => false,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "task not launched");
                false
            }
        }
    }

    /// Launch pending definitions and stop tasks whose definition is gone.
    pub fn reconcile(&self) -> Result<()> {
        let deps = self.supervisor.deps();
        let ex = &deps.config.executor;

        for path in list_definitions(deps.fs.as_ref(), ex)? {
            self.consider(&path);
        }

        for handle in self.supervisor.handles() {
            if !deps.fs.exists(&definition_path(ex, handle.task_id())) {
                info!(task_id = %handle.task_id(), "task definition removed; stopping task");
                if let Err(e) = self.supervisor.request_stop(&handle, "task definition removed") {
                    debug!(task_id = %handle.task_id(), error = %e, "stop after definition removal");
                }
            }
        }
        Ok(())
    }

    /// Run until cancelled or idle.
    pub async fn run(&self, cancel: CancellationToken) -> Result<IdleExit> {
        let deps = self.supervisor.deps();
        let ex = &deps.config.executor;
        deps.fs.create_dir_all(&ex.task_definition_directory)?;

        let (_watcher, mut definitions) =
            watch_directory(&ex.task_definition_directory, &ex.task_definition_suffix)?;

        let mut tick = interval(Duration::from_millis(ex.check_threads_every_millis.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let idle = wait_for_idle(
            deps.activity.subscribe(),
            Duration::from_millis(ex.idle_executor_shutdown_wait_millis),
            Duration::from_millis(ex.stop_driver_after_millis),
            cancel.clone(),
        );
        tokio::pin!(idle);

        info!(dir = %ex.task_definition_directory.display(), "executor started");
        let exit = loop {
            tokio::select! {
                exit = &mut idle => break exit,
                Some(path) = definitions.recv() => {
                    self.consider(&path);
                }
                _ = tick.tick() => {
                    if let Err(e) = self.reconcile() {
                        warn!(error = %e, "definition rescan failed");
                    }
                }
            }
        };

        let reason = match exit {
            IdleExit::Idle => "executor idle",
            IdleExit::Cancelled => "executor shutting down",
        };
        let outcomes = self
            .supervisor
            .shutdown(reason, Duration::from_millis(ex.shutdown_timeout_wait_millis))
            .await;
        info!(stopped = outcomes.len(), reason, "executor stopped");
        Ok(exit)
    }
}

// src/exec/task_runner.rs

//! One supervised task, from LAUNCHING to FINISHED.
//!
//! The runner owns the task's state machine and performs the side effects
//! it asks for. Ordering at the end of a task is fixed:
//!
//! 1. enter FINISHED
//! 2. capture the tail of the service log (skipped on error)
//! 3. queue the FINISHED announcement (history, then scheduler status)
//! 4. write the cleanup record
//! 5. force a final rotation, then hand logs to the uploader
//! 6. mark the log-watcher metadata finished
//! 7. wait, bounded, for queued announcements to be delivered
//!
//! Announcements go through a per-task queue drained by a separate Tokio
//! task. They are delivered in transition order, and a slow history store
//! or scheduler never holds up the stop deadline or exit detection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::ArtifactError;
use crate::events::deploy::DeployEventNotifier;
use crate::exec::backend::{share, ExitInfo, LaunchSpec, SharedProcess};
use crate::exec::liveness::spawn_liveness_checker;
use crate::exec::report::{truncate_message, StatusUpdate};
use crate::exec::state::{StopAction, TaskState, TaskStateMachine};
use crate::exec::supervisor::SupervisorDeps;
use crate::logs::metadata::TailMetadata;
use crate::logs::tail::write_tail;
use crate::model::cleanup::CleanupRecord;
use crate::model::deploy::{DeployOutcome, DeployResult};
use crate::model::task::{TaskDescriptor, TaskPaths};
use crate::types::{StopMode, TaskOutcome, TerminationOutcome, UploadDelivery};
use crate::upload::uploader::UploadRequest;

/// Environment variable carrying the task's thread limit.
pub const MAX_THREADS_ENV: &str = "TASK_MAX_THREADS";

/// Stop requests: `None` until someone asks; the first reason wins.
pub(crate) type StopReceiver = watch::Receiver<Option<String>>;

enum Launch {
    Started(SharedProcess),
    Aborted(String),
    Failed(String),
}

enum LaunchStep {
    Stopped(String),
    Fetched(Result<(), String>),
}

/// A state change queued for history and the scheduler.
struct Announcement {
    state: TaskState,
    message: Option<String>,
}

struct Finish {
    outcome: TaskOutcome,
    reason: String,
    exit_code: Option<i32>,
    process_started: bool,
}

pub(crate) struct TaskRunner {
    task: TaskDescriptor,
    paths: TaskPaths,
    deps: Arc<SupervisorDeps>,
    sm: TaskStateMachine,
    state_tx: watch::Sender<TaskState>,
    tail_meta: TailMetadata,
    announcements: Option<mpsc::UnboundedSender<Announcement>>,
    announcer: Option<JoinHandle<()>>,
}

impl TaskRunner {
    pub(crate) fn new(
        task: TaskDescriptor,
        deps: Arc<SupervisorDeps>,
        state_tx: watch::Sender<TaskState>,
    ) -> Self {
        let paths = TaskPaths::new(&task, &deps.config);
        let tail_meta =
            TailMetadata::for_service_log(&task.task_id, &task.request_name, &paths.service_log);
        Self {
            task,
            paths,
            deps,
            sm: TaskStateMachine::new(),
            state_tx,
            tail_meta,
            announcements: None,
            announcer: None,
        }
    }

    pub(crate) async fn run(mut self, mut stop_rx: StopReceiver) -> TerminationOutcome {
        info!(task_id = %self.task.task_id, request = %self.task.request_name, "launching task");
        let (tx, worker) = spawn_announcer(self.task.task_id.clone(), Arc::clone(&self.deps));
        self.announcements = Some(tx);
        self.announcer = Some(worker);
        self.announce(None);
        self.write_tail_metadata();

        let finish = match self.launch(&mut stop_rx).await {
            Launch::Started(process) => self.supervise(process, &mut stop_rx).await,
            Launch::Aborted(reason) => Finish {
                outcome: TaskOutcome::Killed,
                reason: format!("stopped during launch: {reason}"),
                exit_code: None,
                process_started: false,
            },
            Launch::Failed(reason) => Finish {
                outcome: TaskOutcome::Failed,
                reason,
                exit_code: None,
                process_started: false,
            },
        };

        self.finalize(finish).await
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.sm.state());
    }

    /// Queue the current state for history and the scheduler.
    fn announce(&self, message: Option<&str>) {
        let Some(tx) = &self.announcements else {
            return;
        };
        let announcement = Announcement {
            state: self.sm.state(),
            message: message.map(str::to_string),
        };
        if tx.send(announcement).is_err() {
            warn!(task_id = %self.task.task_id, "status announcer is gone; dropping update");
        }
    }

    /// Close the queue and give the announcer up to `stop_driver_after_millis`
    /// to deliver what is left. Past that it keeps running detached.
    async fn drain_announcements(&mut self) {
        self.announcements = None;
        let Some(mut worker) = self.announcer.take() else {
            return;
        };
        let wait = Duration::from_millis(self.deps.config.executor.stop_driver_after_millis);
        match timeout(wait, &mut worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task_id = %self.task.task_id, error = %e, "status announcer crashed"),
            Err(_) => warn!(
                task_id = %self.task.task_id,
                wait_ms = wait.as_millis() as u64,
                "status announcements still pending; continuing without them"
            ),
        }
    }

    fn write_tail_metadata(&self) {
        if let Err(e) = self
            .tail_meta
            .write(self.deps.fs.as_ref(), &self.deps.config.logwatcher)
        {
            warn!(task_id = %self.task.task_id, error = %e, "failed to write log-watcher metadata");
        }
    }

    async fn launch(&mut self, stop_rx: &mut StopReceiver) -> Launch {
        if let Err(e) = tokio::fs::create_dir_all(&self.paths.work_dir).await {
            return Launch::Failed(format!(
                "bootstrap error: creating {}: {e}",
                self.paths.work_dir.display()
            ));
        }

        let step = tokio::select! {
            biased;
            reason = next_stop(stop_rx) => LaunchStep::Stopped(reason),
            fetched = fetch_artifacts(&self.deps, &self.task, &self.paths) => LaunchStep::Fetched(fetched),
        };

        match step {
            LaunchStep::Stopped(reason) => return self.abort_launch(reason),
            LaunchStep::Fetched(Err(e)) => {
                error!(task_id = %self.task.task_id, error = %e, "artifact bootstrap failed");
                return Launch::Failed(format!("bootstrap error: {e}"));
            }
            LaunchStep::Fetched(Ok(())) => {}
        }

        if let Err(e) = self.deps.rotation.ensure_rotation_configured(&self.task) {
            warn!(task_id = %self.task.task_id, error = %e, "could not configure log rotation");
        }

        let pending_stop = stop_rx.borrow().clone();
        if let Some(reason) = pending_stop {
            return self.abort_launch(reason);
        }

        let spec = self.launch_spec();
        match self.deps.backend.spawn(&spec).await {
            Ok(process) => {
                self.transition(TaskState::Running);
                self.announce(None);
                if let Some(marker) = &self.task.deploy {
                    let event = DeployEventNotifier::starting(marker.clone(), None);
                    self.deps.deploys.notify(event, Some(self.task.task_id.clone()));
                }
                Launch::Started(share(process))
            }
            Err(e) => {
                error!(task_id = %self.task.task_id, error = %e, "task launch failed");
                Launch::Failed(format!("launch error: {e:#}"))
            }
        }
    }

    fn abort_launch(&mut self, reason: String) -> Launch {
        if self.sm.on_stop_requested() == StopAction::AbortLaunch {
            self.publish();
        }
        info!(task_id = %self.task.task_id, reason = %reason, "stop requested during launch");
        Launch::Aborted(reason)
    }

    fn launch_spec(&self) -> LaunchSpec {
        let mut env = self.task.env.clone();
        env.insert("TASK_ID".to_string(), self.task.task_id.clone());
        env.insert("TASK_REQUEST_ID".to_string(), self.task.request_name.clone());
        if let Some(max) = self.task.limits.max_threads {
            env.insert(MAX_THREADS_ENV.to_string(), max.to_string());
        }
        LaunchSpec {
            task_id: self.task.task_id.clone(),
            command: self.task.command.clone(),
            work_dir: self.paths.work_dir.clone(),
            log_path: self.paths.service_log.clone(),
            user: self
                .task
                .user
                .clone()
                .or_else(|| self.deps.config.executor.default_user.clone()),
            env,
        }
    }

    fn transition(&mut self, to: TaskState) {
        match self.sm.transition(to) {
            Ok(_) => self.publish(),
            Err(e) => error!(task_id = %self.task.task_id, error = %e, "rejected state transition"),
        }
    }

    /// Wait for the process to exit, escalating SIGTERM to SIGKILL once the
    /// hard-kill deadline passes after a stop request.
    async fn supervise(&mut self, process: SharedProcess, stop_rx: &mut StopReceiver) -> Finish {
        let ex = &self.deps.config.executor;
        let hard_kill_after = Duration::from_millis(ex.hard_kill_after_millis);
        let checker_cancel = CancellationToken::new();
        let mut exit_rx = spawn_liveness_checker(
            self.task.task_id.clone(),
            Arc::clone(&process),
            self.deps.pools.check.clone(),
            Duration::from_millis(ex.check_threads_every_millis.max(1)),
            checker_cancel.clone(),
        );

        let mut stop_reason: Option<String> = None;
        let mut kill_at: Option<Instant> = None;

        let exit = loop {
            let deadline = kill_at;
            tokio::select! {
                biased;
                observed = async { exit_rx.wait_for(Option::is_some).await.ok().and_then(|v| *v) } => {
                    break observed.unwrap_or_else(ExitInfo::unknown);
                }
                reason = next_stop(stop_rx), if stop_reason.is_none() => {
                    if self.sm.on_stop_requested() == StopAction::SignalGraceful {
                        self.publish();
                        info!(task_id = %self.task.task_id, reason = %reason, "stopping task");
                        self.signal(&process, StopMode::Graceful);
                        kill_at = Some(Instant::now() + hard_kill_after);
                        self.announce(Some(&reason));
                    }
                    stop_reason = Some(reason);
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    kill_at = None;
                    if self.sm.on_deadline_elapsed() {
                        self.publish();
                        warn!(
                            task_id = %self.task.task_id,
                            after_ms = hard_kill_after.as_millis() as u64,
                            "task ignored graceful stop; killing"
                        );
                        let proc = Arc::clone(&process);
                        let task_id = self.task.task_id.clone();
                        self.deps
                            .pools
                            .kill
                            .run(async move { signal_process(&task_id, &proc, StopMode::Forced) })
                            .await;
                        self.announce(stop_reason.as_deref());
                    }
                }
            }
        };
        checker_cancel.cancel();

        if !self.sm.stop_requested() {
            // Clean up anything the task left behind in its process group.
            self.signal(&process, StopMode::Graceful);
        }

        let outcome = self.sm.outcome_for_exit(exit.success());
        let reason = match &stop_reason {
            Some(why) => format!("stopped ({why}); {}", exit.describe()),
            None => exit.describe(),
        };
        Finish {
            outcome,
            reason,
            exit_code: exit.code,
            process_started: true,
        }
    }

    fn signal(&self, process: &SharedProcess, mode: StopMode) {
        signal_process(&self.task.task_id, process, mode);
    }

    async fn finalize(mut self, finish: Finish) -> TerminationOutcome {
        let task_id = self.task.task_id.clone();
        let terminal = TaskState::Finished(finish.outcome);
        self.transition(terminal);
        let finished_at = Utc::now();
        info!(task_id = %task_id, outcome = %finish.outcome, reason = %finish.reason, "task finished");

        if finish.process_started {
            self.save_tail().await;
        }

        self.announce(Some(&finish.reason));

        let record = CleanupRecord {
            task_id: task_id.clone(),
            request_name: self.task.request_name.clone(),
            outcome: finish.outcome,
            app_directory: self.task.app_directory.clone(),
            finished_at: finished_at.timestamp_millis(),
            message: Some(finish.reason.clone()),
        };
        if let Err(e) = record.write(self.deps.fs.as_ref(), &self.deps.config.cleanup) {
            error!(task_id = %task_id, error = %e, "failed to write cleanup record");
        }

        let outcome = TerminationOutcome {
            task_id: task_id.clone(),
            outcome: finish.outcome,
            reason: finish.reason,
            exit_code: finish.exit_code,
            process_started: finish.process_started,
            finished_at,
        };

        if finish.process_started {
            if let Err(e) = self.deps.rotation.force_rotate(&self.task).await {
                warn!(task_id = %task_id, error = %e, "final log rotation failed");
            }
            self.hand_off_logs(&outcome).await;
        }

        if let Some(marker) = &self.task.deploy {
            let result = DeployResult {
                outcome: match finish.outcome {
                    TaskOutcome::Success => DeployOutcome::Succeeded,
                    TaskOutcome::Failed => DeployOutcome::Failed,
                    TaskOutcome::Killed => DeployOutcome::Canceled,
                },
                message: Some(outcome.reason.clone()),
            };
            let event = DeployEventNotifier::finished(marker.clone(), None, result);
            self.deps.deploys.notify(event, Some(task_id.clone()));
        }

        self.tail_meta.finished = true;
        self.write_tail_metadata();

        self.drain_announcements().await;
        outcome
    }

    async fn save_tail(&self) {
        let max = self.deps.config.executor.tail_log_lines_to_save;
        match self
            .deps
            .rotation
            .capture_tail(&self.paths.service_log, max)
            .await
        {
            Ok(lines) => {
                let dest = self.paths.tail_file.clone();
                let written =
                    tokio::task::spawn_blocking(move || write_tail(&dest, &lines)).await;
                match written {
                    Ok(Ok(())) => debug!(task_id = %self.task.task_id, "saved tail of service log"),
                    Ok(Err(e)) => {
                        warn!(task_id = %self.task.task_id, error = %e, "failed to write tail file")
                    }
                    Err(e) => {
                        warn!(task_id = %self.task.task_id, error = %e, "tail writer panicked")
                    }
                }
            }
            Err(e) => warn!(task_id = %self.task.task_id, error = %e, "skipping tail capture"),
        }
    }

    async fn hand_off_logs(&self, outcome: &TerminationOutcome) {
        let s3 = &self.deps.config.s3;
        match s3.delivery {
            UploadDelivery::Inline => {
                match self.deps.uploader.upload_completed(&self.task, outcome).await {
                    Ok(report) => {
                        for failed in report.failed() {
                            warn!(
                                task_id = %self.task.task_id,
                                file = %failed.path.display(),
                                key = %failed.key,
                                "log not uploaded"
                            );
                        }
                    }
                    Err(e) => warn!(task_id = %self.task.task_id, error = %e, "upload failed"),
                }
            }
            UploadDelivery::Metadata => {
                let req = UploadRequest::new(&self.task, outcome);
                if let Err(e) = req.write(self.deps.fs.as_ref(), s3) {
                    warn!(task_id = %self.task.task_id, error = %e, "failed to write upload metadata");
                }
            }
        }
    }
}

/// Deliver announcements in order: history first, then the scheduler. The
/// worker counts as one in-flight report for its whole life so idle
/// shutdown waits for it.
fn spawn_announcer(
    task_id: String,
    deps: Arc<SupervisorDeps>,
) -> (mpsc::UnboundedSender<Announcement>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Announcement>();
    let worker = tokio::spawn(async move {
        let _pending = deps.activity.report_started();
        let max = deps.config.executor.max_task_message_length;
        while let Some(Announcement { state, message }) = rx.recv().await {
            deps.history
                .record_transition(&task_id, state, message.as_deref())
                .await;
            let update = StatusUpdate {
                task_id: task_id.clone(),
                state: state.label().to_string(),
                message: message.as_deref().map(|m| truncate_message(m, max)),
                timestamp: Utc::now(),
            };
            if let Err(e) = deps.reporter.report(&update).await {
                warn!(task_id = %task_id, state = %state, error = %e, "status report failed");
            }
        }
    });
    (tx, worker)
}

fn signal_process(task_id: &str, process: &SharedProcess, mode: StopMode) {
    let mut guard = match process.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Err(e) = guard.signal(mode) {
        warn!(task_id = %task_id, mode = ?mode, error = %e, "failed to signal task");
    }
}

/// Resolves with the stop reason once one is set. Never resolves if the
/// supervisor side has gone away.
async fn next_stop(stop_rx: &mut StopReceiver) -> String {
    let reason = match stop_rx.wait_for(Option::is_some).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    };
    match reason {
        Some(reason) => reason,
        None => std::future::pending().await,
    }
}

/// Materialize every artifact in order; the first failure aborts.
async fn fetch_artifacts(
    deps: &SupervisorDeps,
    task: &TaskDescriptor,
    paths: &TaskPaths,
) -> Result<(), String> {
    for artifact in &task.artifacts {
        let dest = paths.artifact_destination(artifact);
        debug!(task_id = %task.task_id, artifact = %artifact.uri, dest = %dest.display(), "fetching artifact");
        deps.artifacts
            .fetch(artifact, &dest)
            .await
            .map_err(|e: ArtifactError| format!("{}: {e}", artifact.uri))?;
    }
    Ok(())
}

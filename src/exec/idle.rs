// src/exec/idle.rs

//! Activity tracking and idle shutdown.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Activity {
    pub active_tasks: usize,
    pub pending_reports: usize,
}

/// Counts supervised tasks and in-flight status reports.
#[derive(Debug)]
pub struct ActivityTracker {
    tx: watch::Sender<Activity>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Activity::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> Activity {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Activity> {
        self.tx.subscribe()
    }

    pub fn task_started(&self) {
        self.tx.send_modify(|a| a.active_tasks += 1);
    }

    pub fn task_finished(&self) {
        self.tx
            .send_modify(|a| a.active_tasks = a.active_tasks.saturating_sub(1));
    }

    /// Mark a status report in flight until the guard drops.
    pub fn report_started(&self) -> ReportGuard<'_> {
        self.tx.send_modify(|a| a.pending_reports += 1);
        ReportGuard { tracker: self }
    }
}

pub struct ReportGuard<'a> {
    tracker: &'a ActivityTracker,
}

impl Drop for ReportGuard<'_> {
    fn drop(&mut self) {
        self.tracker
            .tx
            .send_modify(|a| a.pending_reports = a.pending_reports.saturating_sub(1));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleExit {
    /// No task ran for the whole idle window.
    Idle,
    /// The shutdown token fired.
    Cancelled,
}

/// Resolve once the agent has had no active task for `idle_wait`, or when
/// `cancel` fires. Before returning, waits up to `drain_reports` for
/// in-flight status reports.
pub async fn wait_for_idle(
    mut rx: watch::Receiver<Activity>,
    idle_wait: Duration,
    drain_reports: Duration,
    cancel: CancellationToken,
) -> IdleExit {
    let exit = loop {
        let idle = rx.borrow_and_update().active_tasks == 0;
        if idle {
            tokio::select! {
                _ = cancel.cancelled() => break IdleExit::Cancelled,
                _ = sleep(idle_wait) => {
                    if rx.borrow().active_tasks == 0 {
                        break IdleExit::Idle;
                    }
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        break IdleExit::Cancelled;
                    }
                }
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => break IdleExit::Cancelled,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break IdleExit::Cancelled;
                    }
                }
            }
        }
    };

    info!(reason = ?exit, "executor stopping; draining status reports");
    let deadline = Instant::now() + drain_reports;
    let drained = timeout_at(deadline, rx.wait_for(|a| a.pending_reports == 0))
        .await
        .is_ok();
    if !drained {
        warn!(
            pending = rx.borrow().pending_reports,
            "gave up waiting for status reports"
        );
    }
    exit
}

// src/exec/liveness.rs

//! Background liveness checking.
//!
//! The checker is the only component that decides a task process has
//! exited. It polls the process on the shared check pool and publishes the
//! exit through a `watch` channel, then stops.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::exec::backend::{ExitInfo, SharedProcess};
use crate::pool::BoundedPool;

/// Start polling `process` every `every`.
///
/// The receiver holds `None` until the process has exited. Cancelling
/// `cancel` stops polling without publishing anything.
pub fn spawn_liveness_checker(
    task_id: String,
    process: SharedProcess,
    pool: BoundedPool,
    every: Duration,
    cancel: CancellationToken,
) -> watch::Receiver<Option<ExitInfo>> {
    let (tx, rx) = watch::channel(None);

    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(task_id = %task_id, "liveness checker cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let polled = pool.run(async { poll_once(&task_id, &process) }).await;
            if let Some(info) = polled {
                debug!(task_id = %task_id, status = %info.describe(), "liveness checker observed exit");
                let _ = tx.send(Some(info));
                return;
            }
        }
    });

    rx
}

fn poll_once(task_id: &str, process: &SharedProcess) -> Option<ExitInfo> {
    let mut guard = match process.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    match guard.try_wait() {
        Ok(status) => status,
        Err(e) => {
            // A process we can no longer poll is treated as gone.
            error!(task_id = %task_id, error = %e, "failed to poll task process");
            Some(ExitInfo::unknown())
        }
    }
}

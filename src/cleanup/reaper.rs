// src/cleanup/reaper.rs

//! Disk reclamation for finished tasks.
//!
//! A record moves `DISCOVERED -> ELIGIBLE -> CONFIRMED_DEAD -> RECLAIMED`.
//! Anything short of the full chain leaves the task untouched until the next
//! sweep. In safe mode an unconfirmed live list deletes nothing at all.

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleanup::live_tasks::LiveTaskSource;
use crate::config::model::ConfigFile;
use crate::errors::CleanupError;
use crate::fs::FileSystem;
use crate::logs::metadata::TailMetadata;
use crate::logs::rotation::LogRotationPlanner;
use crate::model::cleanup::CleanupRecord;
use crate::model::task::{definition_path, has_suffix};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Reclaimed,
    SkippedTooYoung,
    SkippedStillLive,
    Error(String),
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Reclaimed => f.write_str("reclaimed"),
            Disposition::SkippedTooYoung => f.write_str("skipped (within grace period)"),
            Disposition::SkippedStillLive => f.write_str("skipped (still live)"),
            Disposition::Error(e) => write!(f, "error: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    /// `None` when the record could not be parsed.
    pub task_id: Option<String>,
    pub record_path: PathBuf,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Set when the sweep was abandoned before deleting anything.
    pub aborted: Option<String>,
    pub outcomes: Vec<RecordOutcome>,
}

impl SweepReport {
    pub fn count(&self, wanted: &Disposition) -> usize {
        self.outcomes.iter().filter(|o| &o.disposition == wanted).count()
    }

    pub fn errors(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.disposition, Disposition::Error(_)))
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct CleanupReaper {
    fs: Arc<dyn FileSystem>,
    live: Arc<dyn LiveTaskSource>,
    config: Arc<ConfigFile>,
    rotation: LogRotationPlanner,
}

impl CleanupReaper {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        live: Arc<dyn LiveTaskSource>,
        config: Arc<ConfigFile>,
    ) -> Self {
        let rotation = LogRotationPlanner::new(Arc::clone(&config));
        Self {
            fs,
            live,
            config,
            rotation,
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let cfg = &self.config.cleanup;
        let mut report = SweepReport::default();

        let paths = match self.record_paths() {
            Ok(paths) => paths,
            Err(e) => {
                report.aborted = Some(format!("listing cleanup records: {e:#}"));
                warn!(error = %e, "cleanup sweep aborted");
                return report;
            }
        };

        let mut eligible = Vec::new();
        for path in paths {
            match CleanupRecord::read(self.fs.as_ref(), &path) {
                Ok(record) if record.age_millis(now) < cfg.grace_period_millis => {
                    debug!(task_id = %record.task_id, "record within grace period");
                    report.outcomes.push(RecordOutcome {
                        task_id: Some(record.task_id),
                        record_path: path,
                        disposition: Disposition::SkippedTooYoung,
                    });
                }
                Ok(record) => eligible.push((path, record)),
                Err(e) => {
                    warn!(record = %path.display(), error = %e, "unreadable cleanup record");
                    report.outcomes.push(RecordOutcome {
                        task_id: None,
                        record_path: path,
                        disposition: Disposition::Error(format!("{e:#}")),
                    });
                }
            }
        }

        if eligible.is_empty() {
            return report;
        }

        let live = match self.query_live().await {
            Ok(live) if live.is_empty() && cfg.safe_mode => {
                report.aborted = Some(
                    "live task list is empty; refusing to reclaim in safe mode".to_string(),
                );
                warn!(eligible = eligible.len(), "cleanup sweep aborted: empty live task list");
                return report;
            }
            Ok(live) => live,
            Err(e) if cfg.safe_mode => {
                report.aborted = Some(e.to_string());
                warn!(error = %e, eligible = eligible.len(), "cleanup sweep aborted");
                return report;
            }
            Err(e) => {
                warn!(error = %e, "live task list unavailable; safe mode is off, treating as empty");
                HashSet::new()
            }
        };

        for (path, record) in eligible {
            let disposition = if live.contains(&record.task_id) {
                Disposition::SkippedStillLive
            } else {
                match self.reclaim(&record, &path) {
                    Ok(()) => Disposition::Reclaimed,
                    Err(e) => Disposition::Error(format!("{e:#}")),
                }
            };
            match &disposition {
                Disposition::Error(_) => {
                    warn!(task_id = %record.task_id, outcome = %disposition, "cleanup")
                }
                _ => info!(task_id = %record.task_id, outcome = %disposition, "cleanup"),
            }
            report.outcomes.push(RecordOutcome {
                task_id: Some(record.task_id),
                record_path: path,
                disposition,
            });
        }

        report
    }

    fn record_paths(&self) -> Result<Vec<PathBuf>> {
        let cfg = &self.config.cleanup;
        if !self.fs.is_dir(&cfg.results_directory) {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = self
            .fs
            .read_dir(&cfg.results_directory)?
            .into_iter()
            .filter(|p| has_suffix(p, &cfg.results_suffix))
            .collect();
        paths.sort();
        Ok(paths)
    }

    async fn query_live(&self) -> Result<HashSet<String>, CleanupError> {
        let limit = self.config.cleanup.live_tasks_timeout_millis;
        match timeout(Duration::from_millis(limit), self.live.live_task_ids()).await {
            Ok(result) => result,
            Err(_) => Err(CleanupError::LiveListTimeout(limit)),
        }
    }

    /// Delete everything the task left behind. The record goes last so a
    /// partial failure is retried on the next sweep.
    fn reclaim(&self, record: &CleanupRecord, record_path: &Path) -> Result<()> {
        let app_dir = &record.app_directory;
        check_reclaimable(app_dir)?;
        if self.fs.exists(app_dir) {
            self.fs
                .remove_dir_all(app_dir)
                .with_context(|| format!("removing task directory {:?}", app_dir))?;
        }

        let mut extras = vec![
            definition_path(&self.config.executor, &record.task_id),
            self.rotation.config_path(&record.task_id),
        ];
        extras.extend(TailMetadata::path_for(&self.config.logwatcher, &record.task_id));
        for path in extras {
            if self.fs.exists(&path) {
                self.fs.remove_file(&path)?;
            }
        }

        self.fs.remove_file(record_path)?;
        Ok(())
    }

    /// Sweep every `sweep_interval_millis` until cancelled.
    pub async fn run_periodic(&self, cancel: CancellationToken) {
        let every = Duration::from_millis(self.config.cleanup.sweep_interval_millis.max(1));
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let report = self.sweep().await;
                    log_summary(&report);
                }
            }
        }
        info!("cleanup reaper stopped");
    }
}

pub fn log_summary(report: &SweepReport) {
    if let Some(reason) = &report.aborted {
        warn!(reason = %reason, "cleanup sweep aborted");
        return;
    }
    info!(
        reclaimed = report.count(&Disposition::Reclaimed),
        too_young = report.count(&Disposition::SkippedTooYoung),
        still_live = report.count(&Disposition::SkippedStillLive),
        errors = report.errors(),
        "cleanup sweep finished"
    );
}

fn check_reclaimable(dir: &Path) -> Result<()> {
    if !dir.is_absolute() {
        bail!("refusing to reclaim relative task directory {:?}", dir);
    }
    let normal = dir
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count();
    if normal == 0 || dir.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(anyhow!("refusing to reclaim task directory {:?}", dir));
    }
    Ok(())
}

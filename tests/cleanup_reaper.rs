// tests/cleanup_reaper.rs

use nodeward_test_utils::builders::ConfigFileBuilder;
use nodeward_test_utils::fakes::{FailingLiveTasks, StaticLiveTasks};
use nodeward_test_utils::init_tracing;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use nodeward::cleanup::{CleanupReaper, Disposition, LiveTaskSource, SweepReport};
use nodeward::config::ConfigFile;
use nodeward::fs::mock::MockFileSystem;
use nodeward::fs::FileSystem;
use nodeward::model::task::definition_path;
use nodeward::model::CleanupRecord;
use nodeward::types::TaskOutcome;

type TestResult = Result<(), Box<dyn Error>>;

const ROOT: &str = "/agent";

fn config(safe_mode: bool) -> ConfigFile {
    ConfigFileBuilder::new(Path::new(ROOT))
        .safe_mode(safe_mode)
        .grace_period_millis(60_000)
        .build()
}

fn app_dir(task_id: &str) -> PathBuf {
    Path::new(ROOT).join("tasks").join(task_id)
}

/// Lay down what a finished task leaves behind and return its record path.
fn finished_task(
    fs: &MockFileSystem,
    cfg: &ConfigFile,
    task_id: &str,
    finished_at: DateTime<Utc>,
) -> PathBuf {
    let app = app_dir(task_id);
    fs.add_file(app.join("service.log"), "log");
    fs.add_file(app.join("app/bin"), "binary");
    fs.add_file(definition_path(&cfg.executor, task_id), "{}");
    CleanupRecord {
        task_id: task_id.to_string(),
        request_name: "req".to_string(),
        outcome: TaskOutcome::Success,
        app_directory: app,
        finished_at: finished_at.timestamp_millis(),
        message: None,
    }
    .write(fs, &cfg.cleanup)
    .expect("write record")
}

fn reaper(fs: &MockFileSystem, live: Arc<dyn LiveTaskSource>, cfg: ConfigFile) -> CleanupReaper {
    CleanupReaper::new(Arc::new(fs.clone()), live, Arc::new(cfg))
}

fn disposition_of<'a>(report: &'a SweepReport, task_id: &str) -> Option<&'a Disposition> {
    report
        .outcomes
        .iter()
        .find(|o| o.task_id.as_deref() == Some(task_id))
        .map(|o| &o.disposition)
}

#[tokio::test]
async fn safe_mode_aborts_when_live_list_is_unavailable() -> TestResult {
    init_tracing();
    let fs = MockFileSystem::new();
    let cfg = config(true);
    let now = Utc::now();
    let record = finished_task(&fs, &cfg, "old", now - Duration::hours(2));

    let report = reaper(&fs, Arc::new(FailingLiveTasks), cfg).sweep_at(now).await;

    assert!(report.aborted.is_some());
    assert!(fs.removed().is_empty());
    assert!(fs.exists(&record));
    assert!(fs.exists(&app_dir("old")));
    Ok(())
}

#[tokio::test]
async fn safe_mode_treats_empty_live_list_as_unknown() -> TestResult {
    init_tracing();
    let fs = MockFileSystem::new();
    let cfg = config(true);
    let now = Utc::now();
    finished_task(&fs, &cfg, "old", now - Duration::hours(2));

    let live = Arc::new(StaticLiveTasks::new(Vec::<String>::new()));
    let report = reaper(&fs, live, cfg).sweep_at(now).await;

    assert!(report.aborted.is_some());
    assert!(fs.removed().is_empty());
    Ok(())
}

#[tokio::test]
async fn without_safe_mode_an_unavailable_list_counts_as_empty() -> TestResult {
    init_tracing();
    let fs = MockFileSystem::new();
    let cfg = config(false);
    let now = Utc::now();
    finished_task(&fs, &cfg, "old", now - Duration::hours(2));

    let report = reaper(&fs, Arc::new(FailingLiveTasks), cfg).sweep_at(now).await;

    assert!(report.aborted.is_none());
    assert_eq!(disposition_of(&report, "old"), Some(&Disposition::Reclaimed));
    assert!(!fs.exists(&app_dir("old")));
    Ok(())
}

#[tokio::test]
async fn records_within_grace_period_are_left_alone() -> TestResult {
    init_tracing();
    let fs = MockFileSystem::new();
    let cfg = config(true);
    let now = Utc::now();
    let record = finished_task(&fs, &cfg, "young", now - Duration::seconds(5));

    let live = Arc::new(StaticLiveTasks::new(["other"]));
    let report = reaper(&fs, live.clone(), cfg).sweep_at(now).await;

    assert_eq!(disposition_of(&report, "young"), Some(&Disposition::SkippedTooYoung));
    assert!(fs.removed().is_empty());
    assert!(fs.exists(&record));
    // Nothing was eligible, so the scheduler was never asked.
    assert_eq!(live.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn live_tasks_are_skipped_and_the_rest_reclaimed() -> TestResult {
    init_tracing();
    let fs = MockFileSystem::new();
    let cfg = config(true);
    let now = Utc::now();
    let old = now - Duration::hours(3);
    let live_record = finished_task(&fs, &cfg, "still-running", old);
    let dead_record = finished_task(&fs, &cfg, "done", old);
    let definition = definition_path(&cfg.executor, "done");

    let live = Arc::new(StaticLiveTasks::new(["still-running"]));
    let report = reaper(&fs, live, cfg).sweep_at(now).await;

    assert!(report.aborted.is_none());
    assert_eq!(
        disposition_of(&report, "still-running"),
        Some(&Disposition::SkippedStillLive)
    );
    assert_eq!(disposition_of(&report, "done"), Some(&Disposition::Reclaimed));

    assert!(fs.exists(&live_record));
    assert!(fs.exists(&app_dir("still-running")));

    assert!(!fs.exists(&app_dir("done")));
    assert!(!fs.exists(&definition));
    assert!(!fs.exists(&dead_record));
    // The record is deleted last.
    assert_eq!(fs.removed().last(), Some(&dead_record));
    Ok(())
}

#[tokio::test]
async fn one_failing_task_does_not_stop_the_sweep() -> TestResult {
    init_tracing();
    let fs = MockFileSystem::new();
    let cfg = config(true);
    let now = Utc::now();
    let old = now - Duration::hours(3);
    let bad_record = finished_task(&fs, &cfg, "bad", old);
    finished_task(&fs, &cfg, "good", old);
    fs.add_file(Path::new(ROOT).join("cleanup/garbage.cleanup.json"), "not json");
    fs.fail_removals_under(app_dir("bad"));

    let live = Arc::new(StaticLiveTasks::new(["unrelated"]));
    let report = reaper(&fs, live, cfg).sweep_at(now).await;

    assert!(matches!(disposition_of(&report, "bad"), Some(Disposition::Error(_))));
    assert_eq!(disposition_of(&report, "good"), Some(&Disposition::Reclaimed));
    assert_eq!(report.errors(), 2);
    assert_eq!(report.count(&Disposition::Reclaimed), 1);

    // A failed reclaim keeps its record for the next sweep.
    assert!(fs.exists(&bad_record));
    assert!(!fs.exists(&app_dir("good")));
    Ok(())
}

#[tokio::test]
async fn unsafe_app_directories_are_refused() -> TestResult {
    init_tracing();
    let fs = MockFileSystem::new();
    let cfg = config(true);
    let now = Utc::now();
    CleanupRecord {
        task_id: "root".to_string(),
        request_name: "req".to_string(),
        outcome: TaskOutcome::Failed,
        app_directory: PathBuf::from("/"),
        finished_at: (now - Duration::hours(2)).timestamp_millis(),
        message: None,
    }
    .write(&fs, &cfg.cleanup)?;

    let live = Arc::new(StaticLiveTasks::new(["unrelated"]));
    let report = reaper(&fs, live, cfg).sweep_at(now).await;

    assert!(matches!(disposition_of(&report, "root"), Some(Disposition::Error(_))));
    assert!(fs.removed().is_empty());
    Ok(())
}

// tests/executor_daemon.rs

use nodeward_test_utils::builders::{supervisor_deps, ConfigFileBuilder, TaskDescriptorBuilder};
use nodeward_test_utils::fake_process::{FakeProcessBackend, Script};
use nodeward_test_utils::fakes::{CountingObjectStore, RecordingReporter};
use nodeward_test_utils::{init_tracing, wait_until, with_timeout};

use std::error::Error;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use nodeward::artifacts::FsObjectStore;
use nodeward::config::ConfigFile;
use nodeward::exec::idle::IdleExit;
use nodeward::exec::{ExecutorDaemon, TaskState, TaskSupervisor};
use nodeward::fs::RealFileSystem;
use nodeward::model::task::write_definition;
use nodeward::model::CleanupRecord;
use nodeward::types::TaskOutcome;

type TestResult = Result<(), Box<dyn Error>>;

fn supervisor(root: &Path, config: ConfigFile, script: Script) -> TaskSupervisor {
    let store = Arc::new(CountingObjectStore::new(Arc::new(FsObjectStore::new(
        root.join("objects"),
    ))));
    let deps = supervisor_deps(
        config,
        Arc::new(FakeProcessBackend::new(script)),
        store,
        Arc::new(RecordingReporter::default()),
    )
    .expect("deps");
    TaskSupervisor::new(deps)
}

#[tokio::test]
async fn definitions_drive_launch_and_stop() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    let config = ConfigFileBuilder::new(root).build();
    let task = TaskDescriptorBuilder::new("d1", root.join("tasks/d1")).build();
    let definition = write_definition(&RealFileSystem, &config.executor, &task)?;

    let daemon = ExecutorDaemon::new(supervisor(root, config.clone(), Script::ExitOnTerm), Vec::new());
    daemon.reconcile()?;
    let sup = daemon.supervisor();
    assert!(sup.is_supervising("d1"));

    // A second pass does not start another instance.
    daemon.reconcile()?;
    assert_eq!(sup.active_count(), 1);

    let handle = sup.handles().pop().expect("handle");
    let mut states = handle.subscribe();
    with_timeout(states.wait_for(|s| *s == TaskState::Running)).await?;

    fs::remove_file(&definition)?;
    daemon.reconcile()?;
    let outcome = with_timeout(sup.await_termination(&handle)).await;
    assert_eq!(outcome.outcome, TaskOutcome::Killed);
    assert!(outcome.reason.contains("task definition removed"), "{}", outcome.reason);

    // Finished and awaiting cleanup: the definition is not relaunched.
    assert!(CleanupRecord::path_for(&config.cleanup, "d1").exists());
    write_definition(&RealFileSystem, &config.executor, &task)?;
    daemon.reconcile()?;
    assert_eq!(sup.active_count(), 0);
    Ok(())
}

#[tokio::test]
async fn task_id_filter_limits_what_is_picked_up() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    let config = ConfigFileBuilder::new(root).build();
    for id in ["wanted", "other"] {
        let task = TaskDescriptorBuilder::new(id, root.join("tasks").join(id)).build();
        write_definition(&RealFileSystem, &config.executor, &task)?;
    }
    fs::write(
        config.executor.task_definition_directory.join("broken.task.json"),
        "{ not json",
    )?;

    let daemon = ExecutorDaemon::new(
        supervisor(root, config, Script::ExitOnTerm),
        ["wanted".to_string()],
    );
    daemon.reconcile()?;

    let sup = daemon.supervisor();
    assert!(sup.is_supervising("wanted"));
    assert!(!sup.is_supervising("other"));
    assert_eq!(sup.active_count(), 1);

    let outcomes = with_timeout(sup.shutdown("test over", Duration::from_secs(5))).await;
    assert_eq!(outcomes.len(), 1);
    Ok(())
}

#[tokio::test]
async fn daemon_runs_tasks_then_exits_when_idle() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    let config = ConfigFileBuilder::new(root).build();
    let task = TaskDescriptorBuilder::new("quick", root.join("tasks/quick")).build();
    write_definition(&RealFileSystem, &config.executor, &task)?;

    let script = Script::ExitAfter {
        after: Duration::from_millis(50),
        code: 0,
    };
    let daemon = ExecutorDaemon::new(supervisor(root, config.clone(), script), Vec::new());
    let exit = with_timeout(daemon.run(CancellationToken::new())).await?;

    assert_eq!(exit, IdleExit::Idle);
    let record = CleanupRecord::read(
        &RealFileSystem,
        &CleanupRecord::path_for(&config.cleanup, "quick"),
    )?;
    assert_eq!(record.outcome, TaskOutcome::Success);
    Ok(())
}

#[tokio::test]
async fn cancellation_stops_running_tasks() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    let config = ConfigFileBuilder::new(root).build();
    let task = TaskDescriptorBuilder::new("long", root.join("tasks/long")).build();
    write_definition(&RealFileSystem, &config.executor, &task)?;

    let daemon = Arc::new(ExecutorDaemon::new(
        supervisor(root, config.clone(), Script::ExitOnTerm),
        Vec::new(),
    ));
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let daemon = Arc::clone(&daemon);
        let cancel = cancel.clone();
        async move { daemon.run(cancel).await }
    });

    wait_until(Duration::from_millis(10), || {
        daemon.supervisor().is_supervising("long")
    })
    .await;
    cancel.cancel();

    let exit = with_timeout(run).await??;
    assert_eq!(exit, IdleExit::Cancelled);
    let record = CleanupRecord::read(
        &RealFileSystem,
        &CleanupRecord::path_for(&config.cleanup, "long"),
    )?;
    assert_eq!(record.outcome, TaskOutcome::Killed);
    Ok(())
}

// tests/upload_handoff.rs

use nodeward_test_utils::builders::{supervisor_deps, ConfigFileBuilder, TaskDescriptorBuilder};
use nodeward_test_utils::fake_process::{FakeProcessBackend, Script};
use nodeward_test_utils::fakes::{CountingObjectStore, RecordingReporter};
use nodeward_test_utils::{init_tracing, wait_until, with_timeout};

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use nodeward::artifacts::FsObjectStore;
use nodeward::exec::TaskSupervisor;
use nodeward::fs::RealFileSystem;
use nodeward::pool::BoundedPool;
use nodeward::types::{TaskOutcome, UploadDelivery};
use nodeward::upload::{ArtifactUploader, MetadataUploader, UploadRequest};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn metadata_delivery_defers_upload_to_the_uploader_daemon() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let root = dir.path();

    let config = ConfigFileBuilder::new(root)
        .delivery(UploadDelivery::Metadata)
        .build();
    let store = Arc::new(CountingObjectStore::new(Arc::new(FsObjectStore::new(
        root.join("objects"),
    ))));
    let backend = FakeProcessBackend::new(Script::ExitAfter {
        after: Duration::from_millis(30),
        code: 3,
    })
    .with_log_lines(&["starting", "boom"]);
    let deps = supervisor_deps(
        config.clone(),
        Arc::new(backend),
        store.clone(),
        Arc::new(RecordingReporter::default()),
    )?;
    let supervisor = TaskSupervisor::new(deps);

    let handle = supervisor.launch(TaskDescriptorBuilder::new("u1", root.join("tasks/u1")).build())?;
    let outcome = with_timeout(supervisor.await_termination(&handle)).await;
    assert_eq!(outcome.outcome, TaskOutcome::Failed);
    assert_eq!(outcome.exit_code, Some(3));

    // Nothing uploaded inline; a metadata file waits for the daemon.
    let metadata = UploadRequest::path_for(&config.s3, "u1");
    assert!(metadata.is_file());
    assert!(store.put_keys().is_empty());
    let req = UploadRequest::read(&RealFileSystem, &metadata)?;
    assert_eq!(req.outcome, TaskOutcome::Failed);
    assert_eq!(req.task_directory, root.join("tasks/u1"));

    let config = Arc::new(config);
    let uploader = ArtifactUploader::new(
        store.clone(),
        Arc::clone(&config),
        BoundedPool::new("upload", 2),
    )?;
    let daemon = MetadataUploader::new(Arc::new(RealFileSystem), uploader, config.s3.clone());
    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let cancel = cancel.clone();
        async move { daemon.run(cancel).await }
    });

    wait_until(Duration::from_millis(20), || !metadata.exists()).await;
    cancel.cancel();
    with_timeout(running).await??;

    let mut keys: Vec<String> = store.put_keys().into_iter().map(|(_, k)| k).collect();
    keys.sort();
    assert_eq!(
        keys,
        vec!["req-1/u1/service.log", "req-1/u1/tail_of_finished_service.log"]
    );
    Ok(())
}

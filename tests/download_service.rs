// tests/download_service.rs

use nodeward_test_utils::fakes::CountingObjectStore;
use nodeward_test_utils::{init_tracing, with_timeout};

use std::error::Error;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use nodeward::artifacts::download_service::serve;
use nodeward::artifacts::{ArtifactStore, DownloadCoordinator, DownloadServiceClient, FsObjectStore};
use nodeward::errors::ArtifactError;
use nodeward::model::ArtifactReference;
use nodeward::pool::BoundedPool;
use nodeward::retry::RetryPolicy;

type TestResult = Result<(), Box<dyn Error>>;

const REQUESTERS: usize = 8;

fn coordinator(root: &Path, delay: Duration) -> (Arc<DownloadCoordinator>, Arc<CountingObjectStore>) {
    let counting = Arc::new(
        CountingObjectStore::new(Arc::new(FsObjectStore::new(root.join("objects"))))
            .with_get_delay(delay),
    );
    let store = ArtifactStore::new(
        counting.clone(),
        BoundedPool::new("download", 4),
        Duration::from_secs(5),
        RetryPolicy::new(3, 10, 50),
    );
    let coordinator = Arc::new(DownloadCoordinator::new(store, root.join("staging")));
    (coordinator, counting)
}

async fn fetch_concurrently(
    coordinator: &Arc<DownloadCoordinator>,
    artifact: &ArtifactReference,
    root: &Path,
) -> Vec<Result<std::path::PathBuf, ArtifactError>> {
    let mut set = JoinSet::new();
    for i in 0..REQUESTERS {
        let coordinator = Arc::clone(coordinator);
        let artifact = artifact.clone();
        let dest = root.join(format!("task-{i}/app/bundle.tar"));
        set.spawn(async move { coordinator.fetch(&artifact, &dest).await });
    }
    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        results.push(joined.expect("requester panicked"));
    }
    results
}

#[tokio::test]
async fn concurrent_requests_share_one_transfer() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    fs::create_dir_all(root.join("objects/bootstrap"))?;
    fs::write(root.join("objects/bootstrap/bundle.tar"), "bundle-v1")?;

    let (coordinator, store) = coordinator(root, Duration::from_millis(200));
    let artifact = ArtifactReference::new("s3://bootstrap/bundle.tar", "bundle.tar");

    let results = with_timeout(fetch_concurrently(&coordinator, &artifact, root)).await;

    assert_eq!(results.len(), REQUESTERS);
    assert_eq!(store.gets(), 1);
    for result in results {
        let path = result?;
        assert_eq!(fs::read_to_string(path)?, "bundle-v1");
    }
    assert_eq!(coordinator.in_flight(), 0);

    // Later requests are served from the staging area.
    let late = root.join("late/bundle.tar");
    coordinator.fetch(&artifact, &late).await?;
    assert_eq!(fs::read_to_string(late)?, "bundle-v1");
    assert_eq!(store.gets(), 1);
    Ok(())
}

#[tokio::test]
async fn failure_is_fanned_out_to_every_waiter() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let root = dir.path();

    let (coordinator, store) = coordinator(root, Duration::from_millis(200));
    let artifact = ArtifactReference::new("s3://bootstrap/missing.tar", "missing.tar");

    let results = with_timeout(fetch_concurrently(&coordinator, &artifact, root)).await;

    assert_eq!(store.gets(), 1);
    let expected = ArtifactError::NotFound("s3://bootstrap/missing.tar".to_string());
    for result in &results {
        assert_eq!(result.as_ref().err(), Some(&expected));
    }
    for i in 0..REQUESTERS {
        assert!(!root.join(format!("task-{i}/app/bundle.tar")).exists());
    }
    assert_eq!(coordinator.in_flight(), 0);
    Ok(())
}

#[tokio::test]
async fn cache_key_coalesces_different_uris() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    fs::create_dir_all(root.join("objects/mirror-a"))?;
    fs::write(root.join("objects/mirror-a/jdk.tar"), "jdk")?;

    let (coordinator, store) = coordinator(root, Duration::from_millis(100));
    let mut a = ArtifactReference::new("s3://mirror-a/jdk.tar", "jdk.tar");
    a.cache_key = Some("jdk-21".to_string());
    let mut b = ArtifactReference::new("s3://mirror-b/jdk.tar", "jdk.tar");
    b.cache_key = Some("jdk-21".to_string());

    let one = root.join("one/jdk.tar");
    let two = root.join("two/jdk.tar");
    let (ra, rb) = tokio::join!(coordinator.fetch(&a, &one), coordinator.fetch(&b, &two));
    ra?;
    rb?;
    assert_eq!(store.gets(), 1);
    assert_eq!(fs::read_to_string(&two)?, "jdk");
    Ok(())
}

#[tokio::test]
async fn identities_that_sanitize_alike_get_their_own_bytes() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    fs::create_dir_all(root.join("objects/b/a"))?;
    fs::write(root.join("objects/b/a/x"), "ARTIFACT-ONE")?;
    fs::write(root.join("objects/b/a_x"), "ARTIFACT-TWO")?;

    let (coordinator, store) = coordinator(root, Duration::ZERO);
    let nested = ArtifactReference::new("s3://b/a/x", "x");
    let flat = ArtifactReference::new("s3://b/a_x", "x");
    assert_ne!(coordinator.staged_path(&nested), coordinator.staged_path(&flat));

    let first = root.join("t1/x");
    let second = root.join("t2/x");
    coordinator.fetch(&nested, &first).await?;
    coordinator.fetch(&flat, &second).await?;

    assert_eq!(fs::read_to_string(&first)?, "ARTIFACT-ONE");
    assert_eq!(fs::read_to_string(&second)?, "ARTIFACT-TWO");
    assert_eq!(store.gets(), 2);
    Ok(())
}

#[tokio::test]
async fn every_requester_checksum_is_verified_against_staged_bytes() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    fs::create_dir_all(root.join("objects/bootstrap"))?;
    fs::write(root.join("objects/bootstrap/tool.bin"), "tool-v1")?;

    let (coordinator, store) = coordinator(root, Duration::ZERO);
    let unchecked = ArtifactReference::new("s3://bootstrap/tool.bin", "tool.bin");
    coordinator.fetch(&unchecked, &root.join("t1/tool.bin")).await?;

    let mut wrong = unchecked.clone();
    wrong.checksum = Some("00".repeat(32));
    let rejected = root.join("t2/tool.bin");
    let err = coordinator
        .fetch(&wrong, &rejected)
        .await
        .expect_err("checksum mismatch");
    assert!(matches!(err, ArtifactError::ChecksumOrFormat(_)), "{err:?}");
    assert!(!rejected.exists());

    let mut right = unchecked.clone();
    right.checksum = Some(blake3::hash(b"tool-v1").to_hex().to_string());
    coordinator.fetch(&right, &root.join("t3/tool.bin")).await?;

    // Both later requests were served from the staged copy.
    assert_eq!(store.gets(), 1);
    Ok(())
}

#[tokio::test]
async fn a_bad_checksum_only_fails_its_own_requester() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    fs::create_dir_all(root.join("objects/bootstrap"))?;
    fs::write(root.join("objects/bootstrap/tool.bin"), "tool-v2")?;

    let (coordinator, store) = coordinator(root, Duration::from_millis(100));
    let good = ArtifactReference::new("s3://bootstrap/tool.bin", "tool.bin");
    let mut bad = good.clone();
    bad.checksum = Some("ff".repeat(32));

    // The bad requester starts the transfer; the good one joins it.
    let bad_dest = root.join("t1/tool.bin");
    let good_dest = root.join("t2/tool.bin");
    let (rb, rg) = with_timeout(async {
        tokio::join!(coordinator.fetch(&bad, &bad_dest), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            coordinator.fetch(&good, &good_dest).await
        })
    })
    .await;

    assert!(matches!(rb, Err(ArtifactError::ChecksumOrFormat(_))), "{rb:?}");
    assert_eq!(rg?, good_dest);
    assert_eq!(fs::read_to_string(&good_dest)?, "tool-v2");
    assert_eq!(store.gets(), 1);
    Ok(())
}

#[tokio::test]
async fn expired_staged_transfers_are_evicted_and_fetched_again() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    fs::create_dir_all(root.join("objects/bootstrap"))?;
    fs::write(root.join("objects/bootstrap/bundle.tar"), "bundle-v1")?;

    let (coordinator, store) = coordinator(root, Duration::ZERO);
    let coordinator = Arc::into_inner(coordinator)
        .ok_or("coordinator still shared")?
        .with_retention(Duration::from_millis(200));
    let artifact = ArtifactReference::new("s3://bootstrap/bundle.tar", "bundle.tar");

    coordinator.fetch(&artifact, &root.join("t1/bundle.tar")).await?;
    coordinator.fetch(&artifact, &root.join("t2/bundle.tar")).await?;
    assert_eq!(store.gets(), 1);
    assert_eq!(coordinator.evict_expired(), 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(coordinator.evict_expired(), 1);
    assert!(!coordinator.staged_path(&artifact).exists());

    coordinator.fetch(&artifact, &root.join("t3/bundle.tar")).await?;
    assert_eq!(store.gets(), 2);
    assert_eq!(fs::read_to_string(root.join("t3/bundle.tar"))?, "bundle-v1");
    Ok(())
}

#[tokio::test]
async fn socket_round_trip() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    fs::create_dir_all(root.join("objects/bootstrap"))?;
    fs::write(root.join("objects/bootstrap/bundle.tar"), "over-the-socket")?;

    let (coordinator, store) = coordinator(root, Duration::ZERO);
    let socket = root.join("run/download.sock");
    let cancel = CancellationToken::new();
    let server = tokio::spawn({
        let socket = socket.clone();
        let cancel = cancel.clone();
        async move { serve(&socket, coordinator, cancel).await }
    });

    let client = DownloadServiceClient::new(&socket, Duration::from_secs(5));
    let ok = ArtifactReference::new("s3://bootstrap/bundle.tar", "bundle.tar");
    let dest = root.join("task/app/bundle.tar");

    // The listener may not be bound yet on the first attempts.
    let mut fetched = Err(ArtifactError::SourceUnreachable("not tried".into()));
    for _ in 0..50 {
        fetched = client.request(&ok, &dest).await;
        if !matches!(fetched, Err(ArtifactError::SourceUnreachable(_))) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(fetched?, dest);
    assert_eq!(fs::read_to_string(&dest)?, "over-the-socket");
    assert_eq!(store.gets(), 1);

    let missing = ArtifactReference::new("s3://bootstrap/nope.tar", "nope.tar");
    let err = client
        .request(&missing, &root.join("task/app/nope.tar"))
        .await
        .expect_err("missing artifact");
    assert!(matches!(err, ArtifactError::NotFound(_)));

    cancel.cancel();
    with_timeout(server).await??;
    assert!(!socket.exists());
    Ok(())
}

#[tokio::test]
async fn client_reports_unreachable_service() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let client = DownloadServiceClient::new(dir.path().join("absent.sock"), Duration::from_secs(1));
    let artifact = ArtifactReference::new("s3://b/k", "k");

    let err = client
        .request(&artifact, &dir.path().join("k"))
        .await
        .expect_err("no service");
    assert!(matches!(err, ArtifactError::SourceUnreachable(_)));
}

// src/artifacts/download_service.rs

//! Local coalescing download service.
//!
//! Tasks on a node often need the same artifact at the same time. The
//! service keys transfers by artifact identity (`cacheKey`, else URI): the
//! first request starts one physical transfer into the staging directory,
//! later requests for the same identity wait on it, and every waiter is
//! released with the same result. Completed transfers stay staged, under
//! the blake3 fingerprint of their identity, and serve later requests
//! without touching the object store until they are older than the
//! retention period; the server evicts expired files periodically.
//!
//! Protocol over a Unix socket, one JSON line each way:
//!
//! ```text
//! -> {"artifact": {"uri": "...", "target": "..."}, "destination": "/abs/path"}
//! <- {"ok": "/abs/path"}
//! <- {"error": {"kind": "not_found", "message": "..."}}
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifacts::store::{materialize_from, ArtifactStore};
use crate::errors::ArtifactError;
use crate::model::task::ArtifactReference;

type TransferResult = Result<PathBuf, ArtifactError>;
type InFlight = Arc<Mutex<HashMap<String, watch::Receiver<Option<TransferResult>>>>>;

/// How long a staged transfer is reused when no retention is configured.
pub const DEFAULT_STAGING_RETENTION: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub artifact: ArtifactReference,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadResponse {
    Ok(PathBuf),
    Error(ArtifactError),
}

/// Owns the in-flight table. This is the only state shared between tasks.
#[derive(Debug)]
pub struct DownloadCoordinator {
    store: ArtifactStore,
    staging_dir: PathBuf,
    retention: Duration,
    in_flight: InFlight,
}

impl DownloadCoordinator {
    /// `store` performs the physical transfers and must be in direct mode.
    pub fn new(store: ArtifactStore, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            staging_dir: staging_dir.into(),
            retention: DEFAULT_STAGING_RETENTION,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Number of identities with a transfer currently running.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Materialize `artifact` at `destination`, sharing the transfer with any
    /// concurrent request for the same identity.
    pub async fn fetch(
        &self,
        artifact: &ArtifactReference,
        destination: &Path,
    ) -> Result<PathBuf, ArtifactError> {
        // Each requester's checksum is checked against the staged bytes,
        // whoever started the transfer.
        let checksum = artifact.checksum.as_deref();
        let staged = self.fetch_shared(artifact).await?;
        match materialize_from(&staged, destination, checksum).await {
            Err(ArtifactError::LocalIo(_)) if !staged.exists() => {
                debug!(identity = %artifact.identity(), "staged copy evicted while in use; refetching");
                let staged = self.fetch_shared(artifact).await?;
                materialize_from(&staged, destination, checksum).await?;
            }
            other => other?,
        }
        Ok(destination.to_path_buf())
    }

    /// Where the transfer for `artifact` is staged.
    pub fn staged_path(&self, artifact: &ArtifactReference) -> PathBuf {
        self.staging_dir.join(artifact.fingerprint())
    }

    fn is_fresh(&self, staged: &Path) -> bool {
        match std::fs::metadata(staged) {
            Ok(meta) if meta.is_file() => !expired(&meta, self.retention, SystemTime::now()),
            _ => false,
        }
    }

    /// Remove staged files older than the retention period. Returns how
    /// many were removed.
    pub fn evict_expired(&self) -> usize {
        let entries = match std::fs::read_dir(&self.staging_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(dir = %self.staging_dir.display(), error = %e, "cannot list staging directory");
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut evicted = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() || !expired(&meta, self.retention, now) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => evicted += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to evict staged download"),
            }
        }
        if evicted > 0 {
            info!(evicted, dir = %self.staging_dir.display(), "evicted expired staged downloads");
        }
        evicted
    }

    async fn fetch_shared(&self, artifact: &ArtifactReference) -> TransferResult {
        let identity = artifact.identity().to_string();
        let staged = self.staged_path(artifact);

        let mut rx = {
            let mut table = lock(&self.in_flight);
            match table.get(&identity) {
                Some(rx) => {
                    debug!(identity = %identity, "joining in-flight download");
                    rx.clone()
                }
                None if self.is_fresh(&staged) => return Ok(staged),
                None => {
                    let (tx, rx) = watch::channel(None);
                    table.insert(identity.clone(), rx.clone());
                    // Checksums belong to requesters, not to the shared transfer.
                    let shared = ArtifactReference {
                        checksum: None,
                        ..artifact.clone()
                    };
                    self.start_transfer(identity, shared, staged, tx);
                    rx
                }
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|value| value.clone())
            .map_err(|_| ArtifactError::SourceUnreachable("download transfer aborted".to_string()))?;
        outcome.unwrap_or_else(|| {
            Err(ArtifactError::SourceUnreachable("download transfer aborted".to_string()))
        })
    }

    /// The transfer runs detached so a requester disconnecting does not
    /// cancel it for everyone else.
    fn start_transfer(
        &self,
        identity: String,
        artifact: ArtifactReference,
        staged: PathBuf,
        tx: watch::Sender<Option<TransferResult>>,
    ) {
        let store = self.store.clone();
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            info!(identity = %identity, uri = %artifact.uri, "starting shared download");
            let result = store.fetch(&artifact, &staged).await;
            if let Err(e) = &result {
                warn!(identity = %identity, error = %e, "shared download failed");
            }
            // Publish before removing so nobody sees an empty slot mid-way.
            tx.send_replace(Some(result));
            lock(&in_flight).remove(&identity);
        });
    }
}

fn expired(meta: &std::fs::Metadata, retention: Duration, now: SystemTime) -> bool {
    meta.modified()
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|age| age > retention)
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Accept connections on `socket_path` until `cancel` fires.
pub async fn serve(
    socket_path: &Path,
    coordinator: Arc<DownloadCoordinator>,
    cancel: CancellationToken,
) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("removing stale socket {:?}", socket_path))?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
    }
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("binding download service socket {:?}", socket_path))?;
    info!(socket = %socket_path.display(), "download service listening");

    let mut eviction = interval(eviction_period(coordinator.retention()));
    eviction.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = eviction.tick() => {
                let coordinator = Arc::clone(&coordinator);
                if let Err(e) = tokio::task::spawn_blocking(move || coordinator.evict_expired()).await {
                    warn!(error = %e, "staging eviction panicked");
                }
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("accepting download service connection")?;
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, coordinator).await {
                        warn!(error = %e, "download service connection failed");
                    }
                });
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    info!("download service stopped");
    Ok(())
}

fn eviction_period(retention: Duration) -> Duration {
    (retention / 4).clamp(Duration::from_secs(1), Duration::from_secs(15 * 60))
}

async fn handle_connection(stream: UnixStream, coordinator: Arc<DownloadCoordinator>) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };

    let response = match serde_json::from_str::<DownloadRequest>(&line) {
        Ok(req) => match coordinator.fetch(&req.artifact, &req.destination).await {
            Ok(path) => DownloadResponse::Ok(path),
            Err(e) => DownloadResponse::Error(e),
        },
        Err(e) => DownloadResponse::Error(ArtifactError::ChecksumOrFormat(format!(
            "malformed download request: {e}"
        ))),
    };

    let mut out = serde_json::to_vec(&response)?;
    out.push(b'\n');
    write.write_all(&out).await?;
    write.shutdown().await?;
    Ok(())
}

/// Client side used by tasks in delegated mode.
#[derive(Debug, Clone)]
pub struct DownloadServiceClient {
    socket: PathBuf,
    timeout: Duration,
}

impl DownloadServiceClient {
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            timeout,
        }
    }

    pub async fn request(
        &self,
        artifact: &ArtifactReference,
        destination: &Path,
    ) -> Result<PathBuf, ArtifactError> {
        let req = DownloadRequest {
            artifact: artifact.clone(),
            destination: destination.to_path_buf(),
        };
        match timeout(self.timeout, self.round_trip(&req)).await {
            Ok(result) => result,
            Err(_) => Err(ArtifactError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    async fn round_trip(&self, req: &DownloadRequest) -> Result<PathBuf, ArtifactError> {
        let unavailable =
            |e: std::io::Error| ArtifactError::SourceUnreachable(format!("download service: {e}"));

        let stream = UnixStream::connect(&self.socket).await.map_err(unavailable)?;
        let (read, mut write) = stream.into_split();

        let mut line = serde_json::to_vec(req)
            .map_err(|e| ArtifactError::ChecksumOrFormat(e.to_string()))?;
        line.push(b'\n');
        write.write_all(&line).await.map_err(unavailable)?;

        let mut lines = BufReader::new(read).lines();
        let reply = lines
            .next_line()
            .await
            .map_err(unavailable)?
            .ok_or_else(|| {
                ArtifactError::SourceUnreachable("download service closed the connection".into())
            })?;

        match serde_json::from_str::<DownloadResponse>(&reply) {
            Ok(DownloadResponse::Ok(path)) => Ok(path),
            Ok(DownloadResponse::Error(e)) => Err(e),
            Err(e) => Err(ArtifactError::ChecksumOrFormat(format!(
                "malformed download service reply: {e}"
            ))),
        }
    }
}

// src/artifacts/store.rs

//! Artifact materialization.
//!
//! A successful fetch leaves a complete file at the destination: content is
//! written to a hidden temp file next to it, verified, then renamed into
//! place. Failed fetches leave nothing behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::artifacts::download_service::DownloadServiceClient;
use crate::artifacts::object_store::ObjectStore;
use crate::config::model::ArtifactsSection;
use crate::errors::ArtifactError;
use crate::fs::temp_sibling;
use crate::model::task::ArtifactReference;
use crate::pool::BoundedPool;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    object_store: Arc<dyn ObjectStore>,
    pool: BoundedPool,
    fetch_timeout: Duration,
    retry: RetryPolicy,
    cache_dir: Option<PathBuf>,
    delegate: Option<DownloadServiceClient>,
}

impl ArtifactStore {
    /// Direct-mode store without a cache.
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        pool: BoundedPool,
        fetch_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            object_store,
            pool,
            fetch_timeout,
            retry,
            cache_dir: None,
            delegate: None,
        }
    }

    pub fn from_config(
        cfg: &ArtifactsSection,
        object_store: Arc<dyn ObjectStore>,
        pool: BoundedPool,
    ) -> Self {
        let retry = RetryPolicy::unbounded(cfg.retry_initial_backoff_millis, cfg.retry_max_backoff_millis);
        let mut store = Self::new(
            object_store,
            pool,
            Duration::from_millis(cfg.fetch_timeout_millis),
            retry,
        );
        store.cache_dir = cfg.cache_directory.clone();
        if cfg.use_local_download_service {
            store.delegate = Some(DownloadServiceClient::new(
                cfg.local_download_service_socket.clone(),
                Duration::from_millis(cfg.local_download_service_timeout_millis),
            ));
        }
        store
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn delegating_to(mut self, client: DownloadServiceClient) -> Self {
        self.delegate = Some(client);
        self
    }

    /// Materialize `artifact` at `destination`.
    pub async fn fetch(
        &self,
        artifact: &ArtifactReference,
        destination: &Path,
    ) -> Result<PathBuf, ArtifactError> {
        if let Some(client) = &self.delegate {
            debug!(artifact = %artifact.uri, "fetching through local download service");
            return client.request(artifact, destination).await;
        }

        match timeout(self.fetch_timeout, self.fetch_direct(artifact, destination)).await {
            Ok(result) => result,
            Err(_) => Err(ArtifactError::Timeout(self.fetch_timeout.as_millis() as u64)),
        }
    }

    fn cached_copy(&self, artifact: &ArtifactReference) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        artifact.cache_key.as_ref()?;
        Some(dir.join(artifact.fingerprint()))
    }

    async fn fetch_direct(
        &self,
        artifact: &ArtifactReference,
        dest: &Path,
    ) -> Result<PathBuf, ArtifactError> {
        ensure_parent(dest).await?;

        let cached = self.cached_copy(artifact);
        if let Some(cached) = cached.as_deref().filter(|p| p.is_file()) {
            debug!(artifact = %artifact.uri, cache = %cached.display(), "artifact cache hit");
            materialize_from(cached, dest, artifact.checksum.as_deref()).await?;
            return Ok(dest.to_path_buf());
        }

        let tmp = temp_sibling(dest);
        let bytes = match self.download_verified(artifact, &tmp).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        };

        if let Some(cached) = cached.as_deref() {
            if let Err(e) = populate_cache(&tmp, cached).await {
                warn!(artifact = %artifact.uri, error = %e, "failed to populate artifact cache");
            }
        }

        if let Err(e) = tokio::fs::rename(&tmp, dest).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(local_io(&format!("renaming into {}", dest.display()), e));
        }

        info!(artifact = %artifact.uri, dest = %dest.display(), bytes, "artifact fetched");
        Ok(dest.to_path_buf())
    }

    async fn download_verified(
        &self,
        artifact: &ArtifactReference,
        tmp: &Path,
    ) -> Result<u64, ArtifactError> {
        let store = &self.object_store;
        let pool = &self.pool;
        let uri = artifact.uri.as_str();

        let attempt = self
            .retry
            .run(
                "artifact fetch",
                |_| async move { pool.run(store.get(uri, tmp)).await.map_err(ArtifactError::from) },
                ArtifactError::is_retryable,
            )
            .await;
        let bytes = attempt.result?;

        verify_checksum(tmp, artifact.checksum.as_deref()).await?;
        Ok(bytes)
    }
}

fn local_io(context: &str, e: std::io::Error) -> ArtifactError {
    ArtifactError::LocalIo(format!("{context}: {e}"))
}

async fn ensure_parent(dest: &Path) -> Result<(), ArtifactError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| local_io(&format!("creating {}", parent.display()), e))?;
    }
    Ok(())
}

async fn populate_cache(src: &Path, cached: &Path) -> std::io::Result<()> {
    if let Some(parent) = cached.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_sibling(cached);
    if let Err(e) = tokio::fs::copy(src, &tmp).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    tokio::fs::rename(&tmp, cached).await
}

/// Copy an already-local file to `dest` with the same temp + rename
/// discipline as a download.
pub async fn materialize_from(
    src: &Path,
    dest: &Path,
    checksum: Option<&str>,
) -> Result<(), ArtifactError> {
    ensure_parent(dest).await?;
    let tmp = temp_sibling(dest);

    let result = async {
        tokio::fs::copy(src, &tmp)
            .await
            .map_err(|e| local_io(&format!("copying {}", src.display()), e))?;
        verify_checksum(&tmp, checksum).await?;
        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(|e| local_io(&format!("renaming into {}", dest.display()), e))
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

/// Compare the blake3 digest of `path` with `expected` (hex).
pub async fn verify_checksum(path: &Path, expected: Option<&str>) -> Result<(), ArtifactError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| local_io(&format!("opening {}", path.display()), e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| local_io(&format!("reading {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let actual = hasher.finalize().to_hex();
    if actual.as_str().eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(ArtifactError::ChecksumOrFormat(format!(
            "blake3 mismatch for {}: expected {expected}, got {actual}",
            path.display()
        )))
    }
}

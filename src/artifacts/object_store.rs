// src/artifacts/object_store.rs

//! Object store access.
//!
//! - `HttpObjectStore` speaks path-style HTTP: `s3://bucket/key` becomes
//!   `{endpoint}/{bucket}/{key}`; `http(s)://` URIs are fetched as-is.
//! - `FsObjectStore` treats a local directory as the store root. It serves
//!   `file://` URIs and is what tests run against.
//!
//! Both implementations also resolve `file://` URIs directly from disk.

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::errors::ObjectStoreError;

#[async_trait]
pub trait ObjectStore: Send + Sync + Debug {
    /// Stream the object at `uri` into `dest` (created or truncated).
    /// Returns the number of bytes written.
    async fn get(&self, uri: &str, dest: &Path) -> Result<u64, ObjectStoreError>;

    /// Upload the local file `source` to `bucket`/`key`.
    async fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), ObjectStoreError>;
}

/// Split `s3://bucket/key` into its parts.
pub fn parse_s3_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("s3://")?;
    let (bucket, key) = rest.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        None
    } else {
        Some((bucket, key))
    }
}

fn file_uri_path(uri: &str) -> Option<PathBuf> {
    uri.strip_prefix("file://").map(PathBuf::from)
}

fn io_err(context: &str, e: std::io::Error) -> ObjectStoreError {
    ObjectStoreError::Io(format!("{context}: {e}"))
}

async fn copy_local(src: &Path, dest: &Path) -> Result<u64, ObjectStoreError> {
    match tokio::fs::copy(src, dest).await {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !src.exists() => {
            Err(ObjectStoreError::NotFound(src.display().to_string()))
        }
        Err(e) => Err(io_err(&format!("copying {}", src.display()), e)),
    }
}

#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpObjectStore {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, bucket, key.trim_start_matches('/'))
    }

    fn resolve(&self, uri: &str) -> Result<String, ObjectStoreError> {
        if let Some((bucket, key)) = parse_s3_uri(uri) {
            Ok(self.object_url(bucket, key))
        } else if uri.starts_with("http://") || uri.starts_with("https://") {
            Ok(uri.to_string())
        } else {
            Err(ObjectStoreError::Rejected(format!("unsupported URI scheme: {uri}")))
        }
    }
}

fn classify_status(status: StatusCode, what: &str) -> Result<(), ObjectStoreError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::NOT_FOUND {
        Err(ObjectStoreError::NotFound(what.to_string()))
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Err(ObjectStoreError::Unreachable(format!("{what}: HTTP {status}")))
    } else {
        Err(ObjectStoreError::Rejected(format!("{what}: HTTP {status}")))
    }
}

fn unreachable_err(what: &str, e: reqwest::Error) -> ObjectStoreError {
    ObjectStoreError::Unreachable(format!("{what}: {e}"))
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, uri: &str, dest: &Path) -> Result<u64, ObjectStoreError> {
        if let Some(path) = file_uri_path(uri) {
            return copy_local(&path, dest).await;
        }

        let url = self.resolve(uri)?;
        debug!(%url, "GET object");
        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| unreachable_err(uri, e))?;
        classify_status(response.status(), uri)?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| io_err(&format!("creating {}", dest.display()), e))?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|e| unreachable_err(uri, e))? {
            file.write_all(&chunk)
                .await
                .map_err(|e| io_err(&format!("writing {}", dest.display()), e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| io_err(&format!("flushing {}", dest.display()), e))?;
        Ok(written)
    }

    async fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), ObjectStoreError> {
        let url = self.object_url(bucket, key);
        let file = tokio::fs::File::open(source)
            .await
            .map_err(|e| io_err(&format!("opening {}", source.display()), e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| io_err(&format!("stat {}", source.display()), e))?
            .len();

        debug!(%url, bytes = len, "PUT object");
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let response = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await
            .map_err(|e| unreachable_err(key, e))?;
        classify_status(response.status(), key)
    }
}

/// Directory-backed store: `s3://bucket/key` is `{root}/bucket/key`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key.trim_start_matches('/'))
    }

    fn resolve(&self, uri: &str) -> Result<PathBuf, ObjectStoreError> {
        if let Some(path) = file_uri_path(uri) {
            Ok(path)
        } else if let Some((bucket, key)) = parse_s3_uri(uri) {
            Ok(self.object_path(bucket, key))
        } else {
            Err(ObjectStoreError::Rejected(format!("unsupported URI scheme: {uri}")))
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, uri: &str, dest: &Path) -> Result<u64, ObjectStoreError> {
        let src = self.resolve(uri)?;
        if !src.is_file() {
            return Err(ObjectStoreError::NotFound(uri.to_string()));
        }
        copy_local(&src, dest).await
    }

    async fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), ObjectStoreError> {
        let dest = self.object_path(bucket, key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(&format!("creating {}", parent.display()), e))?;
        }
        copy_local(source, &dest).await.map(|_| ())
    }
}

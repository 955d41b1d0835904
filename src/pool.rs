// src/pool.rs

//! Bounded worker pools.
//!
//! Each pool is a named semaphore. Work submitted through a pool waits for a
//! permit, so an exhausted pool blocks its callers instead of spawning more
//! concurrent work.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::model::ConfigFile;

#[derive(Debug, Clone)]
pub struct BoundedPool {
    name: &'static str,
    size: usize,
    permits: Arc<Semaphore>,
}

impl BoundedPool {
    /// A pool of `size` concurrent slots. Zero is bumped to one.
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name,
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `fut` on the caller's task while holding one slot.
    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        // The semaphore is never closed, so acquisition only fails if that
        // changes; in that case the work still runs.
        let _permit = self.permits.acquire().await.ok();
        fut.await
    }

    /// Spawn `fut` as a Tokio task that first waits for a slot.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            fut.await
        })
    }
}

/// The independently sized pools the agent runs on.
#[derive(Debug, Clone)]
pub struct WorkerPools {
    pub kill: BoundedPool,
    pub check: BoundedPool,
    pub download: BoundedPool,
    pub upload: BoundedPool,
}

impl WorkerPools {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self {
            kill: BoundedPool::new("kill", cfg.executor.kill_threads),
            check: BoundedPool::new("check", cfg.executor.thread_check_threads),
            download: BoundedPool::new("download", cfg.artifacts.download_threads),
            upload: BoundedPool::new("upload", cfg.s3.upload_threads),
        }
    }
}

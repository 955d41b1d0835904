use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use nodeward::artifacts::ObjectStore;
use nodeward::cleanup::LiveTaskSource;
use nodeward::errors::{CleanupError, ObjectStoreError};
use nodeward::events::history::{HistoryEntry, HistorySink};
use nodeward::exec::{StatusReporter, StatusUpdate};

/// Wraps another store, counting transfers and optionally slowing reads
/// down so concurrent requests overlap.
#[derive(Debug)]
pub struct CountingObjectStore {
    inner: Arc<dyn ObjectStore>,
    get_delay: Duration,
    gets: AtomicUsize,
    puts: Mutex<Vec<(String, String)>>,
}

impl CountingObjectStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            get_delay: Duration::ZERO,
            gets: AtomicUsize::new(0),
            puts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_get_delay(mut self, delay: Duration) -> Self {
        self.get_delay = delay;
        self
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// `(bucket, key)` of every successful put, in completion order.
    pub fn put_keys(&self) -> Vec<(String, String)> {
        self.puts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for CountingObjectStore {
    async fn get(&self, uri: &str, dest: &Path) -> Result<u64, ObjectStoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if !self.get_delay.is_zero() {
            tokio::time::sleep(self.get_delay).await;
        }
        self.inner.get(uri, dest).await
    }

    async fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), ObjectStoreError> {
        self.inner.put(bucket, key, source).await?;
        self.puts
            .lock()
            .unwrap()
            .push((bucket.to_string(), key.to_string()));
        Ok(())
    }
}

/// A fixed live-task list.
#[derive(Debug, Default)]
pub struct StaticLiveTasks {
    ids: HashSet<String>,
    calls: AtomicUsize,
}

impl StaticLiveTasks {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiveTaskSource for StaticLiveTasks {
    async fn live_task_ids(&self) -> Result<HashSet<String>, CleanupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.ids.clone())
    }
}

/// A live-task source that is always down.
#[derive(Debug, Default)]
pub struct FailingLiveTasks;

#[async_trait]
impl LiveTaskSource for FailingLiveTasks {
    async fn live_task_ids(&self) -> Result<HashSet<String>, CleanupError> {
        Err(CleanupError::LiveListUnavailable("scheduler is down".to_string()))
    }
}

/// Keeps every status update it is given.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    updates: Mutex<Vec<StatusUpdate>>,
}

impl RecordingReporter {
    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().unwrap().clone()
    }

    /// State labels in report order, e.g. `["LAUNCHING", "RUNNING", ...]`.
    pub fn states(&self) -> Vec<String> {
        self.updates().into_iter().map(|u| u.state).collect()
    }
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn report(&self, update: &StatusUpdate) -> anyhow::Result<()> {
        self.updates.lock().unwrap().push(update.clone());
        Ok(())
    }
}

/// A history store whose appends never complete.
#[derive(Debug, Default)]
pub struct StalledHistorySink {
    appends: AtomicUsize,
}

impl StalledHistorySink {
    /// Appends started so far.
    pub fn appends(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistorySink for StalledHistorySink {
    async fn append(&self, _entry: &HistoryEntry) -> anyhow::Result<()> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// A scheduler that accepts the connection and never answers.
#[derive(Debug, Default)]
pub struct StalledReporter {
    reports: AtomicUsize,
}

impl StalledReporter {
    pub fn reports(&self) -> usize {
        self.reports.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusReporter for StalledReporter {
    async fn report(&self, _update: &StatusUpdate) -> anyhow::Result<()> {
        self.reports.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

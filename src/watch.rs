// src/watch.rs

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::model::task::has_suffix;

/// Handle for a directory watcher.
///
/// Keeps the underlying `RecommendedWatcher` alive; dropping it stops
/// watching and closes the paired receiver.
pub struct WatcherHandle {
    _inner: RecommendedWatcher,
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle").finish()
    }
}

/// Watch `dir` (non-recursively) and yield paths of files ending in `suffix`
/// that are created, modified or renamed into place.
///
/// The same path may be reported more than once; consumers must be
/// idempotent.
pub fn watch_directory(
    dir: &Path,
    suffix: &str,
) -> Result<(WatcherHandle, mpsc::UnboundedReceiver<PathBuf>)> {
    let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();
    let suffix = suffix.to_string();

    // Called synchronously by notify on its own thread.
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                for path in event.paths {
                    if has_suffix(&path, &suffix) {
                        debug!(path = %path.display(), "watched file changed");
                        if tx.send(path).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(err) => warn!("file watch error: {err}"),
        },
        Config::default(),
    )
    .context("creating file watcher")?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watching {:?}", dir))?;
    info!("file watcher started on {:?}", dir);

    Ok((WatcherHandle { _inner: watcher }, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn reports_matching_files_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_handle, mut rx) = watch_directory(dir.path(), ".task.json").expect("watch");

        std::fs::write(dir.path().join("ignored.txt"), b"x").expect("write");
        std::fs::write(dir.path().join("t1.task.json"), b"{}").expect("write");

        let got = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        assert_eq!(got.file_name().and_then(|n| n.to_str()), Some("t1.task.json"));
    }
}

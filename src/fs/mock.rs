// src/fs/mock.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use anyhow::{anyhow, Result};

use super::FileSystem;

#[derive(Debug, Clone)]
enum MockEntry {
    File { content: Vec<u8>, modified: SystemTime },
    Dir,
}

/// In-memory filesystem for tests.
///
/// Directories are implicit: adding a file creates its ancestors. Removals
/// are recorded so tests can assert on exactly what was deleted, and paths
/// can be marked as failing to simulate permission errors.
#[derive(Debug, Clone, Default)]
pub struct MockFileSystem {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    entries: BTreeMap<PathBuf, MockEntry>,
    removed: Vec<PathBuf>,
    failing: Vec<PathBuf>,
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panic while holding the lock only happens in a failing test.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        self.add_file_modified(path, content, SystemTime::now());
    }

    pub fn add_file_modified(
        &self,
        path: impl AsRef<Path>,
        content: impl Into<Vec<u8>>,
        modified: SystemTime,
    ) {
        let path = path.as_ref().to_path_buf();
        let mut state = self.state();
        ensure_ancestors(&mut state.entries, &path);
        state.entries.insert(
            path,
            MockEntry::File {
                content: content.into(),
                modified,
            },
        );
    }

    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let mut state = self.state();
        ensure_ancestors(&mut state.entries, &path);
        state.entries.insert(path, MockEntry::Dir);
    }

    /// Every removal on `path` (or below it) fails from now on.
    pub fn fail_removals_under(&self, path: impl AsRef<Path>) {
        self.state().failing.push(path.as_ref().to_path_buf());
    }

    /// Paths passed to successful `remove_file` / `remove_dir_all` calls.
    pub fn removed(&self) -> Vec<PathBuf> {
        self.state().removed.clone()
    }
}

fn ensure_ancestors(entries: &mut BTreeMap<PathBuf, MockEntry>, path: &Path) {
    for ancestor in path.ancestors().skip(1) {
        if ancestor.as_os_str().is_empty() {
            continue;
        }
        entries
            .entry(ancestor.to_path_buf())
            .or_insert(MockEntry::Dir);
    }
}

fn check_failing(state: &MockState, path: &Path) -> Result<()> {
    if state.failing.iter().any(|f| path.starts_with(f)) {
        return Err(anyhow!("permission denied: {:?}", path));
    }
    Ok(())
}

impl FileSystem for MockFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        match self.state().entries.get(path) {
            Some(MockEntry::File { content, .. }) => {
                String::from_utf8(content.clone()).map_err(|e| anyhow!("Invalid UTF-8: {}", e))
            }
            Some(MockEntry::Dir) => Err(anyhow!("Is a directory: {:?}", path)),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.add_file(path, contents);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.state().entries.contains_key(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        matches!(self.state().entries.get(path), Some(MockEntry::File { .. }))
    }

    fn is_dir(&self, path: &Path) -> bool {
        matches!(self.state().entries.get(path), Some(MockEntry::Dir))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let state = self.state();
        match state.entries.get(path) {
            Some(MockEntry::Dir) => Ok(state
                .entries
                .keys()
                .filter(|p| p.parent() == Some(path))
                .cloned()
                .collect()),
            _ => Err(anyhow!("Not a directory or not found: {:?}", path)),
        }
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.add_dir(path);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let mut state = self.state();
        check_failing(&state, path)?;
        match state.entries.get(path) {
            Some(MockEntry::File { .. }) => {
                state.entries.remove(path);
                state.removed.push(path.to_path_buf());
                Ok(())
            }
            Some(MockEntry::Dir) => Err(anyhow!("Is a directory: {:?}", path)),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        let mut state = self.state();
        check_failing(&state, path)?;
        if !matches!(state.entries.get(path), Some(MockEntry::Dir)) {
            return Err(anyhow!("Not a directory or not found: {:?}", path));
        }
        state.entries.retain(|p, _| !p.starts_with(path));
        state.removed.push(path.to_path_buf());
        Ok(())
    }

    fn modified(&self, path: &Path) -> Result<SystemTime> {
        match self.state().entries.get(path) {
            Some(MockEntry::File { modified, .. }) => Ok(*modified),
            Some(MockEntry::Dir) => Ok(SystemTime::UNIX_EPOCH),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_create_implicit_directories() {
        let fs = MockFileSystem::new();
        fs.add_file("/tasks/a/service.log", "hello");

        assert!(fs.is_dir(Path::new("/tasks")));
        assert!(fs.is_dir(Path::new("/tasks/a")));
        assert_eq!(
            fs.read_dir(Path::new("/tasks")).expect("read_dir"),
            vec![PathBuf::from("/tasks/a")]
        );
    }

    #[test]
    fn remove_dir_all_drops_subtree_and_records_it() {
        let fs = MockFileSystem::new();
        fs.add_file("/tasks/a/app/bin", "x");
        fs.add_file("/tasks/b/service.log", "y");

        fs.remove_dir_all(Path::new("/tasks/a")).expect("remove");

        assert!(!fs.exists(Path::new("/tasks/a/app/bin")));
        assert!(fs.exists(Path::new("/tasks/b/service.log")));
        assert_eq!(fs.removed(), vec![PathBuf::from("/tasks/a")]);
    }

    #[test]
    fn failing_removals() {
        let fs = MockFileSystem::new();
        fs.add_file("/tasks/a/x", "x");
        fs.fail_removals_under("/tasks/a");

        assert!(fs.remove_dir_all(Path::new("/tasks/a")).is_err());
        assert!(fs.exists(Path::new("/tasks/a/x")));
    }
}

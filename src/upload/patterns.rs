// src/upload/patterns.rs

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::config::model::ConfigFile;

/// Compiled upload patterns for a finished task.
///
/// Patterns are relative to the task directory and cover:
///
/// - the service log itself,
/// - rotated service logs under the rotation directory,
/// - the tail-of-finished-service file,
/// - every `[s3].additional_files_to_backup` glob.
#[derive(Clone)]
pub struct UploadProfile {
    patterns: Vec<String>,
    set: GlobSet,
}

impl fmt::Debug for UploadProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadProfile")
            .field("patterns", &self.patterns)
            .finish_non_exhaustive()
    }
}

impl UploadProfile {
    pub fn from_config(cfg: &ConfigFile) -> Result<Self> {
        let ex = &cfg.executor;
        let mut patterns = vec![
            ex.service_log.clone(),
            format!("{}/{}*", cfg.logrotate.to_directory.trim_end_matches('/'), ex.service_log),
            ex.service_finished_tail_log.clone(),
        ];
        patterns.extend(cfg.s3.additional_files_to_backup.iter().cloned());
        Self::new(patterns)
    }

    pub fn new(patterns: Vec<String>) -> Result<Self> {
        let set = build_globset(&patterns).context("building upload globset")?;
        Ok(Self { patterns, set })
    }

    /// `rel_path` uses forward slashes, relative to the task directory.
    pub fn matches(&self, rel_path: &str) -> bool {
        self.set.is_match(rel_path)
    }

    /// Every matching regular file under `root`, sorted. Hidden files
    /// (in-progress temp files) are skipped.
    pub fn collect_upload_candidates(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        if root.is_dir() {
            self.walk(root, root, &mut out)?;
        }
        out.sort();
        Ok(out)
    }

    fn walk(&self, root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        for entry in std::fs::read_dir(dir).with_context(|| format!("reading {:?}", dir))? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.walk(root, &path, out)?;
            } else if file_type.is_file() {
                if let Some(rel) = relative_str(root, &path) {
                    if self.matches(&rel) {
                        out.push(path);
                    }
                }
            }
        }
        Ok(())
    }
}

/// `*` does not cross directory separators; `**` does.
fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let glob = GlobBuilder::new(pat)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid glob pattern: {pat}"))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

fn relative_str(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(rel.to_string_lossy().replace('\\', "/"))
}

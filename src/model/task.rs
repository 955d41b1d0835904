// src/model/task.rs

//! Task descriptors and their on-disk definition files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::model::{ConfigFile, ExecutorSection};
use crate::fs::FileSystem;
use crate::model::deploy::DeployMarker;

static UNSAFE_ID_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^A-Za-z0-9._-]").unwrap_or_else(|_| unreachable!("static regex is valid"))
});

/// Make an arbitrary identifier safe to use as a single path component.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned = UNSAFE_ID_CHARS.replace_all(raw, "_");
    match cleaned.as_ref() {
        "" | "." | ".." => format!("_{cleaned}"),
        _ => cleaned.into_owned(),
    }
}

/// File-name form of a task id, used for every per-task file the agent
/// writes outside the task directory.
pub fn sanitize_task_id(task_id: &str) -> String {
    sanitize_component(task_id)
}

/// A bootstrap artifact to materialize before launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactReference {
    /// `s3://bucket/key`, `http(s)://...` or `file:///...`.
    pub uri: String,

    /// Destination, relative to the task's working directory unless absolute.
    pub target: PathBuf,

    /// Shared identity for caching / coalescing; defaults to the URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,

    /// Expected blake3 hex digest of the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ArtifactReference {
    pub fn new(uri: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        Self {
            uri: uri.into(),
            target: target.into(),
            cache_key: None,
            checksum: None,
        }
    }

    /// Key under which concurrent fetches of the same content coalesce.
    pub fn identity(&self) -> &str {
        self.cache_key.as_deref().unwrap_or(&self.uri)
    }

    /// File name for a stored copy of this artifact: the blake3 digest of
    /// its identity, so distinct identities never share a file.
    pub fn fingerprint(&self) -> String {
        blake3::hash(self.identity().as_bytes()).to_hex().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Exported to the task as `TASK_MAX_THREADS`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_threads: Option<u32>,
}

/// Everything the supervisor needs to run one task. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub task_id: String,
    pub request_name: String,
    /// Task root; holds the service log, the working directory and rotated logs.
    pub app_directory: PathBuf,
    pub command: String,
    #[serde(default)]
    pub artifacts: Vec<ArtifactReference>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Set when the task belongs to a deploy; its lifecycle is then announced
    /// as deploy events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployMarker>,
}

/// Derived on-disk layout of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPaths {
    pub root: PathBuf,
    pub work_dir: PathBuf,
    pub service_log: PathBuf,
    pub tail_file: PathBuf,
    pub rotated_dir: PathBuf,
    pub rotation_state: PathBuf,
}

impl TaskPaths {
    pub fn new(task: &TaskDescriptor, cfg: &ConfigFile) -> Self {
        let root = task.app_directory.clone();
        let ex = &cfg.executor;
        Self {
            work_dir: root.join(&ex.task_app_directory),
            service_log: root.join(&ex.service_log),
            tail_file: root.join(&ex.service_finished_tail_log),
            rotated_dir: root.join(&cfg.logrotate.to_directory),
            rotation_state: root.join(&cfg.logrotate.state_file),
            root,
        }
    }

    /// Resolve an artifact target against the working directory.
    pub fn artifact_destination(&self, artifact: &ArtifactReference) -> PathBuf {
        if artifact.target.is_absolute() {
            artifact.target.clone()
        } else {
            self.work_dir.join(&artifact.target)
        }
    }
}

/// Path of the TaskDefinitionFile claiming `task_id`.
pub fn definition_path(ex: &ExecutorSection, task_id: &str) -> PathBuf {
    ex.task_definition_directory.join(format!(
        "{}{}",
        sanitize_task_id(task_id),
        ex.task_definition_suffix
    ))
}

pub fn write_definition(
    fs: &dyn FileSystem,
    ex: &ExecutorSection,
    task: &TaskDescriptor,
) -> Result<PathBuf> {
    let path = definition_path(ex, &task.task_id);
    let json = serde_json::to_vec_pretty(task).context("serializing task definition")?;
    fs.write_atomic(&path, &json)?;
    Ok(path)
}

pub fn read_definition(fs: &dyn FileSystem, path: &Path) -> Result<TaskDescriptor> {
    let text = fs.read_to_string(path)?;
    serde_json::from_str(&text).with_context(|| format!("parsing task definition {:?}", path))
}

/// Definition files currently claimed in the definition directory, sorted.
pub fn list_definitions(fs: &dyn FileSystem, ex: &ExecutorSection) -> Result<Vec<PathBuf>> {
    let dir = &ex.task_definition_directory;
    if !fs.is_dir(dir) {
        return Ok(Vec::new());
    }
    let mut out: Vec<PathBuf> = fs
        .read_dir(dir)?
        .into_iter()
        .filter(|p| has_suffix(p, &ex.task_definition_suffix))
        .collect();
    out.sort();
    Ok(out)
}

/// Whether the file name ends with `suffix` (temp files excluded).
pub fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(suffix) && !n.starts_with('.'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    #[test]
    fn fingerprints_keep_identities_apart() {
        let nested = ArtifactReference::new("s3://b/a/x", "x");
        let flat = ArtifactReference::new("s3://b/a_x", "x");
        assert_eq!(sanitize_component(nested.identity()), sanitize_component(flat.identity()));
        assert_ne!(nested.fingerprint(), flat.fingerprint());

        let mut keyed = ArtifactReference::new("s3://mirror/a/x", "x");
        keyed.cache_key = Some("s3://b/a/x".into());
        assert_eq!(keyed.fingerprint(), nested.fingerprint());
        assert_eq!(nested.fingerprint().len(), 64);
    }

    #[test]
    fn sanitize_replaces_separators_and_dots() {
        assert_eq!(sanitize_task_id("req-1/deploy:2"), "req-1_deploy_2");
        assert_eq!(sanitize_task_id("a b\nc"), "a_b_c");
        assert_eq!(sanitize_task_id(".."), "_..");
        assert_eq!(sanitize_task_id(""), "_");
        assert_eq!(sanitize_task_id("ok.task_1-2"), "ok.task_1-2");
    }

    #[test]
    fn descriptor_json_uses_camel_case() {
        let json = r#"{
            "taskId": "t1",
            "requestName": "web",
            "appDirectory": "/tasks/t1",
            "command": "./run.sh",
            "artifacts": [{"uri": "s3://b/k.tar", "target": "k.tar", "cacheKey": "k-v1"}],
            "limits": {"maxThreads": 64}
        }"#;
        let task: TaskDescriptor = serde_json::from_str(json).expect("parse");
        assert_eq!(task.artifacts[0].identity(), "k-v1");
        assert_eq!(task.limits.max_threads, Some(64));
        assert!(task.user.is_none());
    }

    #[test]
    fn paths_follow_config() {
        let task = TaskDescriptor {
            task_id: "t1".into(),
            request_name: "web".into(),
            app_directory: PathBuf::from("/tasks/t1"),
            command: "true".into(),
            artifacts: vec![],
            limits: ResourceLimits::default(),
            user: None,
            env: BTreeMap::new(),
            deploy: None,
        };
        let paths = TaskPaths::new(&task, &ConfigFile::default());
        assert_eq!(paths.work_dir, PathBuf::from("/tasks/t1/app"));
        assert_eq!(paths.service_log, PathBuf::from("/tasks/t1/service.log"));
        assert_eq!(paths.rotated_dir, PathBuf::from("/tasks/t1/logs"));
        assert_eq!(
            paths.artifact_destination(&ArtifactReference::new("file:///x", "bin/x")),
            PathBuf::from("/tasks/t1/app/bin/x")
        );
    }

    #[test]
    fn definitions_round_trip_through_directory() {
        let fs = MockFileSystem::new();
        let mut ex = ExecutorSection::default();
        ex.task_definition_directory = PathBuf::from("/defs");

        let task = TaskDescriptor {
            task_id: "web:1".into(),
            request_name: "web".into(),
            app_directory: PathBuf::from("/tasks/web_1"),
            command: "true".into(),
            artifacts: vec![],
            limits: ResourceLimits::default(),
            user: Some("svc".into()),
            env: BTreeMap::new(),
            deploy: None,
        };
        let path = write_definition(&fs, &ex, &task).expect("write");
        assert_eq!(path, PathBuf::from("/defs/web_1.task.json"));
        fs.add_file("/defs/notes.txt", "ignored");

        let listed = list_definitions(&fs, &ex).expect("list");
        assert_eq!(listed, vec![path.clone()]);
        assert_eq!(read_definition(&fs, &path).expect("read"), task);
    }
}

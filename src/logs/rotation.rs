// src/logs/rotation.rs

//! Per-task log rotation.
//!
//! The planner does not rotate anything itself. It renders a configuration
//! for the external rotation tool while the task runs and forces one final
//! rotation when the task ends. The reaper deletes the configuration.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::model::{ConfigFile, LogrotateSection};
use crate::errors::RotationError;
use crate::fs::temp_sibling;
use crate::logs::tail;
use crate::model::task::{sanitize_task_id, TaskDescriptor, TaskPaths};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationCadence {
    Daily,
    Size(u64),
}

/// Rotation settings for one task, derived once from config and task layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPolicy {
    pub cadence: RotationCadence,
    pub max_age_days: u32,
    pub count: u32,
    pub dateformat: String,
    pub destination: PathBuf,
    pub extras: Vec<PathBuf>,
    pub extras_dateformat: String,
}

impl RotationPolicy {
    pub fn derive(cfg: &LogrotateSection, paths: &TaskPaths) -> Self {
        Self {
            cadence: match cfg.rotate_after_bytes {
                Some(bytes) if bytes > 0 => RotationCadence::Size(bytes),
                _ => RotationCadence::Daily,
            },
            max_age_days: cfg.maxage_days,
            count: cfg.count,
            dateformat: cfg.dateformat.clone(),
            destination: paths.rotated_dir.clone(),
            extras: cfg.extras_files.iter().map(|f| paths.root.join(f)).collect(),
            extras_dateformat: cfg.extras_dateformat.clone(),
        }
    }
}

/// Quote a path for the rotation tool's config syntax.
fn quote(path: &Path) -> Result<String, RotationError> {
    let s = path.to_string_lossy();
    if s.is_empty() || s.contains(['\n', '\r', '\0']) {
        return Err(RotationError::UnsafePath(path.to_path_buf()));
    }
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    Ok(format!("\"{escaped}\""))
}

fn write_block(
    out: &mut String,
    target: &Path,
    policy: &RotationPolicy,
    dateformat: &str,
) -> Result<(), RotationError> {
    let cadence = match policy.cadence {
        RotationCadence::Daily => "daily".to_string(),
        RotationCadence::Size(bytes) => format!("size {bytes}"),
    };
    // Writes into a String cannot fail.
    let _ = writeln!(out, "{} {{", quote(target)?);
    let _ = writeln!(out, "  {cadence}");
    let _ = writeln!(out, "  rotate {}", policy.count);
    let _ = writeln!(out, "  maxage {}", policy.max_age_days);
    let _ = writeln!(out, "  dateext");
    let _ = writeln!(out, "  dateformat {dateformat}");
    let _ = writeln!(out, "  olddir {}", quote(&policy.destination)?);
    let _ = writeln!(out, "  copytruncate");
    let _ = writeln!(out, "  missingok");
    let _ = writeln!(out, "  notifempty");
    let _ = writeln!(out, "}}");
    Ok(())
}

/// Render the rotation-tool configuration for a task's service log.
pub fn render_config(
    task_id: &str,
    service_log: &Path,
    policy: &RotationPolicy,
) -> Result<String, RotationError> {
    let mut out = format!("# generated by nodeward for task {}\n", sanitize_task_id(task_id));
    write_block(&mut out, service_log, policy, &policy.dateformat)?;
    for extra in &policy.extras {
        out.push('\n');
        write_block(&mut out, extra, policy, &policy.extras_dateformat)?;
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct LogRotationPlanner {
    config: Arc<ConfigFile>,
}

impl LogRotationPlanner {
    pub fn new(config: Arc<ConfigFile>) -> Self {
        Self { config }
    }

    fn section(&self) -> &LogrotateSection {
        &self.config.logrotate
    }

    pub fn config_path(&self, task_id: &str) -> PathBuf {
        self.section().conf_directory.join(sanitize_task_id(task_id))
    }

    pub fn policy_for(&self, task: &TaskDescriptor) -> RotationPolicy {
        RotationPolicy::derive(self.section(), &TaskPaths::new(task, &self.config))
    }

    /// Write the task's rotation config. Safe to call repeatedly.
    pub fn ensure_rotation_configured(&self, task: &TaskDescriptor) -> Result<PathBuf, RotationError> {
        let paths = TaskPaths::new(task, &self.config);
        let policy = RotationPolicy::derive(self.section(), &paths);
        let rendered = render_config(&task.task_id, &paths.service_log, &policy)?;

        std::fs::create_dir_all(&policy.destination)?;
        let conf = self.config_path(&task.task_id);
        if let Some(parent) = conf.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = temp_sibling(&conf);
        if let Err(e) = std::fs::write(&tmp, rendered).and_then(|_| std::fs::rename(&tmp, &conf)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        debug!(task_id = %task.task_id, conf = %conf.display(), "rotation configured");
        Ok(conf)
    }

    /// Run the rotation tool once with `-f` against the task's config.
    pub async fn force_rotate(&self, task: &TaskDescriptor) -> Result<(), RotationError> {
        let section = self.section();
        let paths = TaskPaths::new(task, &self.config);
        let conf = self.config_path(&task.task_id);
        let limit = Duration::from_millis(section.command_timeout_millis);

        let child = Command::new(&section.command)
            .arg("-f")
            .arg("-s")
            .arg(&paths.rotation_state)
            .arg(&conf)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match timeout(limit, child).await {
            Ok(output) => output?,
            Err(_) => return Err(RotationError::Timeout(section.command_timeout_millis)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(RotationError::CommandFailed(format!(
                "{} exited with {}: {}",
                section.command, output.status, stderr
            )));
        }

        info!(task_id = %task.task_id, "forced final rotation");
        Ok(())
    }

    /// Bounded tail of `path`, read off the async runtime.
    pub async fn capture_tail(&self, path: &Path, max_lines: usize) -> std::io::Result<Vec<String>> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || tail::capture_tail(&path, max_lines))
            .await
            .map_err(std::io::Error::other)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::model::task::ResourceLimits;

    fn task(root: &Path) -> TaskDescriptor {
        TaskDescriptor {
            task_id: "web:1".into(),
            request_name: "web".into(),
            app_directory: root.to_path_buf(),
            command: "true".into(),
            artifacts: vec![],
            limits: ResourceLimits::default(),
            user: None,
            env: BTreeMap::new(),
            deploy: None,
        }
    }

    fn policy() -> RotationPolicy {
        RotationPolicy {
            cadence: RotationCadence::Daily,
            max_age_days: 7,
            count: 20,
            dateformat: "-%Y%m%d%s".into(),
            destination: PathBuf::from("/tasks/t1/logs"),
            extras: vec![],
            extras_dateformat: "-%Y%m%d".into(),
        }
    }

    #[test]
    fn renders_daily_block() {
        let out = render_config("t1", Path::new("/tasks/t1/service.log"), &policy()).expect("render");
        assert!(out.contains("\"/tasks/t1/service.log\" {\n  daily\n  rotate 20\n  maxage 7\n"));
        assert!(out.contains("  dateformat -%Y%m%d%s\n"));
        assert!(out.contains("  olddir \"/tasks/t1/logs\"\n"));
    }

    #[test]
    fn size_cadence_and_extras_get_their_own_dateformat() {
        let mut p = policy();
        p.cadence = RotationCadence::Size(1024);
        p.extras = vec![PathBuf::from("/tasks/t1/app/gc*.log")];
        let out = render_config("t1", Path::new("/tasks/t1/service.log"), &p).expect("render");
        assert!(out.contains("  size 1024\n"));
        assert!(out.contains("\"/tasks/t1/app/gc*.log\" {"));
        assert!(out.contains("  dateformat -%Y%m%d\n"));
        assert!(!out.contains("daily"));
    }

    #[test]
    fn quotes_are_escaped_and_newlines_rejected() {
        let out = render_config("t1", Path::new("/tasks/we\"ird/service.log"), &policy()).expect("render");
        assert!(out.contains(r#""/tasks/we\"ird/service.log" {"#));

        let err = render_config("t1", Path::new("/tasks/a\nb/service.log"), &policy()).unwrap_err();
        assert!(matches!(err, RotationError::UnsafePath(_)));
    }

    #[tokio::test]
    async fn ensure_writes_config_and_olddir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = ConfigFile::default();
        cfg.logrotate.conf_directory = dir.path().join("logrotate.d");
        let planner = LogRotationPlanner::new(Arc::new(cfg));
        let t = task(&dir.path().join("task"));

        let conf = planner.ensure_rotation_configured(&t).expect("ensure");
        assert_eq!(conf, dir.path().join("logrotate.d/web_1"));
        assert!(dir.path().join("task/logs").is_dir());
        let text = std::fs::read_to_string(&conf).expect("read");
        assert!(text.contains("service.log"));

        // Idempotent.
        assert_eq!(planner.ensure_rotation_configured(&t).expect("again"), conf);
    }

    #[tokio::test]
    async fn force_rotate_reports_command_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = ConfigFile::default();
        cfg.logrotate.conf_directory = dir.path().join("logrotate.d");
        cfg.logrotate.command = "true".into();
        let t = task(&dir.path().join("task"));

        LogRotationPlanner::new(Arc::new(cfg.clone()))
            .force_rotate(&t)
            .await
            .expect("true succeeds");

        cfg.logrotate.command = "false".into();
        let err = LogRotationPlanner::new(Arc::new(cfg)).force_rotate(&t).await.unwrap_err();
        assert!(matches!(err, RotationError::CommandFailed(_)));
    }
}

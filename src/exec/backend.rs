// src/exec/backend.rs

//! Pluggable process backend.
//!
//! The task runner talks to a `ProcessBackend` instead of spawning OS
//! processes itself, so tests can substitute a scripted fake.
//!
//! - `RealProcessBackend` runs the task command through `sh -c` in its own
//!   process group, as the configured user, with stdout/stderr appended to
//!   the task's service log.
//! - Signals go to the whole process group so children of the shell are
//!   stopped too.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs::OpenOptions;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{Pid, Uid, User};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::types::StopMode;

/// Everything needed to start a task process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub task_id: String,
    pub command: String,
    pub work_dir: PathBuf,
    pub log_path: PathBuf,
    pub user: Option<String>,
    pub env: BTreeMap<String, String>,
}

/// Exit information as observed by the liveness checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Used when the process state could not be determined.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {code}"),
            (None, Some(sig)) => format!("terminated by signal {sig}"),
            (None, None) => "exited with unknown status".to_string(),
        }
    }
}

/// A started task process.
pub trait ManagedProcess: Send + Debug {
    fn pid(&self) -> Option<u32>;

    /// Deliver the graceful or forced signal. Signalling a process that is
    /// already gone is not an error.
    fn signal(&mut self, mode: StopMode) -> Result<()>;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> Result<Option<ExitInfo>>;
}

/// Shared between the liveness checker and the escalation logic.
pub type SharedProcess = Arc<Mutex<Box<dyn ManagedProcess>>>;

pub fn share(process: Box<dyn ManagedProcess>) -> SharedProcess {
    Arc::new(Mutex::new(process))
}

#[async_trait]
pub trait ProcessBackend: Send + Sync + Debug {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ManagedProcess>>;
}

/// Production backend.
#[derive(Debug, Clone, Default)]
pub struct RealProcessBackend;

#[async_trait]
impl ProcessBackend for RealProcessBackend {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ManagedProcess>> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .with_context(|| format!("opening service log {:?}", spec.log_path))?;
        let log_err = log
            .try_clone()
            .with_context(|| format!("duplicating service log handle {:?}", spec.log_path))?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.work_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .kill_on_drop(false);

        if let Some(name) = spec.user.as_deref() {
            let user = User::from_name(name)
                .with_context(|| format!("looking up user '{name}'"))?
                .ok_or_else(|| anyhow!("unknown user '{name}'"))?;
            if user.uid != Uid::current() {
                cmd.uid(user.uid.as_raw()).gid(user.gid.as_raw());
            }
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("spawning process for task '{}'", spec.task_id))?;
        let pid = child.id();

        info!(
            task_id = %spec.task_id,
            pid = ?pid,
            cmd = %spec.command,
            work_dir = %spec.work_dir.display(),
            "task process started"
        );

        Ok(Box::new(RealProcess {
            task_id: spec.task_id.clone(),
            pgid: pid.map(|p| p as i32),
            child,
        }))
    }
}

#[derive(Debug)]
struct RealProcess {
    task_id: String,
    /// The child leads its own group, so its pid is the group id.
    pgid: Option<i32>,
    child: Child,
}

impl ManagedProcess for RealProcess {
    fn pid(&self) -> Option<u32> {
        self.pgid.map(|p| p as u32)
    }

    fn signal(&mut self, mode: StopMode) -> Result<()> {
        let Some(pgid) = self.pgid else {
            return Ok(());
        };
        let sig = match mode {
            StopMode::Graceful => Signal::SIGTERM,
            StopMode::Forced => Signal::SIGKILL,
        };
        match killpg(Pid::from_raw(pgid), sig) {
            Ok(()) => {
                debug!(task_id = %self.task_id, pgid, signal = %sig, "signalled process group");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!(task_id = %self.task_id, pgid, "process group already gone");
                Ok(())
            }
            Err(e) => Err(anyhow!("sending {sig} to process group {pgid}: {e}")),
        }
    }

    fn try_wait(&mut self) -> Result<Option<ExitInfo>> {
        let status = self
            .child
            .try_wait()
            .with_context(|| format!("polling process of task '{}'", self.task_id))?;
        Ok(status.map(|s| ExitInfo {
            code: s.code(),
            signal: s.signal(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(dir: &std::path::Path, command: &str) -> LaunchSpec {
        LaunchSpec {
            task_id: "t".into(),
            command: command.into(),
            work_dir: dir.to_path_buf(),
            log_path: dir.join("service.log"),
            user: None,
            env: BTreeMap::from([("GREETING".to_string(), "hi".to_string())]),
        }
    }

    async fn wait_exit(p: &mut Box<dyn ManagedProcess>) -> ExitInfo {
        for _ in 0..500 {
            if let Some(info) = p.try_wait().expect("try_wait") {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process did not exit");
    }

    #[tokio::test]
    async fn output_goes_to_service_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut p = RealProcessBackend
            .spawn(&spec(dir.path(), "echo $GREETING; echo oops >&2; exit 3"))
            .await
            .expect("spawn");

        let info = wait_exit(&mut p).await;
        assert_eq!(info.code, Some(3));
        assert!(!info.success());

        let log = std::fs::read_to_string(dir.path().join("service.log")).expect("log");
        assert!(log.contains("hi"));
        assert!(log.contains("oops"));
    }

    #[tokio::test]
    async fn forced_signal_kills_group() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut p = RealProcessBackend
            .spawn(&spec(dir.path(), "trap '' TERM; sleep 30"))
            .await
            .expect("spawn");

        p.signal(StopMode::Forced).expect("kill");
        let info = wait_exit(&mut p).await;
        assert_eq!(info.signal, Some(9));
        // Signalling a dead group is fine.
        p.signal(StopMode::Graceful).expect("no-op");
    }
}

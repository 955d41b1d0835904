use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::time::Instant;

use nodeward::exec::{ExitInfo, LaunchSpec, ManagedProcess, ProcessBackend};
use nodeward::types::StopMode;

/// How a fake process behaves once spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Exit on its own with `code` after `after`; exits early on SIGTERM.
    ExitAfter { after: Duration, code: i32 },
    /// Run until SIGTERM.
    ExitOnTerm,
    /// Only SIGKILL ends it.
    IgnoreTerm,
}

/// Everything the fake backend observed, for assertions.
#[derive(Debug, Default)]
pub struct Recorded {
    pub spawns: Vec<LaunchSpec>,
    /// Signals in delivery order, stamped with Tokio's clock so paused-time
    /// tests can measure escalation delays.
    pub signals: Vec<(StopMode, Instant)>,
}

/// A process backend that never touches the OS process table.
///
/// - records every spawn and signal
/// - optionally writes `log_lines` into the service log on spawn
/// - fails every spawn when built with [`FakeProcessBackend::failing`]
#[derive(Debug, Clone)]
pub struct FakeProcessBackend {
    script: Script,
    log_lines: Vec<String>,
    fail_spawn: bool,
    recorded: Arc<Mutex<Recorded>>,
}

impl FakeProcessBackend {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            log_lines: Vec::new(),
            fail_spawn: false,
            recorded: Arc::new(Mutex::new(Recorded::default())),
        }
    }

    pub fn failing() -> Self {
        let mut backend = Self::new(Script::ExitOnTerm);
        backend.fail_spawn = true;
        backend
    }

    pub fn with_log_lines(mut self, lines: &[&str]) -> Self {
        self.log_lines = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn spawn_count(&self) -> usize {
        self.recorded.lock().unwrap().spawns.len()
    }

    pub fn spawns(&self) -> Vec<LaunchSpec> {
        self.recorded.lock().unwrap().spawns.clone()
    }

    pub fn signals(&self) -> Vec<(StopMode, Instant)> {
        self.recorded.lock().unwrap().signals.clone()
    }

    fn write_log(&self, spec: &LaunchSpec) -> Result<()> {
        if self.log_lines.is_empty() {
            return Ok(());
        }
        let mut body = self.log_lines.join("\n");
        body.push('\n');
        std::fs::write(&spec.log_path, body)?;
        Ok(())
    }
}

#[async_trait]
impl ProcessBackend for FakeProcessBackend {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ManagedProcess>> {
        self.recorded.lock().unwrap().spawns.push(spec.clone());
        if self.fail_spawn {
            bail!("fake spawn failure for '{}'", spec.task_id);
        }
        self.write_log(spec)?;
        Ok(Box::new(FakeProcess {
            script: self.script,
            started: Instant::now(),
            termed: false,
            killed: false,
            recorded: Arc::clone(&self.recorded),
        }))
    }
}

#[derive(Debug)]
struct FakeProcess {
    script: Script,
    started: Instant,
    termed: bool,
    killed: bool,
    recorded: Arc<Mutex<Recorded>>,
}

impl ManagedProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn signal(&mut self, mode: StopMode) -> Result<()> {
        self.recorded
            .lock()
            .unwrap()
            .signals
            .push((mode, Instant::now()));
        match mode {
            StopMode::Graceful => self.termed = true,
            StopMode::Forced => self.killed = true,
        }
        Ok(())
    }

    fn try_wait(&mut self) -> Result<Option<ExitInfo>> {
        let by_signal = |sig| ExitInfo {
            code: None,
            signal: Some(sig),
        };
        if self.killed {
            return Ok(Some(by_signal(9)));
        }
        let exit = match self.script {
            Script::ExitAfter { after, code } => {
                if Instant::now() >= self.started + after {
                    Some(ExitInfo {
                        code: Some(code),
                        signal: None,
                    })
                } else if self.termed {
                    Some(by_signal(15))
                } else {
                    None
                }
            }
            Script::ExitOnTerm => self.termed.then(|| by_signal(15)),
            Script::IgnoreTerm => None,
        };
        Ok(exit)
    }
}

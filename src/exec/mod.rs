// src/exec/mod.rs

//! Task execution: process backend, per-task state machine and runner,
//! the supervisor and the executor daemon.

pub mod backend;
pub mod daemon;
pub mod idle;
pub mod liveness;
pub mod report;
pub mod state;
pub mod supervisor;
pub mod task_runner;

pub use backend::{ExitInfo, LaunchSpec, ManagedProcess, ProcessBackend, RealProcessBackend};
pub use daemon::ExecutorDaemon;
pub use report::{HttpStatusReporter, LoggingStatusReporter, StatusReporter, StatusUpdate};
pub use state::{TaskState, TaskStateMachine};
pub use supervisor::{SupervisorDeps, TaskHandle, TaskSupervisor};

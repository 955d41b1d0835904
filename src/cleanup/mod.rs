// src/cleanup/mod.rs

pub mod live_tasks;
pub mod reaper;

pub use live_tasks::{HttpLiveTaskSource, LiveTaskSource, UnconfiguredLiveTasks};
pub use reaper::{CleanupReaper, Disposition, RecordOutcome, SweepReport};

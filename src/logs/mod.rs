// src/logs/mod.rs

//! Task log handling: rotation config, tail capture and log-watcher metadata.

pub mod metadata;
pub mod rotation;
pub mod tail;

pub use metadata::TailMetadata;
pub use rotation::{LogRotationPlanner, RotationCadence, RotationPolicy};
pub use tail::{capture_tail, write_tail};

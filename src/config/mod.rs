// src/config/mod.rs

//! Configuration: model, layered loading, validation and redaction.

pub mod loader;
pub mod model;
pub mod redact;
pub mod validate;

pub use loader::{load_and_validate, load_layered};
pub use model::ConfigFile;
pub use validate::{validate_config, ConfigViolation};

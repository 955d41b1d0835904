// src/artifacts/mod.rs

//! Bootstrap artifacts: object store access, materialization and the
//! node-local coalescing download service.

pub mod download_service;
pub mod object_store;
pub mod store;

pub use download_service::{DownloadCoordinator, DownloadServiceClient};
pub use object_store::{FsObjectStore, HttpObjectStore, ObjectStore};
pub use store::ArtifactStore;

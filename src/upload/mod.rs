// src/upload/mod.rs

//! Finished-task log upload: file selection, key derivation, the uploader
//! itself and the metadata-driven uploader daemon.

pub mod key;
pub mod patterns;
pub mod uploader;
pub mod watcher;

pub use key::{render_key, KeyContext};
pub use patterns::UploadProfile;
pub use uploader::{ArtifactUploader, FileUploadResult, UploadReport, UploadRequest};
pub use watcher::MetadataUploader;

//! Storage relay - hands finished artifacts to the storage backend
//!
//! The relay only reads the local file; deleting it afterwards is the
//! orchestrator's job.

mod credentials;
mod drive;

pub use credentials::*;
pub use drive::*;

use crate::error::UploadError;
use async_trait::async_trait;
use linkrelay_types::StoredObject;
use std::path::Path;

#[async_trait]
pub trait StorageRelay: Send + Sync {
    /// Whether a usable storage session exists right now
    async fn is_authenticated(&self) -> bool;

    /// Upload `local_path` as `artifact_name` and make it readable by link
    async fn upload(&self, local_path: &Path, artifact_name: &str)
        -> Result<StoredObject, UploadError>;
}

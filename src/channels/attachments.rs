//! Attachment store — resolves attachment references to file bytes.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::channels::Attachment;
use crate::error::AttachmentError;

/// Source of attachment files (presentation, brochures, ...).
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Fetch an attachment by reference. `Ok(None)` when it does not exist.
    async fn fetch(&self, reference: &str) -> Result<Option<Attachment>, AttachmentError>;
}

/// Attachments stored as files under a root directory.
pub struct FsAttachmentStore {
    root: PathBuf,
}

impl FsAttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a reference to a path under the root.
    ///
    /// References are relative paths; absolute paths and `..` are rejected.
    fn resolve(&self, reference: &str) -> Result<PathBuf, AttachmentError> {
        let rel = Path::new(reference.trim());
        if reference.trim().is_empty()
            || !rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(AttachmentError::InvalidReference(reference.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl AttachmentStore for FsAttachmentStore {
    async fn fetch(&self, reference: &str) -> Result<Option<Attachment>, AttachmentError> {
        let path = self.resolve(reference)?;
        match tokio::fs::read(&path).await {
            Ok(data) => {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| reference.to_string());
                debug!(path = %path.display(), bytes = data.len(), "Attachment loaded");
                Ok(Some(Attachment::new(file_name, data)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AttachmentError::Io(e)),
        }
    }
}

/// In-memory attachment store.
#[derive(Default)]
pub struct MemoryAttachmentStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, reference: impl Into<String>, data: Vec<u8>) {
        self.files.write().await.insert(reference.into(), data);
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn fetch(&self, reference: &str) -> Result<Option<Attachment>, AttachmentError> {
        let files = self.files.read().await;
        Ok(files.get(reference).map(|data| {
            let file_name = reference.rsplit('/').next().unwrap_or(reference);
            Attachment::new(file_name, data.clone())
        }))
    }
}

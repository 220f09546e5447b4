//! Artifact byte storage.
//!
//! Physical files are addressed by `share://<relative path>` URIs, which
//! the file service of a mu-semtech stack resolves against its shared
//! volume. [`FsBlobStore`] reads and writes that volume directly;
//! [`InMemoryBlobStore`] keeps bytes in a map for tests.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

pub const SHARE_SCHEME: &str = "share://";

/// Where a freshly written blob ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLocation {
    pub id: String,
    /// `share://` URI of the blob.
    pub uri: String,
    pub file_name: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under a fresh identifier and return its location.
    async fn write(&self, data: &[u8], extension: &str) -> Result<BlobLocation>;

    async fn read(&self, uri: &str) -> Result<Vec<u8>>;

    /// Remove a blob. Removing a blob that does not exist is not an error.
    async fn delete(&self, uri: &str) -> Result<()>;
}

/// The relative path of a `share://` URI, refusing anything that could
/// escape the share root.
pub fn share_relative_path(uri: &str) -> Result<PathBuf> {
    let Some(rel) = uri.strip_prefix(SHARE_SCHEME) else {
        bail!("not a share:// URI: '{}'", uri);
    };
    let path = PathBuf::from(rel);
    if rel.is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_))) {
        bail!("share:// URI has an unsafe path: '{}'", uri);
    }
    Ok(path)
}

fn new_file_name(extension: &str) -> (String, String) {
    let id = Uuid::new_v4().to_string();
    let extension = extension.trim_start_matches('.');
    let file_name = format!("{}.{}", id, extension);
    (id, file_name)
}

/// Blob store on the shared volume.
pub struct FsBlobStore {
    share_root: PathBuf,
    subpath: String,
}

impl FsBlobStore {
    pub fn new(share_root: impl Into<PathBuf>, subpath: &str) -> Self {
        Self {
            share_root: share_root.into(),
            subpath: subpath.trim_matches('/').to_string(),
        }
    }

    pub fn path_for(&self, uri: &str) -> Result<PathBuf> {
        Ok(self.share_root.join(share_relative_path(uri)?))
    }

    fn relative_for(&self, file_name: &str) -> String {
        if self.subpath.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", self.subpath, file_name)
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn write(&self, data: &[u8], extension: &str) -> Result<BlobLocation> {
        let (id, file_name) = new_file_name(extension);
        let uri = format!("{}{}", SHARE_SCHEME, self.relative_for(&file_name));
        let path = self.path_for(&uri)?;

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        tracing::debug!(%uri, bytes = data.len(), "wrote blob");
        Ok(BlobLocation { id, uri, file_name })
    }

    async fn read(&self, uri: &str) -> Result<Vec<u8>> {
        let path = self.path_for(uri)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {} ({})", uri, path.display()))
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        let path = self.path_for(uri)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(%uri, "deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(%uri, "blob to delete was already gone");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}

/// In-memory blob store for tests.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blob without counting it as a write.
    pub fn insert(&self, uri: &str, data: Vec<u8>) {
        self.blobs.write().unwrap().insert(uri.to_string(), data);
    }

    pub fn get(&self, uri: &str) -> Option<Vec<u8>> {
        self.blobs.read().unwrap().get(uri).cloned()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.blobs.read().unwrap().contains_key(uri)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn write(&self, data: &[u8], extension: &str) -> Result<BlobLocation> {
        let (id, file_name) = new_file_name(extension);
        let uri = format!("{}{}", SHARE_SCHEME, file_name);
        self.blobs.write().unwrap().insert(uri.clone(), data.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(BlobLocation { id, uri, file_name })
    }

    async fn read(&self, uri: &str) -> Result<Vec<u8>> {
        self.get(uri)
            .with_context(|| format!("no blob stored at {}", uri))
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        self.blobs.write().unwrap().remove(uri);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid storage path {0:?}")]
    InvalidPath(String),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Fully qualified location reported to status queries and events.
    pub location: String,
    pub path: String,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Object storage collaborator. Writes are all-or-nothing: after a failed
/// `put` nothing is visible at `path`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredObject, StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn validate_relative(path: &str) -> Result<PathBuf, StorageError> {
    let candidate = Path::new(path);
    let ok = !path.trim().is_empty()
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(candidate.to_path_buf())
    } else {
        Err(StorageError::InvalidPath(path.to_string()))
    }
}

/// Filesystem-backed store rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(validate_relative(path)?))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    /// Write through a temp file in the target directory, then rename into place.
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        let absolute_path = self.absolute_path(path)?;
        let parent = absolute_path
            .parent()
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?
            .to_path_buf();

        fs::create_dir_all(&parent)
            .await
            .map_err(|source| StorageError::Io {
                action: "creating directory",
                path: parent.clone(),
                source,
            })?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        if let Err(err) = write_temp(&temp_path, bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(source) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io {
                action: "renaming into",
                path: absolute_path,
                source,
            });
        }

        let content_hash = sha256_hex(bytes);
        debug!(path, content_type, bytes = bytes.len(), %content_hash, "object stored");
        Ok(StoredObject {
            location: format!("file://{}", absolute_path.display()),
            path: path.to_string(),
            content_hash,
            byte_size: bytes.len(),
        })
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let absolute_path = self.absolute_path(path)?;
        fs::try_exists(&absolute_path)
            .await
            .map_err(|source| StorageError::Io {
                action: "checking",
                path: absolute_path,
                source,
            })
    }
}

async fn write_temp(temp_path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let io_err = |action: &'static str| {
        let path = temp_path.to_path_buf();
        move |source| StorageError::Io {
            action,
            path,
            source,
        }
    };

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .map_err(io_err("opening temp file"))?;
    file.write_all(bytes)
        .await
        .map_err(io_err("writing temp file"))?;
    file.flush().await.map_err(io_err("flushing temp file"))?;
    file.sync_all().await.map_err(io_err("syncing temp file"))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// In-process store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, MemoryObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<MemoryObject> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(path).cloned())
    }

    pub fn paths(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        validate_relative(path)?;
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".into()))?;
        objects.insert(
            path.to_string(),
            MemoryObject {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(StoredObject {
            location: format!("memory://{path}"),
            path: path.to_string(),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".into()))?;
        Ok(objects.contains_key(path))
    }
}

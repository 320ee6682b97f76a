//! Persistent key-value storage for repository metadata.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::fs;

/// I/O failure in a metadata store.
#[derive(Error, Debug)]
#[error("Metadata store error for '{key}': {source}")]
pub struct StoreError {
    /// Key being read or written.
    pub key: String,
    /// Underlying error.
    #[source]
    pub source: std::io::Error,
}

/// Byte storage keyed by `/`-separated paths (`versions/org.example/lib`).
#[async_trait]
pub trait MetadataStore: Send + Sync + std::fmt::Debug {
    /// Read a value; `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a value, replacing any previous one.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

/// One JSON file per key under a root directory. Writes are atomic.
#[derive(Debug, Clone)]
pub struct FsMetadataStore {
    root: PathBuf,
}

impl FsMetadataStore {
    /// Store rooted at `root` (created lazily).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.root.clone();
        let segments: Vec<&str> = key.split('/').collect();
        for (i, segment) in segments.iter().enumerate() {
            if segment.is_empty()
                || *segment == "."
                || *segment == ".."
                || segment.contains('\\')
            {
                return Err(StoreError {
                    key: key.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "invalid key segment",
                    ),
                });
            }
            if i + 1 == segments.len() {
                path.push(format!("{segment}.json"));
            } else {
                path.push(segment);
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl MetadataStore for FsMetadataStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let err = |source: std::io::Error| StoreError {
            key: key.to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(err)?;
        }

        // Atomic write: write to temp file, then rename
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path =
            path.with_file_name(format!(".{file_name}.{:016x}.tmp", rand::random::<u64>()));
        fs::write(&temp_path, value).await.map_err(err)?;
        if let Err(e) = fs::rename(&temp_path, &path).await {
            fs::remove_file(&temp_path).await.ok();
            return Err(err(e));
        }
        Ok(())
    }
}

/// Volatile store for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryMetadataStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

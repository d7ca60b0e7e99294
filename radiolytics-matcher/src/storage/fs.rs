//! Filesystem-backed collaborators
//!
//! Object names map onto paths below a root directory (`a/b.json` →
//! `<root>/a/b.json`). Writes go through a temporary file and a rename so a
//! concurrent reader never sees a half-written record.

use super::{ObjectHandle, ResultRecord, ResultSink, WorkQueue};
use crate::error::StorageError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

const TMP_SUFFIX: &str = ".tmp";

/// Work queue rooted at a local directory
#[derive(Debug, Clone)]
pub struct FsWorkQueue {
    root: PathBuf,
}

impl FsWorkQueue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an object name, refusing anything that would leave the root
    fn path_for(&self, handle: &ObjectHandle) -> Result<PathBuf, StorageError> {
        let relative = Path::new(handle.as_str());
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if handle.as_str().is_empty() || escapes {
            return Err(StorageError::NotFound(format!("invalid object name '{}'", handle)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl WorkQueue for FsWorkQueue {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectHandle>, StorageError> {
        let root = self.root.clone();
        let filter = prefix.to_string();

        let names = tokio::task::spawn_blocking(move || -> Result<Vec<ObjectHandle>, StorageError> {
            if !root.exists() {
                return Ok(Vec::new());
            }

            let mut names = Vec::new();
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("Error walking {}: {}", root.display(), e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if name.ends_with(TMP_SUFFIX) || !name.starts_with(&filter) {
                    continue;
                }
                names.push(ObjectHandle::new(name));
            }
            names.sort();
            Ok(names)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("listing task failed: {}", e)))??;

        debug!("Listed {} object(s) under '{}'", names.len(), prefix);
        Ok(names)
    }

    async fn get(&self, handle: &ObjectHandle) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(handle)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(handle.to_string())),
            Err(e) => Err(StorageError::io(path.display().to_string(), e)),
        }
    }

    async fn put(&self, handle: &ObjectHandle, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(handle)?;
        write_atomic(&path, bytes).await
    }

    async fn delete(&self, handle: &ObjectHandle) -> Result<(), StorageError> {
        let path = self.path_for(handle)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(path.display().to_string(), e)),
        }
    }

    async fn mark_public(&self, handle: &ObjectHandle) -> Result<Option<String>, StorageError> {
        let path = self.path_for(handle)?;
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(StorageError::NotFound(handle.to_string()));
        }
        Ok(Some(format!("file://{}", path.display())))
    }
}

/// Result sink writing one JSON file per key
#[derive(Debug, Clone)]
pub struct FsResultSink {
    dir: PathBuf,
}

impl FsResultSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }

    /// Read back a stored result, if present
    pub async fn get(&self, key: &str) -> Result<Option<ResultRecord>, StorageError> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(path.display().to_string(), e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Encode(format!("{}: {}", path.display(), e)))
    }
}

#[async_trait]
impl ResultSink for FsResultSink {
    async fn set(&self, key: &str, record: &ResultRecord) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(record).map_err(|e| StorageError::Encode(e.to_string()))?;
        write_atomic(&self.path_for(key), &bytes).await
    }
}

/// Keys become file names: anything outside `[A-Za-z0-9._-]` turns into `_`
fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(parent.display().to_string(), e))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| StorageError::io(tmp.display().to_string(), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StorageError::io(path.display().to_string(), e))
}

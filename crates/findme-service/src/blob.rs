//! Blob storage for original photos, reference images and watermark renders.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("invalid blob path: {0:?}")]
    InvalidPath(String),
    #[error("blob io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("blob store lock poisoned")]
    LockPoisoned,
}

pub trait BlobStore: Send + Sync {
    fn put(&self, bytes: &[u8], path: &str) -> Result<(), BlobError>;

    /// URL a client can fetch the blob from.
    fn readable_url(&self, path: &str) -> Result<String, BlobError>;
}

/// Blob paths are relative, slash-separated and may not escape the root.
fn validate_path(path: &str) -> Result<&Path, BlobError> {
    let p = Path::new(path);
    let valid = !path.is_empty() && p.components().all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(p)
    } else {
        Err(BlobError::InvalidPath(path.to_string()))
    }
}

/// Blob store on the local filesystem.
pub struct FsBlobStore {
    root: PathBuf,
    base_url: Option<String>,
}

impl FsBlobStore {
    /// `base_url`, when set, is the public prefix the root is served under.
    /// Without it URLs are `file://` paths.
    pub fn new(root: impl Into<PathBuf>, base_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, bytes: &[u8], path: &str) -> Result<(), BlobError> {
        let target = self.root.join(validate_path(path)?);
        let io_err = |source| BlobError::Io {
            path: target.clone(),
            source,
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(&target, bytes).map_err(io_err)?;
        tracing::debug!(path, bytes = bytes.len(), "stored blob");
        Ok(())
    }

    fn readable_url(&self, path: &str) -> Result<String, BlobError> {
        let relative = validate_path(path)?;
        Ok(match &self.base_url {
            Some(base) => format!("{base}/{path}"),
            None => {
                let full = self.root.join(relative);
                let absolute = if full.is_absolute() {
                    full
                } else {
                    std::env::current_dir()
                        .map_err(|source| BlobError::Io {
                            path: full.clone(),
                            source,
                        })?
                        .join(full)
                };
                format!("file://{}", absolute.display())
            }
        })
    }
}

/// Blob store held in memory.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Vec<u8>>> {
        // Each insert is a single map operation, so a poisoned map is still whole.
        self.blobs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.read().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, bytes: &[u8], path: &str) -> Result<(), BlobError> {
        validate_path(path)?;
        self.blobs
            .write()
            .map_err(|_| BlobError::LockPoisoned)?
            .insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn readable_url(&self, path: &str) -> Result<String, BlobError> {
        validate_path(path)?;
        Ok(format!("mem://{path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(validate_path("photos/sell/a.jpg").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("photos/../../etc").is_err());
        assert!(validate_path("./photos/a.jpg").is_err());
    }

    #[test]
    fn test_fs_put_and_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), Some("https://cdn.example.com/media/".into()));

        store.put(b"jpeg bytes", "photos/crops/p1/0.jpg").unwrap();
        assert_eq!(
            fs::read(dir.path().join("photos/crops/p1/0.jpg")).unwrap(),
            b"jpeg bytes"
        );
        assert_eq!(
            store.readable_url("photos/crops/p1/0.jpg").unwrap(),
            "https://cdn.example.com/media/photos/crops/p1/0.jpg"
        );
        assert!(matches!(store.put(b"x", "../escape"), Err(BlobError::InvalidPath(_))));
    }

    #[test]
    fn test_fs_file_url_without_base() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), None);
        let url = store.readable_url("faces/a.png").unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("faces/a.png"));
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryBlobStore::new();
        assert!(store.is_empty());
        store.put(b"abc", "faces/x.png").unwrap();
        assert_eq!(store.get("faces/x.png").unwrap(), b"abc");
        assert_eq!(store.readable_url("faces/x.png").unwrap(), "mem://faces/x.png");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_in_memory_store_readable_after_poison() {
        let store = InMemoryBlobStore::new();
        store.put(b"abc", "faces/x.png").unwrap();
        std::thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = store.blobs.write().unwrap();
                    panic!("poison the blob map");
                })
                .join();
        });

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("faces/x.png").unwrap(), b"abc");
    }
}

//! File storage abstraction

use async_trait::async_trait;
use mailcatch_common::config::LocalStorageConfig;
use mailcatch_common::{Error, Result};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::compress::{gzip, should_compress, GZIP};

/// Storage sink.
///
/// Implementations are shared by every session and must tolerate
/// concurrent calls.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Short backend name for logs
    fn backend(&self) -> &'static str;

    /// Store `data` under `path` and return the location written
    async fn store(
        &self,
        path: &str,
        data: &[u8],
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> Result<String>;

    /// Read a stored object
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Check if an object exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Whether messages and JSON documents are gzipped before upload
    fn compresses(&self) -> bool {
        false
    }

    /// Store a document, gzipping it when the sink compresses and the
    /// path or content type calls for it
    async fn store_document(&self, path: &str, data: &[u8], content_type: &str) -> Result<String> {
        if self.compresses() && should_compress(path, content_type) {
            let packed = gzip(data)?;
            self.store(path, &packed, content_type, Some(GZIP)).await
        } else {
            self.store(path, data, content_type, None).await
        }
    }
}

/// Local filesystem storage
#[derive(Debug)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new local storage instance from config
    pub fn new(config: &LocalStorageConfig) -> Result<Self> {
        Self::from_path(&config.directory)
    }

    /// Create a new local storage instance rooted at `path`
    pub fn from_path(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| Error::Storage(format!("Failed to create storage directory: {}", e)))?;

        info!(path = %path.display(), "Initialized local file storage");

        Ok(Self {
            base_path: path.to_path_buf(),
        })
    }

    /// Resolve a relative key below the base directory
    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if path.is_empty() || path.starts_with('\\') {
            return Err(Error::Storage(format!("Invalid storage path: {:?}", path)));
        }

        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => {
                    return Err(Error::Storage(
                        "Path traversal detected: '..' is not allowed".to_string(),
                    ))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(Error::Storage(
                        "Absolute paths are not allowed".to_string(),
                    ))
                }
            }
        }

        Ok(self.base_path.join(relative))
    }
}

#[async_trait]
impl FileStorage for LocalStorage {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn store(
        &self,
        path: &str,
        data: &[u8],
        _content_type: &str,
        _content_encoding: Option<&str>,
    ) -> Result<String> {
        let full_path = self.full_path(path)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        }

        fs::write(&full_path, data)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write file: {}", e)))?;

        debug!(path = %path, size = data.len(), "Stored file");

        Ok(full_path.display().to_string())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;
        let data = fs::read(&full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read file: {}", e)))?;

        debug!(path = %path, size = data.len(), "Read file");
        Ok(data)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path)?;
        fs::try_exists(&full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to stat file: {}", e)))
    }
}

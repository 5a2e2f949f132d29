/// Object storage adapters
///
/// Two interchangeable backends behind one contract: blobs are opaque bytes
/// addressed by slash-delimited logical paths. The adapters are
/// content-agnostic and create nothing beyond what the backend requires.
pub mod s3;
pub mod webdav;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::StorageError;

pub use s3::S3Storage;
pub use webdav::WebdavStorage;

#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn download(&self, path: &str) -> Result<Bytes, StorageError>;
    async fn upload(&self, path: &str, data: Bytes) -> Result<(), StorageError>;
}

/// Build the storage adapter selected by configuration.
pub async fn from_config(config: &StorageConfig) -> Result<Arc<dyn BlobStorage>, StorageError> {
    match config.backend {
        StorageBackend::Webdav => {
            let webdav = config.webdav.as_ref().ok_or_else(|| {
                StorageError::Transport("webdav backend selected but not configured".to_string())
            })?;
            Ok(Arc::new(WebdavStorage::new(webdav)?))
        }
        StorageBackend::S3 => {
            let s3 = config.s3.as_ref().ok_or_else(|| {
                StorageError::Transport("s3 backend selected but not configured".to_string())
            })?;
            Ok(Arc::new(S3Storage::connect(s3).await))
        }
    }
}

/// WebDAV-backed object storage
///
/// Issues plain GET/PUT requests with basic auth against `base/root/path`.
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client as HttpClient, StatusCode};

use super::BlobStorage;
use crate::config::WebdavConfig;
use crate::error::StorageError;

pub struct WebdavStorage {
    http: HttpClient,
    base_url: String,
    root: String,
    username: String,
    password: String,
}

impl WebdavStorage {
    pub fn new(config: &WebdavConfig) -> Result<Self, StorageError> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| StorageError::Transport(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            root: config.root.trim_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn object_url(&self, path: &str) -> String {
        join_url(&self.base_url, &self.root, path)
    }
}

fn join_url(base_url: &str, root: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if root.is_empty() {
        format!("{base_url}/{path}")
    } else {
        format!("{base_url}/{root}/{path}")
    }
}

fn map_status(status: StatusCode, path: &str) -> StorageError {
    match status.as_u16() {
        404 => StorageError::NotFound(path.to_string()),
        401 | 403 => StorageError::Auth(format!("{path}: http {status}")),
        507 => StorageError::QuotaExceeded(path.to_string()),
        _ => StorageError::Transport(format!("{path}: http {status}")),
    }
}

#[async_trait]
impl BlobStorage for WebdavStorage {
    /// Buffers the whole object in memory before handing it back; the
    /// underlying client tears its stream down on return.
    async fn download(&self, path: &str) -> Result<Bytes, StorageError> {
        let url = self.object_url(path);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| StorageError::Transport(format!("GET {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(map_status(response.status(), path));
        }

        response
            .bytes()
            .await
            .map_err(|e| StorageError::Transport(format!("GET {url}: {e}")))
    }

    async fn upload(&self, path: &str, data: Bytes) -> Result<(), StorageError> {
        let url = self.object_url(path);
        let response = self
            .http
            .put(&url)
            .basic_auth(&self.username, Some(&self.password))
            .body(data)
            .send()
            .await
            .map_err(|e| StorageError::Transport(format!("PUT {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(map_status(response.status(), path));
        }

        Ok(())
    }
}

/// S3-backed object storage
///
/// The first segment of a logical path addresses the store itself; the
/// remainder becomes the object key. Uploads prepend the configured key
/// prefix. A custom endpoint switches the client to path-style addressing
/// for S3-compatible stores.
use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;

use super::BlobStorage;
use crate::config::S3Config;
use crate::error::StorageError;

pub struct S3Storage {
    client: Client,
    bucket: String,
    key_prefix: String,
}

impl S3Storage {
    pub async fn connect(config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id.clone(),
                secret_access_key.clone(),
                None,
                None,
                "video_worker_s3",
            ));
        }

        let sdk_config = loader.load().await;

        let client = match &config.endpoint {
            Some(endpoint) => {
                let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
                    .endpoint_url(endpoint.clone())
                    .force_path_style(true)
                    .build();
                Client::from_conf(s3_config)
            }
            None => Client::new(&sdk_config),
        };

        tracing::info!(bucket = %config.bucket, "S3 storage client initialized");

        Self {
            client,
            bucket: config.bucket.clone(),
            key_prefix: config.key_prefix.clone(),
        }
    }
}

fn object_key(path: &str) -> &str {
    let path = path.trim_start_matches('/');
    match path.split_once('/') {
        Some((_, rest)) if !rest.is_empty() => rest,
        _ => path,
    }
}

fn prefixed_key(prefix: &str, path: &str) -> String {
    format!("{prefix}{}", object_key(path))
}

fn classify(error: String, path: &str) -> StorageError {
    if error.contains("NoSuchKey") || error.contains("NotFound") || error.contains("404") {
        StorageError::NotFound(path.to_string())
    } else if error.contains("AccessDenied")
        || error.contains("Forbidden")
        || error.contains("InvalidAccessKeyId")
        || error.contains("SignatureDoesNotMatch")
        || error.contains("403")
    {
        StorageError::Auth(error)
    } else if error.contains("QuotaExceeded") {
        StorageError::QuotaExceeded(error)
    } else {
        StorageError::Transport(error)
    }
}

#[async_trait]
impl BlobStorage for S3Storage {
    async fn download(&self, path: &str) -> Result<Bytes, StorageError> {
        let key = object_key(path);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(DisplayErrorContext(e).to_string(), path))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Transport(format!("read {key}: {e}")))?;

        Ok(body.into_bytes())
    }

    async fn upload(&self, path: &str, data: Bytes) -> Result<(), StorageError> {
        let key = prefixed_key(&self.key_prefix, path);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify(DisplayErrorContext(e).to_string(), path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_drops_the_leading_path_segment() {
        assert_eq!(object_key("src/a.mp4"), "a.mp4");
        assert_eq!(object_key("/src/nested/a.mp4"), "nested/a.mp4");
    }

    #[test]
    fn single_segment_paths_are_used_verbatim() {
        assert_eq!(object_key("a.mp4"), "a.mp4");
        assert_eq!(object_key("trailing/"), "trailing/");
    }

    #[test]
    fn uploads_prepend_the_configured_prefix() {
        assert_eq!(prefixed_key("processed/", "abc.mp4"), "processed/abc.mp4");
        assert_eq!(prefixed_key("", "abc.mp4"), "abc.mp4");
    }

    #[test]
    fn classifies_sdk_errors_by_message() {
        assert!(matches!(
            classify("NoSuchKey: the key does not exist".into(), "a"),
            StorageError::NotFound(_)
        ));
        assert!(matches!(
            classify("AccessDenied".into(), "a"),
            StorageError::Auth(_)
        ));
        assert!(matches!(
            classify("connection reset".into(), "a"),
            StorageError::Transport(_)
        ));
    }
}

/// Error types for the video worker
///
/// Each adapter returns its own typed error; the processing use case only
/// classifies them by recovery action (reset row / retry / ack), never by
/// code value.
use std::time::Duration;
use thiserror::Error;

/// Result type for worker operations
pub type Result<T, E = WorkerError> = std::result::Result<T, E>;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(String),

    #[error("environment variable {0} has an invalid value: `{1}`")]
    Invalid(String, String),
}

/// Message queue adapter errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker connectivity or protocol failure
    #[error("queue transport error: {0}")]
    Transport(String),

    /// Payload could not be decoded into a task
    #[error("malformed task payload: {0}")]
    Malformed(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Transport(err.to_string())
    }
}

/// Object storage adapter errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage authentication failed: {0}")]
    Auth(String),

    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("storage transport error: {0}")]
    Transport(String),
}

/// Transcoding engine errors
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("transcoder i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transcoder exited with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },
}

/// Video repository errors
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("video {0} not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        RepoError::Database(err.to_string())
    }
}

/// Umbrella error for one processing iteration
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error(transparent)]
    Repository(#[from] RepoError),

    #[error("task processing timed out after {0:?}")]
    Timeout(Duration),
}

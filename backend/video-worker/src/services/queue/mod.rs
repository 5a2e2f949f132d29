/// Message queue adapters
///
/// Two interchangeable backends behind one contract. Each worker owns its
/// own adapter instance so broker receive state is never shared.
///
/// Per-message state machine (adapter-private): a fetched message is
/// in-flight until it is acked (removed), failed below the delivery limit
/// (re-enqueued with attempt+1) or failed at the limit (dead-lettered).
/// Undecodable payloads are deleted outright; they cannot be redriven.
pub mod redis_stream;
pub mod sqs;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{QueueBackend, QueueConfig};
use crate::error::QueueError;
use crate::metrics::WorkerMetrics;
use crate::models::TaskMessage;

pub use redis_stream::RedisStreamQueue;
pub use sqs::SqsQueue;

/// What `fail` did with the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// A copy with attempt+1 is back on the queue
    Requeued { attempt: u32 },
    /// Delivery limit reached; the message was discarded
    DeadLettered,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Pull the next message, blocking up to the adapter's bound.
    /// `Ok(None)` means an empty poll. Records current queue depth.
    async fn fetch(&mut self) -> Result<Option<TaskMessage>, QueueError>;

    /// Permanently remove the message. Idempotent on duplicate delivery.
    async fn ack(&mut self, message: &TaskMessage) -> Result<(), QueueError>;

    /// Re-enqueue a copy with attempt+1 and an `error` field, or dead-letter
    /// when the delivery limit is reached. The original is removed either
    /// way.
    async fn fail(
        &mut self,
        message: &TaskMessage,
        reason: &str,
    ) -> Result<FailureOutcome, QueueError>;
}

/// Build a queue adapter for one worker.
pub async fn from_config(
    config: &QueueConfig,
    worker_id: &str,
    metrics: Arc<WorkerMetrics>,
) -> Result<Box<dyn TaskQueue>, QueueError> {
    match config.backend {
        QueueBackend::RedisStream => {
            let redis = config.redis.as_ref().ok_or_else(|| {
                QueueError::Transport("redis backend selected but not configured".to_string())
            })?;
            Ok(Box::new(
                RedisStreamQueue::connect(redis, config.max_deliveries, worker_id, metrics).await?,
            ))
        }
        QueueBackend::Sqs => {
            let sqs = config.sqs.as_ref().ok_or_else(|| {
                QueueError::Transport("sqs backend selected but not configured".to_string())
            })?;
            Ok(Box::new(
                SqsQueue::connect(sqs, config.max_deliveries, worker_id, metrics).await?,
            ))
        }
    }
}

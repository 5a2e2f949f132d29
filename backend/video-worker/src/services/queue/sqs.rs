/// Visibility-timeout queue on SQS
///
/// Fetch long-polls for a single message. The broker's receive count seeds
/// the attempt counter (receive count − 1); an explicit `attempt` payload
/// field wins over it. Retries send a fresh JSON copy and delete the
/// original; an unacked message simply reappears after the visibility
/// window.
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_sqs::config::Region;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use serde_json::Value;
use tracing::{debug, error, info};

use super::{FailureOutcome, TaskQueue};
use crate::config::SqsQueueConfig;
use crate::error::QueueError;
use crate::metrics::WorkerMetrics;
use crate::models::{Task, TaskMessage};

pub struct SqsQueue {
    client: Client,
    queue_url: String,
    wait_time_seconds: i32,
    max_deliveries: u32,
    metrics: Arc<WorkerMetrics>,
    worker_id: String,
}

impl SqsQueue {
    pub async fn connect(
        config: &SqsQueueConfig,
        max_deliveries: u32,
        worker_id: &str,
        metrics: Arc<WorkerMetrics>,
    ) -> Result<Self, QueueError> {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let queue = Self {
            client: Client::new(&sdk_config),
            queue_url: config.queue_url.clone(),
            wait_time_seconds: config.wait_time.as_secs() as i32,
            max_deliveries,
            metrics,
            worker_id: worker_id.to_string(),
        };

        // Reachability probe; a broken queue URL fails bootstrap here.
        let depth = queue.depth().await?;
        queue.metrics.set_queue_depth(&queue.worker_id, depth);

        info!(queue_url = %config.queue_url, "sqs queue initialized");
        Ok(queue)
    }

    async fn depth(&self) -> Result<i64, QueueError> {
        let response = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| QueueError::Transport(DisplayErrorContext(e).to_string()))?;

        Ok(response
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0))
    }

    async fn record_depth(&self) {
        match self.depth().await {
            Ok(depth) => self.metrics.set_queue_depth(&self.worker_id, depth),
            Err(err) => debug!(error = %err, "failed to read queue depth"),
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Transport(DisplayErrorContext(e).to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for SqsQueue {
    async fn fetch(&mut self) -> Result<Option<TaskMessage>, QueueError> {
        self.record_depth().await;

        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(self.wait_time_seconds)
            .attribute_names(QueueAttributeName::All)
            .send()
            .await
            .map_err(|e| QueueError::Transport(DisplayErrorContext(e).to_string()))?;

        let Some(message) = response.messages().first().cloned() else {
            return Ok(None);
        };

        let Some(receipt_handle) = message.receipt_handle().map(str::to_string) else {
            return Ok(None);
        };

        let body = message.body().unwrap_or_default();
        let mut payload = match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(map)) => map,
            _ => {
                error!(receipt_handle = %receipt_handle, "dropping undecodable queue message");
                self.delete(&receipt_handle).await?;
                return Ok(None);
            }
        };

        let receive_count = message
            .attributes()
            .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|count| count.parse::<u32>().ok())
            .unwrap_or(1);
        if !payload.contains_key("attempt") {
            payload.insert(
                "attempt".to_string(),
                Value::from(receive_count.saturating_sub(1)),
            );
        }

        match Task::from_raw(&payload) {
            Ok(task) => Ok(Some(TaskMessage {
                broker_id: receipt_handle,
                task,
                raw: payload,
            })),
            Err(reason) => {
                error!(receipt_handle = %receipt_handle, reason = %reason, "dropping undecodable queue message");
                self.delete(&receipt_handle).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&mut self, message: &TaskMessage) -> Result<(), QueueError> {
        self.delete(&message.broker_id).await
    }

    async fn fail(
        &mut self,
        message: &TaskMessage,
        reason: &str,
    ) -> Result<FailureOutcome, QueueError> {
        let next_attempt = message.task.attempt + 1;

        if next_attempt >= self.max_deliveries {
            self.delete(&message.broker_id).await?;
            return Ok(FailureOutcome::DeadLettered);
        }

        let payload = message.retry_payload(reason);
        let body = serde_json::to_string(&payload)
            .map_err(|e| QueueError::Transport(format!("failed to encode retry payload: {e}")))?;

        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| QueueError::Transport(DisplayErrorContext(e).to_string()))?;

        self.delete(&message.broker_id).await?;

        Ok(FailureOutcome::Requeued {
            attempt: next_attempt,
        })
    }
}

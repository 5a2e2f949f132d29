/// Consumer-group stream queue on Redis
///
/// Tasks are entries on a single stream, consumed through a shared group so
/// each entry is delivered to exactly one worker at a time. Retries append a
/// fresh entry; the failed one is acknowledged and deleted.
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{FromRedisValue, Value as RedisValue};
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use super::{FailureOutcome, TaskQueue};
use crate::config::RedisQueueConfig;
use crate::error::QueueError;
use crate::metrics::WorkerMetrics;
use crate::models::{flatten, Task, TaskMessage};

pub struct RedisStreamQueue {
    conn: MultiplexedConnection,
    stream: String,
    group: String,
    consumer: String,
    block_ms: u64,
    max_deliveries: u32,
    metrics: Arc<WorkerMetrics>,
    worker_id: String,
}

impl RedisStreamQueue {
    /// Connect and make sure the consumer group exists. Group creation is
    /// idempotent across restarts.
    pub async fn connect(
        config: &RedisQueueConfig,
        max_deliveries: u32,
        worker_id: &str,
        metrics: Arc<WorkerMetrics>,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&config.stream)
            .arg(&config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        if let Err(err) = created {
            if !err.to_string().contains("BUSYGROUP") {
                return Err(err.into());
            }
        }

        info!(
            stream = %config.stream,
            group = %config.group,
            consumer = %worker_id,
            "stream queue initialized"
        );

        Ok(Self {
            conn,
            stream: config.stream.clone(),
            group: config.group.clone(),
            consumer: worker_id.to_string(),
            block_ms: config.block.as_millis() as u64,
            max_deliveries,
            metrics,
            worker_id: worker_id.to_string(),
        })
    }

    async fn record_depth(&mut self) {
        match redis::cmd("XLEN")
            .arg(&self.stream)
            .query_async::<_, i64>(&mut self.conn)
            .await
        {
            Ok(depth) => self.metrics.set_queue_depth(&self.worker_id, depth),
            Err(err) => debug!(error = %err, "failed to read stream length"),
        }
    }

    /// Acknowledge the entry in the group and drop it from the stream. The
    /// delete is best-effort; an acked-but-undeleted entry is never
    /// redelivered.
    async fn remove(&mut self, entry_id: &str) -> Result<(), QueueError> {
        redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(entry_id)
            .query_async::<_, ()>(&mut self.conn)
            .await?;

        if let Err(err) = redis::cmd("XDEL")
            .arg(&self.stream)
            .arg(entry_id)
            .query_async::<_, ()>(&mut self.conn)
            .await
        {
            debug!(entry_id, error = %err, "stream delete after ack failed");
        }

        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisStreamQueue {
    async fn fetch(&mut self) -> Result<Option<TaskMessage>, QueueError> {
        self.record_depth().await;

        let raw: RedisValue = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(self.block_ms)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut self.conn)
            .await?;

        if raw == RedisValue::Nil {
            return Ok(None);
        }

        let parsed: Vec<(String, Vec<(String, Vec<(String, String)>)>)> =
            FromRedisValue::from_redis_value(&raw)?;

        let Some((entry_id, fields)) = parsed
            .into_iter()
            .flat_map(|(_, entries)| entries)
            .next()
        else {
            return Ok(None);
        };

        let mut payload = Map::new();
        for (key, value) in fields {
            payload.insert(key, Value::String(value));
        }

        match Task::from_raw(&payload) {
            Ok(task) => Ok(Some(TaskMessage {
                broker_id: entry_id,
                task,
                raw: payload,
            })),
            Err(reason) => {
                error!(entry_id = %entry_id, reason = %reason, "dropping undecodable stream entry");
                self.remove(&entry_id).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&mut self, message: &TaskMessage) -> Result<(), QueueError> {
        self.remove(&message.broker_id).await
    }

    async fn fail(
        &mut self,
        message: &TaskMessage,
        reason: &str,
    ) -> Result<FailureOutcome, QueueError> {
        let next_attempt = message.task.attempt + 1;

        if next_attempt >= self.max_deliveries {
            self.remove(&message.broker_id).await?;
            return Ok(FailureOutcome::DeadLettered);
        }

        self.remove(&message.broker_id).await?;

        let payload = message.retry_payload(reason);
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream).arg("*");
        for (key, value) in &payload {
            cmd.arg(key).arg(flatten(value));
        }
        cmd.query_async::<_, String>(&mut self.conn).await?;

        Ok(FailureOutcome::Requeued {
            attempt: next_attempt,
        })
    }
}

//! Core data models: the video row and the queue task envelope

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Video lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Uploaded,
    Processed,
    Deleted,
    Failed,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Uploaded => "uploaded",
            VideoStatus::Processed => "processed",
            VideoStatus::Deleted => "deleted",
            VideoStatus::Failed => "failed",
        }
    }
}

/// A row of the `videos` table
///
/// The worker never creates or deletes rows; it only moves a row between
/// `uploaded` and `processed` (and back to `uploaded` on failure).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Video {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub raw_video_id: Uuid,
    pub processed_video_id: Option<Uuid>,
    pub title: String,
    pub status: VideoStatus,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub original_url: String,
    pub processed_url: Option<String>,
    pub votes: i32,
}

/// One unit of work taken from the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub task_id: String,
    pub video_id: String,
    pub source_path: String,
    pub attempt: u32,
    /// Additional string-keyed payload fields, carried through retries
    pub metadata: HashMap<String, String>,
}

const RESERVED_FIELDS: [&str; 5] = ["task_id", "video_id", "source_path", "attempt", "error"];

impl Task {
    /// Decode a task from a flat payload mapping.
    ///
    /// `task_id`, `video_id` and `source_path` are required; `attempt`
    /// defaults to 0. Every other key is kept as opaque metadata.
    pub fn from_raw(raw: &Map<String, Value>) -> Result<Self, String> {
        let task_id = field(raw, "task_id").ok_or("missing task_id")?;
        let video_id = field(raw, "video_id").ok_or("missing video_id")?;
        let source_path = field(raw, "source_path").ok_or("missing source_path")?;

        let attempt = match raw.get("attempt") {
            None => 0,
            Some(Value::Number(number)) => number
                .as_u64()
                .ok_or("attempt must be a non-negative integer")?
                as u32,
            Some(Value::String(text)) => text
                .parse::<u32>()
                .map_err(|_| "attempt must be a non-negative integer")?,
            Some(_) => return Err("attempt must be a non-negative integer".to_string()),
        };

        let metadata = raw
            .iter()
            .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), flatten(value)))
            .collect();

        Ok(Self {
            task_id,
            video_id,
            source_path,
            attempt,
            metadata,
        })
    }
}

fn field(raw: &Map<String, Value>, key: &str) -> Option<String> {
    raw.get(key).map(flatten).filter(|value| !value.is_empty())
}

/// Render a payload value back to the flat string form brokers carry.
pub fn flatten(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Envelope around a decoded task, valid for one handler iteration
///
/// `raw` retains the untouched payload so unknown fields survive a retry.
#[derive(Debug, Clone)]
pub struct TaskMessage {
    /// Broker-side identity: stream entry id or receipt handle
    pub broker_id: String,
    pub task: Task,
    pub raw: Map<String, Value>,
}

impl TaskMessage {
    /// Payload for the retry copy: attempt incremented, failure reason
    /// attached, every other field preserved verbatim.
    pub fn retry_payload(&self, reason: &str) -> Map<String, Value> {
        let mut next = self.raw.clone();
        next.insert("attempt".to_string(), Value::from(self.task.attempt + 1));
        next.insert("error".to_string(), Value::from(reason));
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(attempt: Option<Value>) -> Map<String, Value> {
        let mut raw = Map::new();
        raw.insert("task_id".to_string(), Value::from("t-1"));
        raw.insert("video_id".to_string(), Value::from("v-1"));
        raw.insert("source_path".to_string(), Value::from("src/a.mp4"));
        if let Some(attempt) = attempt {
            raw.insert("attempt".to_string(), attempt);
        }
        raw.insert("submitted_by".to_string(), Value::from("upload-api"));
        raw
    }

    #[test]
    fn decodes_a_complete_payload() {
        let task = Task::from_raw(&payload(Some(Value::from(2)))).unwrap();
        assert_eq!(task.task_id, "t-1");
        assert_eq!(task.video_id, "v-1");
        assert_eq!(task.source_path, "src/a.mp4");
        assert_eq!(task.attempt, 2);
        assert_eq!(task.metadata.get("submitted_by").unwrap(), "upload-api");
    }

    #[test]
    fn attempt_defaults_to_zero() {
        let task = Task::from_raw(&payload(None)).unwrap();
        assert_eq!(task.attempt, 0);
    }

    #[test]
    fn attempt_accepts_string_form() {
        let task = Task::from_raw(&payload(Some(Value::from("3")))).unwrap();
        assert_eq!(task.attempt, 3);
    }

    #[test]
    fn rejects_missing_required_fields() {
        let mut raw = payload(None);
        raw.remove("video_id");
        let err = Task::from_raw(&raw).unwrap_err();
        assert!(err.contains("video_id"));
    }

    #[test]
    fn rejects_negative_attempt() {
        assert!(Task::from_raw(&payload(Some(Value::from(-1)))).is_err());
    }

    #[test]
    fn retry_payload_increments_attempt_and_preserves_unknown_fields() {
        let raw = payload(Some(Value::from(1)));
        let task = Task::from_raw(&raw).unwrap();
        let message = TaskMessage {
            broker_id: "1-0".to_string(),
            task,
            raw,
        };

        let next = message.retry_payload("download failed");
        assert_eq!(next.get("attempt").unwrap(), &Value::from(2));
        assert_eq!(next.get("error").unwrap(), &Value::from("download failed"));
        assert_eq!(next.get("submitted_by").unwrap(), &Value::from("upload-api"));
        assert_eq!(next.get("source_path").unwrap(), &Value::from("src/a.mp4"));
    }

    #[test]
    fn status_round_trips_through_serde() {
        let json = serde_json::to_string(&VideoStatus::Processed).unwrap();
        assert_eq!(json, "\"processed\"");
        let status: VideoStatus = serde_json::from_str("\"uploaded\"").unwrap();
        assert_eq!(status, VideoStatus::Uploaded);
        assert_eq!(status.as_str(), "uploaded");
    }
}

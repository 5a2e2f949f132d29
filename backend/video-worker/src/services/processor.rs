/// Process-task use case
///
/// Drives one task end-to-end: fetch → load row → download → transcode →
/// upload → persist → ack. Every failure before the final row update walks
/// back through a compensating reset to `uploaded` and hands the message
/// back to the queue for retry or dead-lettering. No partial state survives
/// a failure.
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::video_repo::{VideoRepository, VideoStateUpdate};
use crate::error::{RepoError, Result, TranscodeError, WorkerError};
use crate::metrics::WorkerMetrics;
use crate::models::{TaskMessage, Video, VideoStatus};
use crate::services::queue::{FailureOutcome, TaskQueue};
use crate::services::storage::BlobStorage;
use crate::services::transcoder::{TranscodeOptions, Transcoder, Watermark};

/// Per-task transform and timeout parameters, fixed at bootstrap
#[derive(Clone, Debug)]
pub struct ProcessorSettings {
    pub width: u32,
    pub height: u32,
    pub clip_secs: f64,
    pub remove_audio: bool,
    pub watermark_text: Option<String>,
    pub processing_timeout: Option<Duration>,
}

impl ProcessorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            width: config.processing.width,
            height: config.processing.height,
            clip_secs: config.processing.clip_secs,
            remove_audio: config.processing.remove_audio,
            watermark_text: config.processing.watermark_text.clone(),
            processing_timeout: config.processing.timeout,
        }
    }

    fn transcode_options(&self) -> TranscodeOptions {
        TranscodeOptions {
            width: self.width,
            height: self.height,
            format: "mp4".to_string(),
            clip_secs: self.clip_secs,
            remove_audio: self.remove_audio,
            watermark: self.watermark_text.as_ref().map(|text| Watermark {
                text: Some(text.clone()),
                ..Watermark::default()
            }),
        }
    }
}

pub struct TaskProcessor {
    worker_id: String,
    queue: Box<dyn TaskQueue>,
    repository: Arc<dyn VideoRepository>,
    storage: Arc<dyn BlobStorage>,
    transcoder: Arc<dyn Transcoder>,
    metrics: Arc<WorkerMetrics>,
    settings: ProcessorSettings,
}

impl TaskProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: String,
        queue: Box<dyn TaskQueue>,
        repository: Arc<dyn VideoRepository>,
        storage: Arc<dyn BlobStorage>,
        transcoder: Arc<dyn Transcoder>,
        metrics: Arc<WorkerMetrics>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            worker_id,
            queue,
            repository,
            storage,
            transcoder,
            metrics,
            settings,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Process at most one message. `Ok(false)` means the poll came back
    /// empty; transport errors bubble up so the outer loop can cool down.
    pub async fn run_once(&mut self) -> Result<bool> {
        let message = match self.queue.fetch().await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(false),
            Err(err) => {
                self.metrics.queue_error(&self.worker_id);
                return Err(err.into());
            }
        };

        let started = Instant::now();
        let outcome = self.handle_message(&message).await;
        let status = match &outcome {
            Ok(()) => VideoStatus::Processed.as_str(),
            Err(_) => "failed",
        };
        self.metrics
            .task_finished(status, &self.worker_id, started.elapsed());

        outcome.map(|()| true)
    }

    async fn handle_message(&mut self, message: &TaskMessage) -> Result<()> {
        let task = &message.task;

        let video_id = match Uuid::parse_str(&task.video_id) {
            Ok(id) => id,
            Err(_) => {
                let err = RepoError::NotFound(task.video_id.clone());
                warn!(
                    task_id = %task.task_id,
                    video_id = %task.video_id,
                    "task references an unknown video"
                );
                self.fail_message(message, &err.to_string()).await;
                return Err(err.into());
            }
        };

        let video = match self.repository.find_by_id(video_id).await {
            Ok(video) => video,
            Err(err) => {
                warn!(
                    task_id = %task.task_id,
                    video_id = %task.video_id,
                    error = %err,
                    "failed to load video row"
                );
                self.fail_message(message, &err.to_string()).await;
                return Err(err.into());
            }
        };

        let pipeline = self.run_pipeline(message);
        let result = match self.settings.processing_timeout {
            Some(limit) => match tokio::time::timeout(limit, pipeline).await {
                Ok(result) => result,
                Err(_) => Err(WorkerError::Timeout(limit)),
            },
            None => pipeline.await,
        };

        let (processed_id, processed_url) = match result {
            Ok(output) => output,
            Err(err) => {
                warn!(
                    task_id = %task.task_id,
                    video_id = %video.id,
                    error = %err,
                    "task processing failed"
                );
                self.reset_video(&video).await;
                self.fail_message(message, &err.to_string()).await;
                return Err(err);
            }
        };

        let update =
            VideoStateUpdate::processed(video.id, processed_id, processed_url.clone(), Utc::now());
        if let Err(err) = self.repository.update_processing_state(&update).await {
            warn!(
                task_id = %task.task_id,
                video_id = %video.id,
                error = %err,
                "failed to persist processed state"
            );
            self.fail_message(message, &err.to_string()).await;
            return Err(err.into());
        }

        if let Err(err) = self.queue.ack(message).await {
            // The row is authoritative; broker redelivery converges on the
            // same terminal state.
            warn!(
                task_id = %task.task_id,
                video_id = %video.id,
                error = %err,
                "ack failed after successful persist"
            );
        }

        info!(
            task_id = %task.task_id,
            video_id = %video.id,
            processed_url = %processed_url,
            worker_id = %self.worker_id,
            "task processed"
        );

        Ok(())
    }

    /// Download, transcode and upload under the per-task bound. Returns the
    /// fresh processed blob id and its storage path.
    async fn run_pipeline(&self, message: &TaskMessage) -> Result<(Uuid, String)> {
        let task = &message.task;

        let raw = self.storage.download(&task.source_path).await?;

        let options = self.settings.transcode_options();
        let artifact = self.transcoder.process(raw, &options).await?;

        let processed_id = Uuid::new_v4();
        let processed_url = format!("{processed_id}.{}", artifact.format);

        let data = artifact.read().await.map_err(TranscodeError::Io)?;
        self.storage.upload(&processed_url, data).await?;

        Ok((processed_id, processed_url))
    }

    async fn reset_video(&self, video: &Video) {
        let update = VideoStateUpdate::reset_to_uploaded(video.id);
        if let Err(err) = self.repository.update_processing_state(&update).await {
            warn!(
                video_id = %video.id,
                error = %err,
                "failed to reset video row after processing failure"
            );
        }
    }

    async fn fail_message(&mut self, message: &TaskMessage, reason: &str) {
        match self.queue.fail(message, reason).await {
            Ok(FailureOutcome::Requeued { attempt }) => {
                info!(
                    task_id = %message.task.task_id,
                    video_id = %message.task.video_id,
                    attempt,
                    "task re-queued for retry"
                );
            }
            Ok(FailureOutcome::DeadLettered) => {
                warn!(
                    task_id = %message.task.task_id,
                    video_id = %message.task.video_id,
                    attempt = message.task.attempt,
                    "delivery attempts exhausted, task dead-lettered"
                );
            }
            Err(err) => {
                warn!(
                    task_id = %message.task.task_id,
                    error = %err,
                    "failed to hand message back to the queue"
                );
            }
        }
    }
}

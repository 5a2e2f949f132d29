//! End-to-end worker flows against in-process fakes
//!
//! The fakes keep real attempt/dead-letter bookkeeping so these tests can
//! assert the row/queue/metrics invariants: every acked task left a fully
//! processed row, every earlier failure left the row reset, and each message
//! saw exactly one terminal queue event per delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::watch;
use uuid::Uuid;

use video_worker::db::video_repo::{VideoRepository, VideoStateUpdate};
use video_worker::error::{QueueError, RepoError, StorageError, TranscodeError};
use video_worker::metrics::WorkerMetrics;
use video_worker::models::{Task, TaskMessage, Video, VideoStatus};
use video_worker::services::processor::{ProcessorSettings, TaskProcessor};
use video_worker::services::queue::{FailureOutcome, TaskQueue};
use video_worker::services::storage::BlobStorage;
use video_worker::services::transcoder::{
    ProcessedVideo, TempFile, TranscodeOptions, Transcoder,
};
use video_worker::worker::run_worker_loop;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    pending: std::collections::VecDeque<TaskMessage>,
    in_flight: Vec<TaskMessage>,
    acked: Vec<String>,
    requeue_events: u32,
    dead_lettered: Vec<String>,
}

struct FakeQueue {
    state: Arc<Mutex<QueueState>>,
    max_deliveries: u32,
}

impl FakeQueue {
    fn new(max_deliveries: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            max_deliveries,
        }
    }

    fn handle(&self) -> Arc<Mutex<QueueState>> {
        self.state.clone()
    }

    fn push(&self, message: TaskMessage) {
        self.state.lock().unwrap().pending.push_back(message);
    }
}

#[async_trait]
impl TaskQueue for FakeQueue {
    async fn fetch(&mut self) -> Result<Option<TaskMessage>, QueueError> {
        let mut state = self.state.lock().unwrap();
        match state.pending.pop_front() {
            Some(message) => {
                state.in_flight.push(message.clone());
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    async fn ack(&mut self, message: &TaskMessage) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.in_flight.retain(|m| m.broker_id != message.broker_id);
        state.acked.push(message.broker_id.clone());
        Ok(())
    }

    async fn fail(
        &mut self,
        message: &TaskMessage,
        reason: &str,
    ) -> Result<FailureOutcome, QueueError> {
        let mut state = self.state.lock().unwrap();
        state.in_flight.retain(|m| m.broker_id != message.broker_id);

        let next_attempt = message.task.attempt + 1;
        if next_attempt >= self.max_deliveries {
            state.dead_lettered.push(message.broker_id.clone());
            return Ok(FailureOutcome::DeadLettered);
        }

        let raw = message.retry_payload(reason);
        let task = Task::from_raw(&raw).map_err(QueueError::Malformed)?;
        state.pending.push_back(TaskMessage {
            broker_id: format!("{}-r{next_attempt}", message.broker_id),
            task,
            raw,
        });
        state.requeue_events += 1;

        Ok(FailureOutcome::Requeued {
            attempt: next_attempt,
        })
    }
}

#[derive(Default)]
struct FakeStorage {
    objects: Mutex<HashMap<String, Bytes>>,
    download_failures: AtomicUsize,
}

impl FakeStorage {
    fn put(&self, path: &str, data: Bytes) {
        self.objects.lock().unwrap().insert(path.to_string(), data);
    }

    fn contains(&self, path: &str) -> bool {
        self.objects.lock().unwrap().contains_key(path)
    }

    fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    fn fail_next_downloads(&self, count: usize) {
        self.download_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStorage for FakeStorage {
    async fn download(&self, path: &str) -> Result<Bytes, StorageError> {
        if self.download_failures.load(Ordering::SeqCst) > 0 {
            self.download_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(StorageError::Transport("injected download fault".to_string()));
        }
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn upload(&self, path: &str, data: Bytes) -> Result<(), StorageError> {
        self.objects.lock().unwrap().insert(path.to_string(), data);
        Ok(())
    }
}

#[derive(Default)]
struct FakeRepo {
    rows: Mutex<HashMap<Uuid, Video>>,
    update_rejections: AtomicUsize,
}

impl FakeRepo {
    fn with_row(video: Video) -> Arc<Self> {
        let repo = Self::default();
        repo.rows.lock().unwrap().insert(video.id, video);
        Arc::new(repo)
    }

    fn get(&self, id: Uuid) -> Video {
        self.rows.lock().unwrap().get(&id).cloned().expect("row exists")
    }

    fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    fn reject_next_updates(&self, count: usize) {
        self.update_rejections.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl VideoRepository for FakeRepo {
    async fn find_by_id(&self, id: Uuid) -> Result<Video, RepoError> {
        self.rows
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::NotFound(id.to_string()))
    }

    async fn update_processing_state(&self, update: &VideoStateUpdate) -> Result<(), RepoError> {
        if self.update_rejections.load(Ordering::SeqCst) > 0 {
            self.update_rejections.fetch_sub(1, Ordering::SeqCst);
            return Err(RepoError::Database("injected update failure".to_string()));
        }

        let mut rows = self.rows.lock().unwrap();
        let video = rows
            .get_mut(&update.id)
            .ok_or_else(|| RepoError::NotFound(update.id.to_string()))?;
        video.status = update.status;
        video.processed_video_id = update.processed_video_id;
        video.processed_url = update.processed_url.clone();
        video.processed_at = update.processed_at;
        Ok(())
    }
}

enum TranscodeBehavior {
    Succeed,
    Sleep(Duration),
}

struct FakeTranscoder {
    behavior: TranscodeBehavior,
}

impl FakeTranscoder {
    fn succeed() -> Arc<Self> {
        Arc::new(Self {
            behavior: TranscodeBehavior::Succeed,
        })
    }

    fn sleepy(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            behavior: TranscodeBehavior::Sleep(duration),
        })
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn process(
        &self,
        input: Bytes,
        options: &TranscodeOptions,
    ) -> Result<ProcessedVideo, TranscodeError> {
        if let TranscodeBehavior::Sleep(duration) = self.behavior {
            tokio::time::sleep(duration).await;
        }

        let path = std::env::temp_dir().join(format!("fake-transcode-{}.mp4", Uuid::new_v4()));
        tokio::fs::write(&path, &input).await?;
        Ok(ProcessedVideo::new(
            TempFile::new(path),
            options.format.clone(),
            options.clip_secs + 5.0,
        ))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn uploaded_video(id: Uuid) -> Video {
    Video {
        id,
        owner_id: Uuid::new_v4(),
        raw_video_id: Uuid::new_v4(),
        processed_video_id: None,
        title: "tryout".to_string(),
        status: VideoStatus::Uploaded,
        uploaded_at: Utc::now(),
        processed_at: None,
        original_url: "src/a.mp4".to_string(),
        processed_url: None,
        votes: 0,
    }
}

fn message(task_id: &str, video_id: &str, source_path: &str, attempt: u32) -> TaskMessage {
    let mut raw = Map::new();
    raw.insert("task_id".to_string(), Value::from(task_id));
    raw.insert("video_id".to_string(), Value::from(video_id));
    raw.insert("source_path".to_string(), Value::from(source_path));
    raw.insert("attempt".to_string(), Value::from(attempt));
    raw.insert("origin".to_string(), Value::from("upload-api"));
    let task = Task::from_raw(&raw).expect("valid task payload");
    TaskMessage {
        broker_id: format!("m-{task_id}"),
        task,
        raw,
    }
}

fn settings(timeout: Option<Duration>) -> ProcessorSettings {
    ProcessorSettings {
        width: 1280,
        height: 720,
        clip_secs: 30.0,
        remove_audio: true,
        watermark_text: None,
        processing_timeout: timeout,
    }
}

#[allow(clippy::too_many_arguments)]
fn processor(
    queue: FakeQueue,
    repo: Arc<FakeRepo>,
    storage: Arc<FakeStorage>,
    transcoder: Arc<FakeTranscoder>,
    metrics: Arc<WorkerMetrics>,
    timeout: Option<Duration>,
) -> TaskProcessor {
    TaskProcessor::new(
        "worker-0".to_string(),
        Box::new(queue),
        repo,
        storage,
        transcoder,
        metrics,
        settings(timeout),
    )
}

fn processed_count(metrics: &WorkerMetrics) -> u64 {
    metrics
        .tasks_processed
        .with_label_values(&["processed", "worker-0"])
        .get()
}

fn failed_count(metrics: &WorkerMetrics) -> u64 {
    metrics
        .tasks_processed
        .with_label_values(&["failed", "worker-0"])
        .get()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Scenario A: happy path.
#[tokio::test]
async fn happy_path_processes_uploads_and_acks() {
    let video_id = Uuid::new_v4();
    let repo = FakeRepo::with_row(uploaded_video(video_id));
    let storage = Arc::new(FakeStorage::default());
    storage.put("src/a.mp4", Bytes::from(vec![0xab; 1 << 20]));

    let queue = FakeQueue::new(3);
    queue.push(message("T", &video_id.to_string(), "src/a.mp4", 0));
    let queue_state = queue.handle();

    let metrics = Arc::new(WorkerMetrics::new());
    let mut processor = processor(
        queue,
        repo.clone(),
        storage.clone(),
        FakeTranscoder::succeed(),
        metrics.clone(),
        None,
    );

    let handled = processor.run_once().await.expect("iteration succeeds");
    assert!(handled);

    let row = repo.get(video_id);
    assert_eq!(row.status, VideoStatus::Processed);
    let processed_id = row.processed_video_id.expect("processed blob id set");
    let processed_url = row.processed_url.clone().expect("processed url set");
    assert_eq!(processed_url, format!("{processed_id}.mp4"));
    assert!(row.processed_at.is_some());
    assert!(storage.contains(&processed_url));

    let state = queue_state.lock().unwrap();
    assert!(state.pending.is_empty());
    assert!(state.in_flight.is_empty());
    assert_eq!(state.acked.len(), 1);
    assert_eq!(state.requeue_events, 0);
    assert!(state.dead_lettered.is_empty());

    assert_eq!(processed_count(&metrics), 1);
    assert_eq!(failed_count(&metrics), 0);
    assert_eq!(
        metrics
            .task_seconds
            .with_label_values(&["processed", "worker-0"])
            .get_sample_count(),
        1
    );
}

/// Scenario B: a task referencing an unknown video retries until the
/// delivery limit, then dead-letters without ever touching the row set.
#[tokio::test]
async fn missing_row_retries_then_dead_letters() {
    let repo = Arc::new(FakeRepo::default());
    let storage = Arc::new(FakeStorage::default());

    let max_deliveries = 3;
    let queue = FakeQueue::new(max_deliveries);
    queue.push(message("T", "UNKNOWN", "src/a.mp4", 0));
    let queue_state = queue.handle();

    let metrics = Arc::new(WorkerMetrics::new());
    let mut processor = processor(
        queue,
        repo.clone(),
        storage,
        FakeTranscoder::succeed(),
        metrics.clone(),
        None,
    );

    assert!(processor.run_once().await.is_err());
    assert_eq!(failed_count(&metrics), 1);
    {
        let state = queue_state.lock().unwrap();
        let retry = state.pending.front().expect("message re-queued");
        assert_eq!(retry.task.attempt, 1);
        assert!(retry.raw.get("error").is_some());
        assert_eq!(retry.raw.get("origin"), Some(&Value::from("upload-api")));
    }

    for _ in 1..max_deliveries {
        assert!(processor.run_once().await.is_err());
    }

    let state = queue_state.lock().unwrap();
    assert!(state.pending.is_empty());
    assert!(state.in_flight.is_empty());
    assert!(state.acked.is_empty());
    assert_eq!(state.requeue_events, max_deliveries - 1);
    assert_eq!(state.dead_lettered.len(), 1);
    assert_eq!(failed_count(&metrics), max_deliveries as u64);
    assert_eq!(repo.row_count(), 0);
}

/// Scenario C: transient download faults retry and eventually succeed.
#[tokio::test]
async fn transient_download_faults_recover_before_the_delivery_limit() {
    let video_id = Uuid::new_v4();
    let repo = FakeRepo::with_row(uploaded_video(video_id));
    let storage = Arc::new(FakeStorage::default());
    storage.put("src/a.mp4", Bytes::from_static(b"raw video"));
    storage.fail_next_downloads(2);

    let queue = FakeQueue::new(5);
    queue.push(message("T", &video_id.to_string(), "src/a.mp4", 0));
    let queue_state = queue.handle();

    let metrics = Arc::new(WorkerMetrics::new());
    let mut processor = processor(
        queue,
        repo.clone(),
        storage.clone(),
        FakeTranscoder::succeed(),
        metrics.clone(),
        None,
    );

    assert!(processor.run_once().await.is_err());
    {
        // the compensating reset held the row in `uploaded`
        let row = repo.get(video_id);
        assert_eq!(row.status, VideoStatus::Uploaded);
        assert!(row.processed_video_id.is_none());
        assert!(row.processed_url.is_none());
        assert!(row.processed_at.is_none());
    }
    assert!(processor.run_once().await.is_err());
    assert!(processor.run_once().await.expect("third attempt succeeds"));

    let row = repo.get(video_id);
    assert_eq!(row.status, VideoStatus::Processed);

    let state = queue_state.lock().unwrap();
    assert!(state.pending.is_empty());
    assert_eq!(state.acked.len(), 1);
    assert_eq!(state.requeue_events, 2);
    assert!(state.dead_lettered.is_empty());

    assert_eq!(failed_count(&metrics), 2);
    assert_eq!(processed_count(&metrics), 1);
}

/// Scenario D: the per-task timeout cuts a hung transcode, resets the row
/// and re-queues the message.
#[tokio::test(start_paused = true)]
async fn transcode_timeout_resets_and_requeues() {
    let video_id = Uuid::new_v4();
    let repo = FakeRepo::with_row(uploaded_video(video_id));
    let storage = Arc::new(FakeStorage::default());
    storage.put("src/a.mp4", Bytes::from_static(b"raw video"));

    let queue = FakeQueue::new(3);
    queue.push(message("T", &video_id.to_string(), "src/a.mp4", 0));
    let queue_state = queue.handle();

    let metrics = Arc::new(WorkerMetrics::new());
    let mut processor = processor(
        queue,
        repo.clone(),
        storage,
        FakeTranscoder::sleepy(Duration::from_secs(2)),
        metrics.clone(),
        Some(Duration::from_secs(1)),
    );

    let err = processor.run_once().await.expect_err("iteration times out");
    assert!(err.to_string().contains("timed out"));

    let row = repo.get(video_id);
    assert_eq!(row.status, VideoStatus::Uploaded);
    assert!(row.processed_url.is_none());

    let state = queue_state.lock().unwrap();
    assert_eq!(state.pending.len(), 1);
    assert_eq!(state.pending.front().unwrap().task.attempt, 1);
    assert_eq!(failed_count(&metrics), 1);
}

/// Scenario E: a rejected persist leaks one blob but the retry converges on
/// a fresh one; the row ends up pointing at the second.
#[tokio::test]
async fn persist_failure_after_upload_converges_on_a_fresh_blob() {
    let video_id = Uuid::new_v4();
    let repo = FakeRepo::with_row(uploaded_video(video_id));
    let storage = Arc::new(FakeStorage::default());
    storage.put("src/a.mp4", Bytes::from_static(b"raw video"));
    repo.reject_next_updates(1);

    let queue = FakeQueue::new(5);
    queue.push(message("T", &video_id.to_string(), "src/a.mp4", 0));
    let queue_state = queue.handle();

    let metrics = Arc::new(WorkerMetrics::new());
    let mut processor = processor(
        queue,
        repo.clone(),
        storage.clone(),
        FakeTranscoder::succeed(),
        metrics.clone(),
        None,
    );

    assert!(processor.run_once().await.is_err());
    let first_blob = storage
        .keys()
        .into_iter()
        .find(|key| key != "src/a.mp4")
        .expect("first blob uploaded before the rejected persist");

    assert!(processor.run_once().await.expect("second attempt succeeds"));

    let processed: Vec<String> = storage
        .keys()
        .into_iter()
        .filter(|key| key != "src/a.mp4")
        .collect();
    assert_eq!(processed.len(), 2);

    let row = repo.get(video_id);
    assert_eq!(row.status, VideoStatus::Processed);
    let final_url = row.processed_url.expect("processed url set");
    assert_ne!(final_url, first_blob);
    assert!(storage.contains(&final_url));

    let state = queue_state.lock().unwrap();
    assert!(state.pending.is_empty());
    assert_eq!(state.acked.len(), 1);
    assert_eq!(state.requeue_events, 1);
}

/// Scenario F: graceful shutdown abandons the in-flight task; the message
/// is neither acked nor failed, so the broker will redeliver it.
#[tokio::test(start_paused = true)]
async fn shutdown_abandons_the_in_flight_task() {
    let video_id = Uuid::new_v4();
    let repo = FakeRepo::with_row(uploaded_video(video_id));
    let storage = Arc::new(FakeStorage::default());
    storage.put("src/a.mp4", Bytes::from_static(b"raw video"));

    let queue = FakeQueue::new(3);
    queue.push(message("T", &video_id.to_string(), "src/a.mp4", 0));
    let queue_state = queue.handle();

    let metrics = Arc::new(WorkerMetrics::new());
    let processor = processor(
        queue,
        repo,
        storage,
        FakeTranscoder::sleepy(Duration::from_secs(3600)),
        metrics,
        None,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(run_worker_loop(processor, shutdown_rx));

    // let the worker pick the message up and park inside the transcode
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).expect("worker is listening");

    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker drains within the grace window")
        .expect("worker task completes");

    let state = queue_state.lock().unwrap();
    assert!(state.pending.is_empty());
    assert_eq!(state.in_flight.len(), 1);
    assert!(state.acked.is_empty());
    assert_eq!(state.requeue_events, 0);
    assert!(state.dead_lettered.is_empty());
}

/// An empty poll is not an error and records no terminal outcome.
#[tokio::test]
async fn empty_poll_touches_no_counters() {
    let repo = Arc::new(FakeRepo::default());
    let storage = Arc::new(FakeStorage::default());
    let queue = FakeQueue::new(3);

    let metrics = Arc::new(WorkerMetrics::new());
    let mut processor = processor(
        queue,
        repo,
        storage,
        FakeTranscoder::succeed(),
        metrics.clone(),
        None,
    );

    let handled = processor.run_once().await.expect("empty poll is fine");
    assert!(!handled);
    assert_eq!(processed_count(&metrics), 0);
    assert_eq!(failed_count(&metrics), 0);
    assert_eq!(
        metrics
            .task_seconds
            .with_label_values(&["processed", "worker-0"])
            .get_sample_count(),
        0
    );
}

struct BrokenQueue;

#[async_trait]
impl TaskQueue for BrokenQueue {
    async fn fetch(&mut self) -> Result<Option<TaskMessage>, QueueError> {
        Err(QueueError::Transport("broker unreachable".to_string()))
    }

    async fn ack(&mut self, _message: &TaskMessage) -> Result<(), QueueError> {
        Err(QueueError::Transport("broker unreachable".to_string()))
    }

    async fn fail(
        &mut self,
        _message: &TaskMessage,
        _reason: &str,
    ) -> Result<FailureOutcome, QueueError> {
        Err(QueueError::Transport("broker unreachable".to_string()))
    }
}

/// A transport failure counts as a queue error, not a task outcome.
#[tokio::test]
async fn fetch_transport_failure_counts_as_a_queue_error() {
    let metrics = Arc::new(WorkerMetrics::new());
    let mut processor = TaskProcessor::new(
        "worker-0".to_string(),
        Box::new(BrokenQueue),
        Arc::new(FakeRepo::default()),
        Arc::new(FakeStorage::default()),
        FakeTranscoder::succeed(),
        metrics.clone(),
        settings(None),
    );

    assert!(processor.run_once().await.is_err());

    assert_eq!(
        metrics
            .queue_errors
            .with_label_values(&["worker-0"])
            .get(),
        1
    );
    assert_eq!(processed_count(&metrics), 0);
    assert_eq!(failed_count(&metrics), 0);
}

/// A message already at the last allowed delivery dead-letters on failure
/// instead of retrying.
#[tokio::test]
async fn final_delivery_dead_letters_instead_of_retrying() {
    let repo = Arc::new(FakeRepo::default());
    let storage = Arc::new(FakeStorage::default());

    let queue = FakeQueue::new(3);
    // attempt 2 of max 3: this delivery is the last one
    queue.push(message("T", "UNKNOWN", "src/a.mp4", 2));
    let queue_state = queue.handle();

    let metrics = Arc::new(WorkerMetrics::new());
    let mut processor = processor(
        queue,
        repo,
        storage,
        FakeTranscoder::succeed(),
        metrics,
        None,
    );

    assert!(processor.run_once().await.is_err());

    let state = queue_state.lock().unwrap();
    assert!(state.pending.is_empty());
    assert_eq!(state.requeue_events, 0);
    assert_eq!(state.dead_lettered.len(), 1);
}

/// Prometheus metrics for the worker
///
/// The registry is owned by `WorkerMetrics` and injected into the components
/// that observe it; nothing registers against the global default registry.
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, HttpResponse};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

pub struct WorkerMetrics {
    registry: Registry,
    pub tasks_processed: IntCounterVec,
    pub task_seconds: HistogramVec,
    pub queue_errors: IntCounterVec,
    pub queue_depth: IntGaugeVec,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let tasks_processed = IntCounterVec::new(
            Opts::new(
                "tasks_processed_total",
                "Terminal task outcomes by status",
            ),
            &["status", "worker_id"],
        )
        .expect("failed to create tasks_processed_total");
        registry
            .register(Box::new(tasks_processed.clone()))
            .expect("failed to register tasks_processed_total");

        let task_seconds = HistogramVec::new(
            HistogramOpts::new(
                "task_processing_seconds",
                "Wall time spent on one task iteration",
            )
            .buckets(vec![
                0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
            ]),
            &["status", "worker_id"],
        )
        .expect("failed to create task_processing_seconds");
        registry
            .register(Box::new(task_seconds.clone()))
            .expect("failed to register task_processing_seconds");

        let queue_errors = IntCounterVec::new(
            Opts::new("queue_errors_total", "Queue transport failures"),
            &["worker_id"],
        )
        .expect("failed to create queue_errors_total");
        registry
            .register(Box::new(queue_errors.clone()))
            .expect("failed to register queue_errors_total");

        let queue_depth = IntGaugeVec::new(
            Opts::new("queue_depth", "Messages visible on the task queue"),
            &["worker_id"],
        )
        .expect("failed to create queue_depth");
        registry
            .register(Box::new(queue_depth.clone()))
            .expect("failed to register queue_depth");

        #[cfg(target_os = "linux")]
        registry
            .register(Box::new(
                prometheus::process_collector::ProcessCollector::for_self(),
            ))
            .expect("failed to register process collector");

        Self {
            registry,
            tasks_processed,
            task_seconds,
            queue_errors,
            queue_depth,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one terminal task outcome. Called exactly once per iteration
    /// that pulled a message.
    pub fn task_finished(&self, status: &str, worker_id: &str, elapsed: Duration) {
        self.tasks_processed
            .with_label_values(&[status, worker_id])
            .inc();
        self.task_seconds
            .with_label_values(&[status, worker_id])
            .observe(elapsed.as_secs_f64());
    }

    pub fn queue_error(&self, worker_id: &str) {
        self.queue_errors.with_label_values(&[worker_id]).inc();
    }

    pub fn set_queue_depth(&self, worker_id: &str, depth: i64) {
        self.queue_depth.with_label_values(&[worker_id]).set(depth);
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn metrics_handler(metrics: web::Data<Arc<WorkerMetrics>>) -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry().gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

pub async fn health_handler() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(metrics: &WorkerMetrics) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&metrics.registry().gather(), &mut buffer)
            .unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn task_finished_records_one_count_and_one_observation() {
        let metrics = WorkerMetrics::new();
        metrics.task_finished("processed", "worker-0", Duration::from_millis(120));

        assert_eq!(
            metrics
                .tasks_processed
                .with_label_values(&["processed", "worker-0"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .task_seconds
                .with_label_values(&["processed", "worker-0"])
                .get_sample_count(),
            1
        );
    }

    #[test]
    fn scrape_body_carries_all_series() {
        let metrics = WorkerMetrics::new();
        metrics.task_finished("failed", "worker-1", Duration::from_secs(1));
        metrics.queue_error("worker-1");
        metrics.set_queue_depth("worker-1", 7);

        let body = encode(&metrics);
        assert!(body.contains("tasks_processed_total"));
        assert!(body.contains("task_processing_seconds"));
        assert!(body.contains("queue_errors_total"));
        assert!(body.contains("queue_depth"));
        assert!(body.contains("worker_id=\"worker-1\""));
    }

    #[test]
    fn registries_are_independent() {
        let first = WorkerMetrics::new();
        let second = WorkerMetrics::new();
        first.queue_error("worker-0");

        assert_eq!(first.queue_errors.with_label_values(&["worker-0"]).get(), 1);
        assert_eq!(second.queue_errors.with_label_values(&["worker-0"]).get(), 0);
    }
}

//! Video worker service
//!
//! Builds the adapters from configuration, spawns the worker pool and the
//! metrics endpoint, and shuts everything down gracefully on SIGINT. Exits
//! non-zero when bootstrap fails: invalid config, unreachable database or
//! queue, or a missing transcoder binary.

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use video_worker::config::Config;
use video_worker::db::video_repo::{PgVideoRepository, VideoRepository};
use video_worker::metrics::{self, WorkerMetrics};
use video_worker::services::processor::{ProcessorSettings, TaskProcessor};
use video_worker::services::transcoder::{FfmpegTranscoder, Transcoder};
use video_worker::services::{queue, storage};
use video_worker::db;
use video_worker::worker::run_worker_loop;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(&config);
    info!(app = %config.app.name, "starting video worker");

    for binary in [&config.transcoder.ffmpeg_path, &config.transcoder.ffprobe_path] {
        which::which(binary)
            .with_context(|| format!("transcoder binary `{binary}` not found on PATH"))?;
    }

    let pool = db::connect(&config.database)
        .await
        .context("database unreachable")?;
    info!("database pool ready");

    let repository: Arc<dyn VideoRepository> = Arc::new(PgVideoRepository::new(pool));
    let storage = storage::from_config(&config.storage)
        .await
        .context("failed to build storage adapter")?;
    let transcoder: Arc<dyn Transcoder> =
        Arc::new(FfmpegTranscoder::new(config.transcoder.clone()));
    let metrics = Arc::new(WorkerMetrics::new());
    let settings = ProcessorSettings::from_config(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer_prefix = config
        .queue
        .redis
        .as_ref()
        .map(|redis| redis.consumer_prefix.clone())
        .unwrap_or_else(|| "worker".to_string());

    let mut workers = Vec::new();
    for index in 0..config.worker.pool_size {
        let worker_id = format!("{consumer_prefix}-{index}");
        // Each worker gets its own adapter so broker receive state stays
        // disjoint.
        let queue = queue::from_config(&config.queue, &worker_id, metrics.clone())
            .await
            .context("queue unreachable")?;
        let processor = TaskProcessor::new(
            worker_id,
            queue,
            repository.clone(),
            storage.clone(),
            transcoder.clone(),
            metrics.clone(),
            settings.clone(),
        );
        workers.push(tokio::spawn(run_worker_loop(
            processor,
            shutdown_rx.clone(),
        )));
    }
    info!(pool_size = config.worker.pool_size, "worker pool started");

    let server = {
        let metrics = metrics.clone();
        HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(metrics.clone()))
                .route("/metrics", web::get().to(metrics::metrics_handler))
                .route("/health", web::get().to(metrics::health_handler))
        })
        .bind(&config.metrics.listen_addr)
        .with_context(|| format!("failed to bind metrics listener {}", config.metrics.listen_addr))?
        .disable_signals()
        .run()
    };
    let server_handle = server.handle();
    let mut server_task = tokio::spawn(server);
    info!(addr = %config.metrics.listen_addr, "metrics endpoint ready");

    let mut server_exited = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        joined = &mut server_task => {
            server_exited = true;
            match joined {
                Ok(Ok(())) => warn!("metrics server exited"),
                Ok(Err(err)) => error!(error = %err, "metrics server failed"),
                Err(err) => error!(error = %err, "metrics server task failed"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    let grace = config.worker.shutdown_grace;
    if tokio::time::timeout(grace, futures::future::join_all(workers))
        .await
        .is_err()
    {
        warn!(
            grace_secs = grace.as_secs(),
            "grace period elapsed, abandoning in-flight work"
        );
    }

    if !server_exited {
        server_handle.stop(true).await;
        let _ = server_task.await;
    }

    info!("video worker stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.app.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

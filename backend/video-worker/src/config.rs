/// Configuration management for the video worker
///
/// Loads configuration from environment variables (plus an optional `.env`
/// file read by the binary before this runs). Required fields and missing
/// backend parameters fail fast with an error naming the variable; a config
/// value is never partially initialized.
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Clone, Debug)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub transcoder: TranscoderConfig,
    pub processing: ProcessingConfig,
    pub worker: WorkerConfig,
    pub metrics: MetricsConfig,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub name: String,
    pub log_level: String,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Which queue adapter to build
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueBackend {
    /// Consumer-group stream (Redis)
    RedisStream,
    /// Visibility-timeout queue (SQS)
    Sqs,
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub max_deliveries: u32,
    pub redis: Option<RedisQueueConfig>,
    pub sqs: Option<SqsQueueConfig>,
}

#[derive(Clone, Debug)]
pub struct RedisQueueConfig {
    pub url: String,
    pub stream: String,
    pub group: String,
    pub consumer_prefix: String,
    pub block: Duration,
}

#[derive(Clone, Debug)]
pub struct SqsQueueConfig {
    pub queue_url: String,
    pub region: String,
    pub wait_time: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Webdav,
    S3,
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub webdav: Option<WebdavConfig>,
    pub s3: Option<S3Config>,
}

#[derive(Clone, Debug)]
pub struct WebdavConfig {
    pub base_url: String,
    pub root: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Custom endpoint for S3-compatible stores; enables path-style addressing
    pub endpoint: Option<String>,
    pub key_prefix: String,
}

#[derive(Clone, Debug)]
pub struct TranscoderConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub work_dir: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ProcessingConfig {
    pub width: u32,
    pub height: u32,
    pub clip_secs: f64,
    pub remove_audio: bool,
    pub watermark_text: Option<String>,
    /// None disables the per-task bound
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub pool_size: u32,
    pub shutdown_grace: Duration,
}

#[derive(Clone, Debug)]
pub struct MetricsConfig {
    pub listen_addr: String,
}

impl Config {
    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(&|key: &str| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn load(vars: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let app = AppConfig {
            name: lookup(vars, "APP_NAME").unwrap_or_else(|| "video-worker".to_string()),
            log_level: lookup(vars, "LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        };

        let database = DatabaseConfig {
            url: required(vars, "DATABASE_URL")?,
            max_connections: parse(vars, "DATABASE_MAX_CONNECTIONS", 10u32)?,
        };

        let queue = load_queue(vars)?;
        let storage = load_storage(vars)?;

        let transcoder = TranscoderConfig {
            ffmpeg_path: lookup(vars, "FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
            ffprobe_path: lookup(vars, "FFPROBE_PATH").unwrap_or_else(|| "ffprobe".to_string()),
            work_dir: lookup(vars, "WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
        };

        let timeout_secs = parse(vars, "PROCESSING_TIMEOUT_SECS", 0u64)?;
        let processing = ProcessingConfig {
            width: parse(vars, "TARGET_WIDTH", 1280u32)?,
            height: parse(vars, "TARGET_HEIGHT", 720u32)?,
            clip_secs: parse(vars, "CLIP_SECONDS", 30.0f64)?,
            remove_audio: parse_bool(vars, "REMOVE_AUDIO", true),
            watermark_text: lookup(vars, "WATERMARK_TEXT"),
            timeout: match timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        };

        let pool_size = parse(vars, "WORKER_POOL_SIZE", 4i64)?;
        let worker = WorkerConfig {
            pool_size: if pool_size <= 0 { 1 } else { pool_size as u32 },
            shutdown_grace: Duration::from_secs(parse(vars, "SHUTDOWN_GRACE_SECS", 30u64)?),
        };

        let metrics = MetricsConfig {
            listen_addr: lookup(vars, "METRICS_ADDR").unwrap_or_else(|| "0.0.0.0:9090".to_string()),
        };

        Ok(Self {
            app,
            database,
            queue,
            storage,
            transcoder,
            processing,
            worker,
            metrics,
        })
    }
}

fn load_queue(vars: &impl Fn(&str) -> Option<String>) -> Result<QueueConfig, ConfigError> {
    let backend = match lookup(vars, "QUEUE_BACKEND").as_deref() {
        None | Some("redis") => QueueBackend::RedisStream,
        Some("sqs") => QueueBackend::Sqs,
        Some(other) => {
            return Err(ConfigError::Invalid(
                "QUEUE_BACKEND".to_string(),
                other.to_string(),
            ))
        }
    };

    let max_deliveries = parse(vars, "QUEUE_MAX_DELIVERIES", 3u32)?.max(1);

    let redis = match backend {
        QueueBackend::RedisStream => Some(RedisQueueConfig {
            url: required(vars, "REDIS_URL")?,
            stream: lookup(vars, "QUEUE_STREAM").unwrap_or_else(|| "video-tasks".to_string()),
            group: lookup(vars, "QUEUE_GROUP").unwrap_or_else(|| "video-workers".to_string()),
            consumer_prefix: lookup(vars, "QUEUE_CONSUMER_PREFIX")
                .unwrap_or_else(|| "worker".to_string()),
            block: Duration::from_millis(parse(vars, "QUEUE_BLOCK_MS", 5_000u64)?),
        }),
        QueueBackend::Sqs => None,
    };

    let sqs = match backend {
        QueueBackend::Sqs => Some(SqsQueueConfig {
            queue_url: required(vars, "SQS_QUEUE_URL")?,
            region: lookup(vars, "AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            wait_time: Duration::from_secs(parse(vars, "SQS_WAIT_TIME_SECONDS", 10u64)?),
        }),
        QueueBackend::RedisStream => None,
    };

    Ok(QueueConfig {
        backend,
        max_deliveries,
        redis,
        sqs,
    })
}

fn load_storage(vars: &impl Fn(&str) -> Option<String>) -> Result<StorageConfig, ConfigError> {
    let backend = match required(vars, "STORAGE_BACKEND")?.as_str() {
        "webdav" => StorageBackend::Webdav,
        "s3" => StorageBackend::S3,
        other => {
            return Err(ConfigError::Invalid(
                "STORAGE_BACKEND".to_string(),
                other.to_string(),
            ))
        }
    };

    let webdav = match backend {
        StorageBackend::Webdav => Some(WebdavConfig {
            base_url: required(vars, "WEBDAV_BASE_URL")?,
            root: required(vars, "WEBDAV_ROOT")?,
            username: required(vars, "WEBDAV_USERNAME")?,
            password: required(vars, "WEBDAV_PASSWORD")?,
        }),
        StorageBackend::S3 => None,
    };

    let s3 = match backend {
        StorageBackend::S3 => Some(S3Config {
            bucket: required(vars, "S3_BUCKET")?,
            region: lookup(vars, "S3_REGION")
                .or_else(|| lookup(vars, "AWS_REGION"))
                .unwrap_or_else(|| "us-east-1".to_string()),
            access_key_id: lookup(vars, "AWS_ACCESS_KEY_ID"),
            secret_access_key: lookup(vars, "AWS_SECRET_ACCESS_KEY"),
            endpoint: lookup(vars, "S3_ENDPOINT"),
            key_prefix: lookup(vars, "S3_KEY_PREFIX").unwrap_or_default(),
        }),
        StorageBackend::Webdav => None,
    };

    Ok(StorageConfig {
        backend,
        webdav,
        s3,
    })
}

fn lookup(vars: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    vars(name).filter(|value| !value.is_empty())
}

fn required(vars: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String, ConfigError> {
    lookup(vars, name).ok_or_else(|| ConfigError::Missing(name.to_string()))
}

fn parse<T: FromStr>(
    vars: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(vars, name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid(name.to_string(), raw)),
        None => Ok(default),
    }
}

fn parse_bool(vars: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    match lookup(vars, name) {
        Some(value) => value == "1" || value.eq_ignore_ascii_case("true"),
        None => default,
    }
}

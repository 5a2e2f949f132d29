//! Concurrent video-processing worker
//!
//! Consumes processing tasks from a message queue, pulls the raw upload
//! from object storage, runs it through the ffmpeg pipeline (clip, resize,
//! curtains, watermark, audio strip), publishes the processed rendition and
//! commits the video row, then acknowledges the task. Queue and storage
//! backends are pluggable capability interfaces selected at startup.

pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod services;
pub mod worker;

pub use config::Config;
pub use error::{Result, WorkerError};

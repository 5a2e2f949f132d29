//! One-shot transcode of a local file
//!
//! Runs the same engine the worker uses against a single input and writes
//! the rendition next to it, without touching broker, storage or database.
//! Useful for smoke-testing an ffmpeg install.

use std::path::PathBuf;

use anyhow::{bail, Context};
use bytes::Bytes;
use video_worker::config::TranscoderConfig;
use video_worker::services::transcoder::{FfmpegTranscoder, TranscodeOptions, Transcoder};

fn parse_input() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--input" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let Some(input) = parse_input() else {
        bail!("usage: transcode-once --input <path>");
    };

    let config = TranscoderConfig {
        ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
        ffprobe_path: std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()),
        work_dir: std::env::temp_dir(),
    };
    let transcoder = FfmpegTranscoder::new(config);

    let data = tokio::fs::read(&input)
        .await
        .with_context(|| format!("failed to read {}", input.display()))?;

    let options = TranscodeOptions {
        width: 1280,
        height: 720,
        format: "mp4".to_string(),
        clip_secs: 30.0,
        remove_audio: true,
        watermark: None,
    };

    let artifact = transcoder
        .process(Bytes::from(data), &options)
        .await
        .context("transcode failed")?;

    let output = input.with_extension("processed.mp4");
    tokio::fs::copy(artifact.path(), &output)
        .await
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("wrote {}", output.display());
    Ok(())
}

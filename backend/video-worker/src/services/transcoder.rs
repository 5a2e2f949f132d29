/// Transcoding engine
///
/// Drives an external ffmpeg/ffprobe pair to turn a raw upload into the
/// published rendition: a solid-color opening curtain, the content scaled
/// and padded to the target resolution and trimmed to the clip length, a
/// closing curtain, and an optional text watermark. The whole transform is
/// expressed as a single consolidated filter graph so ffmpeg runs once per
/// task.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::TranscoderConfig;
use crate::error::TranscodeError;

/// Curtain length prepended and appended to every clip
pub const CURTAIN_SECS: f64 = 2.5;

/// Clip length used when neither the request nor the probe yields one
pub const FALLBACK_CLIP_SECS: f64 = 30.0;

const DEFAULT_FRAME_RATE: &str = "30";

/// Corner the watermark is anchored to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

/// Watermark request; unset fields are filled by `resolve`
#[derive(Clone, Debug, Default)]
pub struct Watermark {
    pub text: Option<String>,
    pub font: Option<String>,
    pub font_size: Option<u32>,
    pub color: Option<String>,
    pub border_width: Option<u32>,
    pub border_color: Option<String>,
    pub position: Option<Corner>,
    pub margin_x: Option<i32>,
    pub margin_y: Option<i32>,
    /// Seconds the watermark stays visible at the start of the content
    pub start_secs: Option<f64>,
    /// Seconds the watermark stays visible at the end of the content
    pub end_secs: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct ResolvedWatermark {
    pub text: String,
    pub font: String,
    pub font_size: u32,
    pub color: String,
    pub border_width: u32,
    pub border_color: String,
    pub position: Corner,
    pub margin_x: u32,
    pub margin_y: u32,
    pub start_secs: f64,
    pub end_secs: f64,
}

impl Watermark {
    pub fn resolve(&self, clip_secs: f64) -> ResolvedWatermark {
        let default_window = clip_secs.max(0.5).min(3.0);
        ResolvedWatermark {
            text: self.text.clone().unwrap_or_else(|| "Watermark".to_string()),
            font: self.font.clone().unwrap_or_else(|| "Sans".to_string()),
            font_size: self.font_size.unwrap_or(48),
            color: self.color.clone().unwrap_or_else(|| "white".to_string()),
            border_width: self.border_width.unwrap_or(0),
            border_color: self
                .border_color
                .clone()
                .unwrap_or_else(|| "black".to_string()),
            position: self.position.unwrap_or(Corner::BottomRight),
            margin_x: self.margin_x.unwrap_or(24).max(0) as u32,
            margin_y: self.margin_y.unwrap_or(24).max(0) as u32,
            start_secs: self.start_secs.unwrap_or(default_window),
            end_secs: self.end_secs.unwrap_or(default_window),
        }
    }
}

/// Per-task transform parameters
#[derive(Clone, Debug)]
pub struct TranscodeOptions {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub clip_secs: f64,
    pub remove_audio: bool,
    pub watermark: Option<Watermark>,
}

/// Owning handle over a produced temp file; dropping it deletes the path
/// (and its scratch directory when one was created for the job).
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
    cleanup_dir: Option<PathBuf>,
}

impl TempFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cleanup_dir: None,
        }
    }

    pub fn with_cleanup_dir(path: PathBuf, dir: PathBuf) -> Self {
        Self {
            path,
            cleanup_dir: Some(dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        match &self.cleanup_dir {
            Some(dir) => {
                let _ = std::fs::remove_dir_all(dir);
            }
            None => {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }
}

/// The transient processed artifact, owned by the use case for one
/// iteration
#[derive(Debug)]
pub struct ProcessedVideo {
    file: TempFile,
    pub format: String,
    pub duration_secs: f64,
    pub metadata: HashMap<String, String>,
}

impl ProcessedVideo {
    pub fn new(file: TempFile, format: String, duration_secs: f64) -> Self {
        Self {
            file,
            format,
            duration_secs,
            metadata: HashMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub async fn read(&self) -> std::io::Result<Bytes> {
        Ok(Bytes::from(tokio::fs::read(self.path()).await?))
    }
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn process(
        &self,
        input: Bytes,
        options: &TranscodeOptions,
    ) -> Result<ProcessedVideo, TranscodeError>;
}

pub struct FfmpegTranscoder {
    config: TranscoderConfig,
}

impl FfmpegTranscoder {
    pub fn new(config: TranscoderConfig) -> Self {
        Self { config }
    }

    async fn probe(&self, input: &Path) -> ProbeInfo {
        let result = Command::new(&self.config.ffprobe_path)
            .args(["-v", "error", "-show_format", "-show_streams", "-of", "json"])
            .arg(input)
            .kill_on_drop(true)
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => {
                match parse_probe_output(&String::from_utf8_lossy(&output.stdout)) {
                    Ok(info) => info,
                    Err(err) => {
                        warn!(error = %err, "unable to parse probe output, using defaults");
                        ProbeInfo::default()
                    }
                }
            }
            Ok(output) => {
                warn!(
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "probe failed, using defaults"
                );
                ProbeInfo::default()
            }
            Err(err) => {
                warn!(error = %err, "probe could not start, using defaults");
                ProbeInfo::default()
            }
        }
    }

    async fn run(
        &self,
        work_dir: &Path,
        input: Bytes,
        options: &TranscodeOptions,
    ) -> Result<ProcessedVideo, TranscodeError> {
        let input_path = work_dir.join("input");
        tokio::fs::write(&input_path, &input).await?;

        let probe = self.probe(&input_path).await;
        let frame_rate = probe
            .frame_rate
            .clone()
            .unwrap_or_else(|| DEFAULT_FRAME_RATE.to_string());
        let clip_secs = effective_clip_secs(options.clip_secs, probe.duration_secs);
        let watermark = options.watermark.as_ref().map(|w| w.resolve(clip_secs));
        let with_audio = !options.remove_audio && probe.has_audio;

        let graph = build_filter_graph(
            options,
            watermark.as_ref(),
            clip_secs,
            &frame_rate,
            with_audio,
        );
        let total_secs = clip_secs + 2.0 * CURTAIN_SECS;
        let output_path = work_dir.join(format!("output.{}", options.format));

        debug!(
            clip_secs,
            frame_rate = %frame_rate,
            with_audio,
            "running transcode"
        );

        let mut cmd = Command::new(&self.config.ffmpeg_path);
        cmd.arg("-y")
            .arg("-i")
            .arg(&input_path)
            .arg("-filter_complex")
            .arg(&graph)
            .arg("-map")
            .arg("[vout]");
        if with_audio {
            cmd.arg("-map").arg("[aout]").arg("-c:a").arg("aac");
        } else {
            cmd.arg("-an");
        }
        cmd.arg("-c:v")
            .arg("libx264")
            .arg("-preset")
            .arg("veryfast")
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg("-movflags")
            .arg("+faststart")
            .arg("-t")
            .arg(format!("{total_secs}"))
            .arg(&output_path)
            .kill_on_drop(true);

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(TranscodeError::CommandFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let file = TempFile::with_cleanup_dir(output_path, work_dir.to_path_buf());
        let mut artifact = ProcessedVideo::new(file, options.format.clone(), total_secs);
        artifact
            .metadata
            .insert("clip_seconds".to_string(), format!("{clip_secs}"));
        artifact
            .metadata
            .insert("frame_rate".to_string(), frame_rate);
        Ok(artifact)
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn process(
        &self,
        input: Bytes,
        options: &TranscodeOptions,
    ) -> Result<ProcessedVideo, TranscodeError> {
        let work_dir = self
            .config
            .work_dir
            .join(format!("transcode-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&work_dir).await?;

        let result = self.run(&work_dir, input, options).await;
        if result.is_err() {
            let _ = tokio::fs::remove_dir_all(&work_dir).await;
        }
        result
    }
}

#[derive(Clone, Debug, Default)]
struct ProbeInfo {
    frame_rate: Option<String>,
    duration_secs: Option<f64>,
    has_audio: bool,
}

fn parse_probe_output(json: &str) -> Result<ProbeInfo, serde_json::Error> {
    let value: Value = serde_json::from_str(json)?;
    let mut info = ProbeInfo::default();

    if let Some(streams) = value["streams"].as_array() {
        for stream in streams {
            match stream["codec_type"].as_str() {
                Some("video") if info.frame_rate.is_none() => {
                    info.frame_rate = stream["r_frame_rate"]
                        .as_str()
                        .filter(|rate| !rate.is_empty() && *rate != "0/0")
                        .map(str::to_string);
                }
                Some("audio") => info.has_audio = true,
                _ => {}
            }
        }
    }

    if let Some(duration) = value["format"]["duration"].as_str() {
        info.duration_secs = duration.parse::<f64>().ok();
    }

    Ok(info)
}

/// Clamp the requested clip length to what the source actually holds.
fn effective_clip_secs(requested: f64, probed: Option<f64>) -> f64 {
    let clip = match probed {
        Some(duration) if duration > 0.0 => requested.min(duration),
        _ => requested,
    };
    if clip > 0.0 {
        clip
    } else {
        FALLBACK_CLIP_SECS
    }
}

fn escape_drawtext(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "")
}

/// One drawtext filter stage. With `window`, the text is enabled only during
/// the first `start` seconds and from `end_trigger` on; without it the text
/// covers the whole segment.
fn drawtext(watermark: &ResolvedWatermark, window: Option<(f64, f64)>) -> String {
    let x = match watermark.position {
        Corner::TopLeft | Corner::BottomLeft => watermark.margin_x.to_string(),
        Corner::TopRight | Corner::BottomRight => format!("w-tw-{}", watermark.margin_x),
    };
    let y = match watermark.position {
        Corner::TopLeft | Corner::TopRight => watermark.margin_y.to_string(),
        Corner::BottomLeft | Corner::BottomRight => format!("h-th-{}", watermark.margin_y),
    };

    let mut filter = format!(
        "drawtext=text='{}':font='{}':fontsize={}:fontcolor={}:borderw={}:bordercolor={}:x={}:y={}",
        escape_drawtext(&watermark.text),
        watermark.font,
        watermark.font_size,
        watermark.color,
        watermark.border_width,
        watermark.border_color,
        x,
        y,
    );
    if let Some((start, end_trigger)) = window {
        filter.push_str(&format!(":enable='lt(t,{start})+gte(t,{end_trigger})'"));
    }
    filter
}

/// Assemble the consolidated filter graph: opening curtain, content,
/// closing curtain, concatenated into one stream of identical resolution,
/// pixel format and frame rate.
fn build_filter_graph(
    options: &TranscodeOptions,
    watermark: Option<&ResolvedWatermark>,
    clip_secs: f64,
    frame_rate: &str,
    with_audio: bool,
) -> String {
    let width = options.width;
    let height = options.height;

    let curtain_draw = watermark
        .map(|w| format!(",{}", drawtext(w, None)))
        .unwrap_or_default();
    let content_draw = watermark
        .map(|w| {
            let end_trigger = (clip_secs - w.end_secs).max(0.0);
            format!(",{}", drawtext(w, Some((w.start_secs, end_trigger))))
        })
        .unwrap_or_default();

    let mut parts = vec![
        format!(
            "color=c=black:s={width}x{height}:r={frame_rate}:d={CURTAIN_SECS},\
             format=yuv420p{curtain_draw}[vopen]"
        ),
        format!(
            "[0:v]scale=w={width}:h={height}:force_original_aspect_ratio=decrease,\
             pad={width}:{height}:(ow-iw)/2:(oh-ih)/2,setsar=1,format=yuv420p,\
             fps={frame_rate},trim=duration={clip_secs},setpts=PTS-STARTPTS{content_draw}[vmain]"
        ),
        format!(
            "color=c=black:s={width}x{height}:r={frame_rate}:d={CURTAIN_SECS},\
             format=yuv420p{curtain_draw}[vclose]"
        ),
    ];

    if with_audio {
        parts.push(format!(
            "anullsrc=channel_layout=stereo:sample_rate=44100:d={CURTAIN_SECS}[aopen]"
        ));
        parts.push(format!(
            "[0:a]atrim=duration={clip_secs},asetpts=PTS-STARTPTS[amain]"
        ));
        parts.push(format!(
            "anullsrc=channel_layout=stereo:sample_rate=44100:d={CURTAIN_SECS}[aclose]"
        ));
        parts.push(
            "[vopen][aopen][vmain][amain][vclose][aclose]concat=n=3:v=1:a=1[vout][aout]"
                .to_string(),
        );
    } else {
        parts.push("[vopen][vmain][vclose]concat=n=3:v=1:a=0[vout]".to_string());
    }

    parts.join(";")
}

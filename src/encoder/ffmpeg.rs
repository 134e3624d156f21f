//! `ffmpeg`/`ffprobe` backed [`Encoder`].

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{Encoder, EncoderError, VideoProbe};

/// Encoder that shells out to local `ffmpeg` and `ffprobe` binaries.
///
/// Binary locations default to `ffmpeg`/`ffprobe` on `PATH` and can be
/// overridden with `FFMPEG_PATH` and `FFPROBE_PATH`.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::from_env()
    }
}

impl FfmpegEncoder {
    /// Uses explicit binary paths.
    #[must_use]
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Resolves binaries from `FFMPEG_PATH`/`FFPROBE_PATH`, falling back to `PATH`.
    #[must_use]
    pub fn from_env() -> Self {
        let ffmpeg = std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string());
        let ffprobe = std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string());
        Self::new(ffmpeg, ffprobe)
    }

    async fn run_ffmpeg<I, S>(&self, args: I) -> Result<Vec<u8>, EncoderError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        run(&self.ffmpeg, args).await
    }
}

async fn run<I, S>(program: &Path, args: I) -> Result<Vec<u8>, EncoderError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let name = program.display().to_string();
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| EncoderError::Spawn {
            program: name.clone(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EncoderError::Failed {
            program: name,
            status: output.status.to_string(),
            stderr: tail(&stderr, 400),
        });
    }

    Ok(output.stdout)
}

/// Keeps the last `max` bytes of encoder chatter, on a char boundary.
fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    #[instrument(skip(self), fields(input = %input.display()))]
    async fn normalize_video(&self, input: &Path, output: &Path) -> Result<(), EncoderError> {
        self.run_ffmpeg([
            OsStr::new("-y"),
            OsStr::new("-v"),
            OsStr::new("error"),
            OsStr::new("-i"),
            input.as_os_str(),
            OsStr::new("-c:v"),
            OsStr::new("libx264"),
            OsStr::new("-preset"),
            OsStr::new("veryfast"),
            OsStr::new("-pix_fmt"),
            OsStr::new("yuv420p"),
            OsStr::new("-c:a"),
            OsStr::new("aac"),
            OsStr::new("-movflags"),
            OsStr::new("+faststart"),
            OsStr::new("-f"),
            OsStr::new("mp4"),
            output.as_os_str(),
        ])
        .await?;
        debug!(output = %output.display(), "video normalized");
        Ok(())
    }

    #[instrument(skip(self), fields(input = %input.display()))]
    async fn extract_thumbnail(&self, input: &Path, output: &Path) -> Result<(), EncoderError> {
        self.run_ffmpeg([
            OsStr::new("-y"),
            OsStr::new("-v"),
            OsStr::new("error"),
            OsStr::new("-ss"),
            OsStr::new("1"),
            OsStr::new("-i"),
            input.as_os_str(),
            OsStr::new("-frames:v"),
            OsStr::new("1"),
            OsStr::new("-vf"),
            OsStr::new("scale=320:-2"),
            OsStr::new("-f"),
            OsStr::new("image2"),
            output.as_os_str(),
        ])
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(input = %input.display()))]
    async fn probe(&self, input: &Path) -> Result<VideoProbe, EncoderError> {
        let stdout = run(
            &self.ffprobe,
            [
                OsStr::new("-v"),
                OsStr::new("error"),
                OsStr::new("-select_streams"),
                OsStr::new("v:0"),
                OsStr::new("-show_entries"),
                OsStr::new("stream=width,height:format=duration"),
                OsStr::new("-of"),
                OsStr::new("json"),
                input.as_os_str(),
            ],
        )
        .await?;
        parse_probe_output(&stdout)
    }

    #[instrument(skip(self), fields(video = %video.display(), audio = %audio.display()))]
    async fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), EncoderError> {
        self.run_ffmpeg([
            OsStr::new("-y"),
            OsStr::new("-v"),
            OsStr::new("error"),
            OsStr::new("-i"),
            video.as_os_str(),
            OsStr::new("-i"),
            audio.as_os_str(),
            OsStr::new("-map"),
            OsStr::new("0:v:0"),
            OsStr::new("-map"),
            OsStr::new("1:a:0"),
            OsStr::new("-c"),
            OsStr::new("copy"),
            OsStr::new("-movflags"),
            OsStr::new("+faststart"),
            OsStr::new("-f"),
            OsStr::new("mp4"),
            output.as_os_str(),
        ])
        .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_probe_output(stdout: &[u8]) -> Result<VideoProbe, EncoderError> {
    let parsed: ProbeOutput =
        serde_json::from_slice(stdout).map_err(|e| EncoderError::Probe(e.to_string()))?;

    let stream = parsed.streams.first();
    let duration_secs = parsed
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .map(|d| d.round() as u32);

    Ok(VideoProbe {
        duration_secs,
        width: stream.and_then(|s| s.width),
        height: stream.and_then(|s| s.height),
    })
}

//! External media encoder used for muxing and relay preparation.
//!
//! The harvester never decodes media itself. Everything that touches container
//! formats goes through the [`Encoder`] trait, whose production implementation
//! ([`FfmpegEncoder`]) shells out to `ffmpeg` and `ffprobe`.

mod ffmpeg;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

pub use ffmpeg::FfmpegEncoder;

/// Stream properties reported by [`Encoder::probe`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoProbe {
    /// Duration rounded to whole seconds.
    pub duration_secs: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Errors raised by encoder invocations.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// The encoder binary could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Binary that failed to start.
        program: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The encoder ran but exited unsuccessfully.
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        /// Binary that failed.
        program: String,
        /// Exit status description.
        status: String,
        /// Trimmed standard error output.
        stderr: String,
    },

    /// The probe output could not be interpreted.
    #[error("unreadable probe output: {0}")]
    Probe(String),
}

/// Operations the harvester delegates to an external encoder.
///
/// All paths are local files. Implementations write `output` in place and
/// leave cleanup of failed outputs to the caller.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Re-encodes `input` into a streaming-friendly MP4 at `output`.
    async fn normalize_video(&self, input: &Path, output: &Path) -> Result<(), EncoderError>;

    /// Writes a single-frame JPEG preview of `input` to `output`.
    async fn extract_thumbnail(&self, input: &Path, output: &Path) -> Result<(), EncoderError>;

    /// Reads duration and dimensions of the first video stream.
    async fn probe(&self, input: &Path) -> Result<VideoProbe, EncoderError>;

    /// Combines a video-only and an audio-only stream into one MP4 at `output`
    /// without re-encoding.
    async fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), EncoderError>;
}

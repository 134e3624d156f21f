//! Remote channel that relayed files are sent to.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::download::{
    DownloadError, FailureType, HttpClient, Retryable, parse_retry_after,
};
use crate::encoder::VideoProbe;

/// Public Bot API root.
pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org/";

/// Pause assumed when the channel signals flood control without a duration.
const DEFAULT_FLOOD_WAIT: Duration = Duration::from_secs(5);

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "webm"];
const ANIMATION_EXTENSIONS: &[&str] = &["gif"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "wav"];
const VOICE_EXTENSIONS: &[&str] = &["ogg"];

/// How a file is presented by the channel, decided by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaCategory {
    Video,
    Image,
    Animation,
    Audio,
    Voice,
    /// Sent as a plain document.
    Other,
}

impl MediaCategory {
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return Self::Other;
        };
        let ext = ext.to_ascii_lowercase();
        let ext = ext.as_str();
        if IMAGE_EXTENSIONS.contains(&ext) {
            Self::Image
        } else if VIDEO_EXTENSIONS.contains(&ext) {
            Self::Video
        } else if ANIMATION_EXTENSIONS.contains(&ext) {
            Self::Animation
        } else if AUDIO_EXTENSIONS.contains(&ext) {
            Self::Audio
        } else if VOICE_EXTENSIONS.contains(&ext) {
            Self::Voice
        } else {
            Self::Other
        }
    }

    /// Bot API method and its file field.
    fn endpoint(self) -> (&'static str, &'static str) {
        match self {
            Self::Image => ("sendPhoto", "photo"),
            Self::Video => ("sendVideo", "video"),
            Self::Animation => ("sendAnimation", "animation"),
            Self::Audio => ("sendAudio", "audio"),
            Self::Voice => ("sendVoice", "voice"),
            Self::Other => ("sendDocument", "document"),
        }
    }
}

/// A file ready to be sent, with whatever preparation succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMedia {
    /// File whose bytes are uploaded. May be a normalized copy of the original.
    pub path: PathBuf,
    /// Original file name, used as the caption.
    pub name: String,
    pub category: MediaCategory,
    pub probe: Option<VideoProbe>,
    pub thumbnail: Option<PathBuf>,
}

impl OutgoingMedia {
    /// Wraps a file with its category derived from `name`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            path: path.into(),
            category: MediaCategory::from_path(Path::new(&name)),
            name,
            probe: None,
            thumbnail: None,
        }
    }
}

/// Errors returned by a [`Channel`].
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel asked every sender to pause.
    #[error("flood control: retry after {}s", retry_after.as_secs())]
    RateLimited {
        /// Requested pause.
        retry_after: Duration,
    },

    /// Failure that may not repeat (network error, 5xx).
    #[error("transient channel failure: {0}")]
    Transient(String),

    /// The channel rejected the upload.
    #[error("channel rejected upload: {0}")]
    Permanent(String),
}

impl Retryable for ChannelError {
    fn failure_type(&self) -> FailureType {
        match self {
            Self::RateLimited { .. } => FailureType::RateLimited,
            Self::Transient(_) => FailureType::Transient,
            Self::Permanent(_) => FailureType::Permanent,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            Self::Transient(_) | Self::Permanent(_) => None,
        }
    }
}

/// Destination for relayed files.
///
/// Uses `async_trait` so channels can be shared as `Arc<dyn Channel>`.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Sends one file. Must not retry internally.
    async fn send(&self, media: &OutgoingMedia) -> Result<(), ChannelError>;
}

/// Telegram Bot API channel using multipart uploads.
#[derive(Clone)]
pub struct TelegramChannel {
    client: reqwest::Client,
    api_url: Url,
    token: String,
    chat_id: String,
}

impl TelegramChannel {
    /// Creates a channel posting to `chat_id` through the API at `api_url`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidUrl`] if `api_url` is not absolute.
    pub fn new(
        client: &HttpClient,
        api_url: &str,
        token: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> Result<Self, DownloadError> {
        let normalized = if api_url.ends_with('/') {
            api_url.to_string()
        } else {
            format!("{api_url}/")
        };
        let api_url = Url::parse(&normalized).map_err(|_| DownloadError::invalid_url(api_url))?;
        Ok(Self {
            client: client.inner().clone(),
            api_url,
            token: token.into(),
            chat_id: chat_id.into(),
        })
    }

    /// `{api_url}/bot{token}/{method}`. Built segment by segment: a token
    /// contains `:` and would otherwise parse as a URL scheme.
    fn method_url(&self, method: &str) -> Result<Url, ChannelError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|()| ChannelError::Permanent(format!("bad endpoint for {method}")))?
            .pop_if_empty()
            .push(&format!("bot{}", self.token))
            .push(method);
        Ok(url)
    }

    async fn form(&self, media: &OutgoingMedia, field: &str) -> Result<Form, ChannelError> {
        let mut form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", media.name.clone())
            .part(field.to_string(), file_part(&media.path, &media.name).await?);

        if media.category == MediaCategory::Video {
            form = form.text("supports_streaming", "true");
            if let Some(probe) = media.probe {
                if let Some(duration) = probe.duration_secs {
                    form = form.text("duration", duration.to_string());
                }
                if let Some(width) = probe.width {
                    form = form.text("width", width.to_string());
                }
                if let Some(height) = probe.height {
                    form = form.text("height", height.to_string());
                }
            }
            if let Some(thumbnail) = &media.thumbnail {
                form = form.part("thumbnail", file_part(thumbnail, "thumbnail.jpg").await?);
            }
        }
        Ok(form)
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    #[instrument(skip(self, media), fields(file = %media.name, category = ?media.category))]
    async fn send(&self, media: &OutgoingMedia) -> Result<(), ChannelError> {
        let (method, field) = media.category.endpoint();
        let url = self.method_url(method)?;
        let form = self.form(media, field).await?;

        let response = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChannelError::Transient(e.without_url().to_string()))?;

        let status = response.status().as_u16();
        let header_retry = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body: Option<Value> = response.json().await.ok();
        debug!(status, "channel responded");

        interpret_response(status, header_retry, body.as_ref())
    }
}

impl fmt::Debug for TelegramChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramChannel")
            .field("api_url", &self.api_url.as_str())
            .field("chat_id", &self.chat_id)
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

async fn file_part(path: &Path, name: &str) -> Result<Part, ChannelError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ChannelError::Permanent(format!("cannot open {}: {e}", path.display())))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| ChannelError::Permanent(format!("cannot stat {}: {e}", path.display())))?
        .len();
    Ok(Part::stream_with_length(file, len).file_name(name.to_string()))
}

/// Maps a Bot API reply onto the channel error model.
fn interpret_response(
    status: u16,
    header_retry: Option<Duration>,
    body: Option<&Value>,
) -> Result<(), ChannelError> {
    let ok = body.and_then(|b| b.get("ok")).and_then(Value::as_bool);
    if (200..300).contains(&status) && ok != Some(false) {
        return Ok(());
    }

    let body_retry = body
        .and_then(|b| b.get("parameters"))
        .and_then(|p| p.get("retry_after"))
        .and_then(Value::as_u64)
        .map(Duration::from_secs);
    if status == 429 || body_retry.is_some() {
        return Err(ChannelError::RateLimited {
            retry_after: body_retry.or(header_retry).unwrap_or(DEFAULT_FLOOD_WAIT),
        });
    }

    let description = body
        .and_then(|b| b.get("description"))
        .and_then(Value::as_str)
        .map_or_else(|| format!("HTTP {status}"), |d| format!("HTTP {status}: {d}"));
    if status >= 500 {
        Err(ChannelError::Transient(description))
    } else {
        Err(ChannelError::Permanent(description))
    }
}

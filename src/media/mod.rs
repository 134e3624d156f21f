//! Media classification and acquisition task planning.
//!
//! [`classify`] is a pure function from an [`ItemDescriptor`] to a
//! [`MediaKind`]. [`MediaResolver`] turns that kind into zero or more
//! [`AcquisitionTask`]s, calling out to a [`ProviderResolver`] only for items
//! hosted on a known third-party domain.
//!
//! Target names are deterministic so the destination directory doubles as a
//! record of what has been fetched:
//!
//! | Kind | Name |
//! |------|------|
//! | direct | `{c}-{id}-{ts}{ext}` |
//! | hosted video | `{c}-{id}-{ts}.mp4` |
//! | gallery part | `{c}-{id}-{ts}_gallery_{i}{ext}` |
//! | provider | `{c}-{id}-{ts}-{provider}{ext}`, `_{i}` appended for `i > 0` |

mod error;
mod provider;
mod resolver;

use serde_json::Value;
use url::Url;

use crate::source::ItemDescriptor;

pub use error::ResolveError;
pub use provider::{
    DEFAULT_REDGIFS_API_URL, ProviderRegistry, ProviderResolver, RedgifsResolver,
};
pub use resolver::MediaResolver;

/// File extensions accepted for direct links.
const DIRECT_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".mp4", ".webm"];

/// Platform image host whose links default to JPEG.
const PLATFORM_IMAGE_HOST: &str = "i.redd.it";

/// Audio rendition published next to every hosted DASH video.
const DASH_AUDIO_FILE: &str = "DASH_AUDIO_128.mp4";

/// Extension used when nothing better is known.
const FALLBACK_EXTENSION: &str = ".jpg";

/// Timestamp layout used in target names.
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// One sub-item of a gallery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryEntry {
    /// Position in the gallery (0-based), used in the target name.
    pub index: usize,
    pub url: String,
    pub extension: String,
}

/// Coarse media classification of an item. First match wins, in declaration
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaKind {
    /// Multi-image post. Only valid sub-items are listed.
    Gallery(Vec<GalleryEntry>),
    /// Platform-hosted video with a separate audio stream.
    HostedVideoDash { video_url: String, audio_url: String },
    /// Platform-hosted video without audio.
    HostedVideo { video_url: String },
    /// Link to a known third-party host; needs a provider lookup.
    Provider { provider: String, opaque_id: String },
    /// Link straight to a media file.
    Direct { url: String, extension: String },
    /// Nothing acquirable.
    Unsupported,
}

/// How an acquisition task's payload is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Direct,
    GalleryPart,
    HostedVideo,
    /// Video at the task URL plus a separate audio stream, muxed after download.
    HostedVideoDash { audio_url: String },
    ProviderResolved { provider: String },
}

/// One file to fetch for an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionTask {
    pub item_id: String,
    /// 0-based position of this task within its item.
    pub sequence_index: usize,
    pub source_url: String,
    /// File name inside the destination directory.
    pub target_name: String,
    pub kind: TaskKind,
}

/// Classifies an item by inspecting its raw record.
///
/// Crossposts are classified by their parent's media fields. The function
/// performs no I/O; `providers` is consulted only for domain matching.
#[must_use]
pub fn classify(descriptor: &ItemDescriptor, providers: &ProviderRegistry) -> MediaKind {
    let media = media_record(&descriptor.raw);

    if let Some(entries) = gallery_entries(media) {
        return MediaKind::Gallery(entries);
    }

    if let Some((video_url, has_audio)) = hosted_video(media) {
        if has_audio && let Some(audio_url) = dash_audio_url(&video_url) {
            return MediaKind::HostedVideoDash {
                video_url,
                audio_url,
            };
        }
        return MediaKind::HostedVideo { video_url };
    }

    let link = media
        .get("url")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .unwrap_or(&descriptor.source_url);
    let Ok(parsed) = Url::parse(link) else {
        return MediaKind::Unsupported;
    };

    if let Some(host) = parsed.host_str()
        && let Some(provider) = providers.find(host)
        && let Some(opaque_id) = provider.extract_id(&parsed)
    {
        return MediaKind::Provider {
            provider: provider.name().to_string(),
            opaque_id,
        };
    }

    if let Some(extension) = url_extension(&parsed) {
        return MediaKind::Direct {
            url: link.to_string(),
            extension,
        };
    }
    if parsed.host_str() == Some(PLATFORM_IMAGE_HOST) {
        return MediaKind::Direct {
            url: link.to_string(),
            extension: FALLBACK_EXTENSION.to_string(),
        };
    }

    MediaKind::Unsupported
}

/// Returns true if the item is a link post whose media [`classify`] recognises.
///
/// Used as a listing prefilter so text posts never count towards a source's limit.
#[must_use]
pub fn is_media_item(descriptor: &ItemDescriptor, providers: &ProviderRegistry) -> bool {
    let is_self = descriptor
        .raw
        .get("is_self")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    !is_self && classify(descriptor, providers) != MediaKind::Unsupported
}

/// Returns the record whose media fields describe the item: the first
/// crosspost parent if present, otherwise the item itself.
fn media_record(raw: &Value) -> &Value {
    raw.get("crosspost_parent_list")
        .and_then(Value::as_array)
        .and_then(|parents| parents.first())
        .filter(|parent| parent.is_object())
        .unwrap_or(raw)
}

fn gallery_entries(media: &Value) -> Option<Vec<GalleryEntry>> {
    let items = media
        .get("gallery_data")
        .and_then(|g| g.get("items"))
        .and_then(Value::as_array);
    let is_gallery = media
        .get("is_gallery")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if items.is_none() && !is_gallery {
        return None;
    }

    let metadata = media.get("media_metadata");
    let entries = items
        .into_iter()
        .flatten()
        .enumerate()
        .filter_map(|(index, item)| {
            let media_id = item.get("media_id")?.as_str()?;
            let meta = metadata?.get(media_id)?;
            if meta.get("status").and_then(Value::as_str) != Some("valid") {
                return None;
            }
            let source = meta.get("s")?;
            let url = ["u", "gif", "mp4"]
                .iter()
                .find_map(|key| source.get(*key).and_then(Value::as_str))
                .filter(|url| !url.is_empty())?
                .replace("&amp;", "&");
            let parsed = Url::parse(&url).ok()?;
            let extension = url_extension(&parsed)
                .or_else(|| mime_extension(meta.get("m").and_then(Value::as_str)?))
                .unwrap_or_else(|| FALLBACK_EXTENSION.to_string());
            Some(GalleryEntry {
                index,
                url,
                extension,
            })
        })
        .collect();
    Some(entries)
}

/// Returns the hosted video fallback URL and whether it carries separate audio.
fn hosted_video(media: &Value) -> Option<(String, bool)> {
    let video = ["secure_media", "media"]
        .iter()
        .find_map(|key| media.get(*key)?.get("reddit_video"))?;
    let url = video
        .get("fallback_url")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())?;
    let has_audio = video
        .get("has_audio")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Some((url.to_string(), has_audio))
}

/// Derives the audio rendition URL that sits next to a DASH video file.
fn dash_audio_url(video_url: &str) -> Option<String> {
    let mut url = Url::parse(video_url).ok()?;
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut().ok()?.pop().push(DASH_AUDIO_FILE);
    Some(url.to_string())
}

/// Extension of the URL path if it is one of the direct media extensions.
fn url_extension(url: &Url) -> Option<String> {
    let name = url.path_segments()?.next_back()?;
    let (_, ext) = name.rsplit_once('.')?;
    let ext = format!(".{}", ext.to_ascii_lowercase());
    DIRECT_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

fn mime_extension(mime: &str) -> Option<String> {
    let ext = match mime.to_ascii_lowercase().as_str() {
        "image/jpg" | "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        _ => return None,
    };
    Some(ext.to_string())
}

/// Replaces characters that are unsafe in file names and strips leading dots.
#[must_use]
pub fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `{collection}-{id}-{YYYYMMDD_HHMMSS}` prefix shared by every target of an item.
#[must_use]
pub fn target_stem(descriptor: &ItemDescriptor) -> String {
    format!(
        "{}-{}-{}",
        sanitize_component(&descriptor.collection),
        sanitize_component(&descriptor.id),
        descriptor.created_at.format(TIMESTAMP_FORMAT)
    )
}

/// Plans tasks for every kind that needs no network lookup.
///
/// Returns `None` for [`MediaKind::Provider`], whose URLs are only known after
/// the provider has been queried.
#[must_use]
pub fn plan_tasks(descriptor: &ItemDescriptor, kind: &MediaKind) -> Option<Vec<AcquisitionTask>> {
    let stem = target_stem(descriptor);
    let task = |sequence_index: usize, url: &str, target_name: String, kind: TaskKind| {
        AcquisitionTask {
            item_id: descriptor.id.clone(),
            sequence_index,
            source_url: url.to_string(),
            target_name,
            kind,
        }
    };

    let tasks = match kind {
        MediaKind::Gallery(entries) => entries
            .iter()
            .map(|entry| {
                task(
                    entry.index,
                    &entry.url,
                    format!("{stem}_gallery_{}{}", entry.index, entry.extension),
                    TaskKind::GalleryPart,
                )
            })
            .collect(),
        MediaKind::HostedVideoDash {
            video_url,
            audio_url,
        } => vec![task(
            0,
            video_url,
            format!("{stem}.mp4"),
            TaskKind::HostedVideoDash {
                audio_url: audio_url.clone(),
            },
        )],
        MediaKind::HostedVideo { video_url } => {
            vec![task(0, video_url, format!("{stem}.mp4"), TaskKind::HostedVideo)]
        }
        MediaKind::Direct { url, extension } => {
            vec![task(0, url, format!("{stem}{extension}"), TaskKind::Direct)]
        }
        MediaKind::Unsupported => Vec::new(),
        MediaKind::Provider { .. } => return None,
    };
    Some(tasks)
}

/// Plans tasks for URLs returned by a provider lookup.
#[must_use]
pub fn plan_provider_tasks(
    descriptor: &ItemDescriptor,
    provider: &str,
    default_extension: &str,
    urls: &[String],
) -> Vec<AcquisitionTask> {
    let stem = target_stem(descriptor);
    let provider_component = sanitize_component(provider);
    urls.iter()
        .enumerate()
        .map(|(index, url)| {
            let extension = Url::parse(url)
                .ok()
                .and_then(|parsed| url_extension(&parsed))
                .unwrap_or_else(|| default_extension.to_string());
            let suffix = if index == 0 {
                String::new()
            } else {
                format!("_{index}")
            };
            AcquisitionTask {
                item_id: descriptor.id.clone(),
                sequence_index: index,
                source_url: url.clone(),
                target_name: format!("{stem}-{provider_component}{suffix}{extension}"),
                kind: TaskKind::ProviderResolved {
                    provider: provider.to_string(),
                },
            }
        })
        .collect()
}

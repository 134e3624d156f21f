//! Execution of a single admitted acquisition task.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::{AcquisitionStats, TaskOutcome};
use crate::download::constants::PART_SUFFIX;
use crate::download::retry::{RetryPolicy, retry_with_policy};
use crate::download::{DownloadError, HttpClient, TargetRegistry};
use crate::encoder::Encoder;
use crate::media::{AcquisitionTask, TaskKind};

/// Everything a spawned task needs, cloned out of the engine.
pub(super) struct TaskContext {
    pub(super) client: HttpClient,
    pub(super) retry_policy: RetryPolicy,
    pub(super) registry: Arc<TargetRegistry>,
    pub(super) encoder: Option<Arc<dyn Encoder>>,
    pub(super) stats: Arc<AcquisitionStats>,
}

/// Removes temporary files when dropped.
struct PartFiles(Vec<PathBuf>);

impl Drop for PartFiles {
    fn drop(&mut self) {
        for path in &self.0 {
            // Already renamed or never created.
            let _ = std::fs::remove_file(path);
        }
    }
}

/// `{target}{suffix}` next to the target.
fn sibling(target: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

#[instrument(skip(ctx, task), fields(item_id = %task.item_id, target = %task.target_name))]
pub(super) async fn execute(ctx: &TaskContext, task: &AcquisitionTask) -> TaskOutcome {
    let target = ctx.registry.dir().join(&task.target_name);

    let outcome = match &task.kind {
        TaskKind::HostedVideoDash { audio_url } => {
            fetch_dash(ctx, &task.source_url, audio_url, &target).await
        }
        TaskKind::Direct
        | TaskKind::GalleryPart
        | TaskKind::HostedVideo
        | TaskKind::ProviderResolved { .. } => fetch_single(ctx, &task.source_url, &target).await,
    };

    match &outcome {
        TaskOutcome::Written { bytes } => info!(bytes, "acquired"),
        TaskOutcome::Failed { reason, attempts } => {
            warn!(url = %task.source_url, attempts, %reason, "acquisition failed");
        }
        TaskOutcome::Skipped | TaskOutcome::Cancelled => {}
    }
    outcome
}

async fn fetch_single(ctx: &TaskContext, url: &str, target: &Path) -> TaskOutcome {
    let part = sibling(target, PART_SUFFIX);
    let _cleanup = PartFiles(vec![part.clone()]);

    match download(ctx, url, &part).await {
        Ok((bytes, attempts)) => match promote(&part, target).await {
            Ok(()) => TaskOutcome::Written { bytes },
            Err(e) => failed(&e, attempts),
        },
        Err((e, attempts)) => failed(&e, attempts),
    }
}

/// Fetches video and audio separately and muxes them into the target.
///
/// When the audio stream or the mux is unavailable the video stream alone is
/// kept, since the item is still useful without sound.
async fn fetch_dash(ctx: &TaskContext, video_url: &str, audio_url: &str, target: &Path) -> TaskOutcome {
    let video_part = sibling(target, ".video.part");
    let audio_part = sibling(target, ".audio.part");
    let mux_part = sibling(target, ".mux.part");
    let _cleanup = PartFiles(vec![video_part.clone(), audio_part.clone(), mux_part.clone()]);

    let (video_bytes, attempts) = match download(ctx, video_url, &video_part).await {
        Ok(done) => done,
        Err((e, attempts)) => return failed(&e, attempts),
    };

    let audio = download(ctx, audio_url, &audio_part).await;
    let muxed = match (&audio, ctx.encoder.as_deref()) {
        (Ok(_), Some(encoder)) => match encoder.mux(&video_part, &audio_part, &mux_part).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "mux failed, keeping video stream only");
                false
            }
        },
        (Ok(_), None) => {
            warn!("no encoder configured, keeping video stream only");
            false
        }
        (Err((e, _)), _) => {
            warn!(error = %e, "audio stream unavailable, keeping video stream only");
            false
        }
    };

    let source = if muxed { &mux_part } else { &video_part };
    if let Err(e) = promote(source, target).await {
        return failed(&e, attempts);
    }

    if muxed {
        match tokio::fs::metadata(target).await {
            Ok(meta) => TaskOutcome::Written { bytes: meta.len() },
            Err(e) => failed(&DownloadError::io(target, e), attempts),
        }
    } else {
        TaskOutcome::Written { bytes: video_bytes }
    }
}

/// Downloads `url` into `part` under the retry policy.
///
/// Returns the byte count and the attempts used.
async fn download(
    ctx: &TaskContext,
    url: &str,
    part: &Path,
) -> Result<(u64, u32), (DownloadError, u32)> {
    let mut attempts = 0;
    let result = retry_with_policy(&ctx.retry_policy, |attempt| {
        attempts = attempt;
        if attempt > 1 {
            ctx.stats.increment_retried();
        }
        ctx.client.download_to_path(url, part)
    })
    .await;
    result.map(|bytes| (bytes, attempts))
}

async fn promote(part: &Path, target: &Path) -> Result<(), DownloadError> {
    tokio::fs::rename(part, target)
        .await
        .map_err(|e| DownloadError::io(target, e))
}

fn failed(error: &DownloadError, attempts: u32) -> TaskOutcome {
    TaskOutcome::Failed {
        reason: error.to_string(),
        attempts,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    use super::*;
    use crate::encoder::{EncoderError, VideoProbe};
    use crate::test_support::socket_guard::start_mock_server_or_skip;

    /// Encoder whose mux concatenates its inputs.
    #[derive(Default)]
    struct ConcatEncoder {
        muxed: Mutex<Vec<(PathBuf, PathBuf)>>,
    }

    #[async_trait]
    impl Encoder for ConcatEncoder {
        async fn normalize_video(&self, _: &Path, _: &Path) -> Result<(), EncoderError> {
            Ok(())
        }

        async fn extract_thumbnail(&self, _: &Path, _: &Path) -> Result<(), EncoderError> {
            Ok(())
        }

        async fn probe(&self, _: &Path) -> Result<VideoProbe, EncoderError> {
            Ok(VideoProbe::default())
        }

        async fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), EncoderError> {
            self.muxed
                .lock()
                .unwrap()
                .push((video.to_path_buf(), audio.to_path_buf()));
            let mut bytes = std::fs::read(video).unwrap();
            bytes.extend(std::fs::read(audio).unwrap());
            std::fs::write(output, bytes).unwrap();
            Ok(())
        }
    }

    async fn context(dir: &Path, encoder: Option<Arc<dyn Encoder>>) -> TaskContext {
        TaskContext {
            client: HttpClient::new().unwrap(),
            retry_policy: RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1), 2.0)
                .jitter(Duration::ZERO),
            registry: Arc::new(TargetRegistry::from_directory(dir).await.unwrap()),
            encoder,
            stats: Arc::new(AcquisitionStats::new()),
        }
    }

    #[test]
    fn test_sibling_appends_suffix() {
        assert_eq!(
            sibling(Path::new("/d/a.mp4"), ".video.part"),
            PathBuf::from("/d/a.mp4.video.part")
        );
    }

    #[tokio::test]
    async fn test_dash_muxes_and_cleans_parts() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/v/DASH_720.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"VIDEO".to_vec()))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v/DASH_AUDIO_128.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"AUDIO".to_vec()))
            .mount(&mock_server)
            .await;

        let dir = TempDir::new().unwrap();
        let encoder = Arc::new(ConcatEncoder::default());
        let ctx = context(dir.path(), Some(Arc::clone(&encoder) as Arc<dyn Encoder>)).await;
        let target = dir.path().join("clip.mp4");

        let outcome = fetch_dash(
            &ctx,
            &format!("{}/v/DASH_720.mp4", mock_server.uri()),
            &format!("{}/v/DASH_AUDIO_128.mp4", mock_server.uri()),
            &target,
        )
        .await;

        assert_eq!(outcome, TaskOutcome::Written { bytes: 10 });
        assert_eq!(std::fs::read(&target).unwrap(), b"VIDEOAUDIO");
        assert_eq!(encoder.muxed.lock().unwrap().len(), 1);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![OsString::from("clip.mp4")]);
    }

    #[tokio::test]
    async fn test_dash_without_audio_keeps_video() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/v/DASH_720.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"VIDEO".to_vec()))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v/DASH_AUDIO_128.mp4"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&mock_server)
            .await;

        let dir = TempDir::new().unwrap();
        let encoder = Arc::new(ConcatEncoder::default());
        let ctx = context(dir.path(), Some(Arc::clone(&encoder) as Arc<dyn Encoder>)).await;
        let target = dir.path().join("clip.mp4");

        let outcome = fetch_dash(
            &ctx,
            &format!("{}/v/DASH_720.mp4", mock_server.uri()),
            &format!("{}/v/DASH_AUDIO_128.mp4", mock_server.uri()),
            &target,
        )
        .await;

        assert_eq!(outcome, TaskOutcome::Written { bytes: 5 });
        assert_eq!(std::fs::read(&target).unwrap(), b"VIDEO");
        assert!(encoder.muxed.lock().unwrap().is_empty());
        assert!(!sibling(&target, ".audio.part").exists());
    }

    #[tokio::test]
    async fn test_single_counts_retries() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&mock_server)
            .await;

        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), None).await;
        let outcome = fetch_single(
            &ctx,
            &format!("{}/a.jpg", mock_server.uri()),
            &dir.path().join("a.jpg"),
        )
        .await;

        assert!(matches!(outcome, TaskOutcome::Failed { attempts: 2, .. }));
        assert_eq!(ctx.stats.retried(), 1);
    }
}

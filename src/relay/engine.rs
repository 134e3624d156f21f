//! Relay engine: fingerprint, deduplicate, prepare, and send files.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashSet;
use futures_util::future::select_all;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

use super::channel::{Channel, ChannelError, MediaCategory, OutgoingMedia};
use super::fingerprint::fingerprint;
use super::flood_gate::FloodGate;
use super::scanner::{NORMALIZED_MARKER, ScannedFile, THUMBNAIL_MARKER};
use crate::download::{RetryDecision, RetryPolicy, Retryable};
use crate::encoder::Encoder;
use crate::ledger::{Ledger, LedgerError};

/// Minimum allowed relay concurrency.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed relay concurrency. Channels serialize uploads per chat, so
/// more senders only produce more flood-control signals.
const MAX_CONCURRENCY: usize = 10;

/// Default number of concurrent senders.
pub const DEFAULT_RELAY_CONCURRENCY: usize = 2;

const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors that abort a relay run.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(
        "invalid relay concurrency {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency { value: usize },

    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,

    #[error("no channel to relay through")]
    NoChannels,

    /// The ledger could not be read or written; the run stops admitting files.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Final state of one scanned file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Sent,
    /// Same content was already relayed, or is being relayed by another sender.
    Skipped,
    Failed { reason: String, attempts: u32 },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEntry {
    pub name: String,
    pub outcome: RelayOutcome,
}

/// Per-file outcomes of a relay run, in scan order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub entries: Vec<RelayEntry>,
}

impl RelayReport {
    fn count(&self, pred: impl Fn(&RelayOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }

    #[must_use]
    pub fn sent(&self) -> usize {
        self.count(|o| matches!(o, RelayOutcome::Sent))
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, RelayOutcome::Skipped))
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, RelayOutcome::Failed { .. }))
    }

    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.count(|o| matches!(o, RelayOutcome::Cancelled))
    }
}

/// Sends scanned files through one or more [`Channel`]s with bounded
/// concurrency.
///
/// Each channel gets its own `concurrency` senders and takes the next file as
/// soon as one is free. Every sender, on every channel, waits on the shared
/// [`FloodGate`] before each send. A fingerprint is recorded in the ledger
/// only after its send succeeded.
pub struct RelayEngine {
    concurrency: usize,
    retry_policy: RetryPolicy,
    flood_gate: Arc<FloodGate>,
    ledger: Ledger,
    encoder: Option<Arc<dyn Encoder>>,
}

impl RelayEngine {
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConcurrency`] if `concurrency` is outside 1-10.
    pub fn new(concurrency: usize, retry_policy: RetryPolicy, ledger: Ledger) -> Result<Self, RelayError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(RelayError::InvalidConcurrency { value: concurrency });
        }
        Ok(Self {
            concurrency,
            retry_policy,
            flood_gate: Arc::new(FloodGate::new()),
            ledger,
            encoder: None,
        })
    }

    /// Shares an existing flood gate, e.g. with another engine on the same channel.
    #[must_use]
    pub fn with_flood_gate(mut self, flood_gate: Arc<FloodGate>) -> Self {
        self.flood_gate = flood_gate;
        self
    }

    /// Enables video preparation (normalize, thumbnail, probe).
    #[must_use]
    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    #[must_use]
    pub fn flood_gate(&self) -> &Arc<FloodGate> {
        &self.flood_gate
    }

    /// Relays `files` through a single channel. See [`RelayEngine::relay_across`].
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Ledger`] if the ledger fails, after in-flight
    /// sends have settled.
    pub async fn relay(
        &self,
        files: Vec<ScannedFile>,
        channel: Arc<dyn Channel>,
        interrupted: &Arc<AtomicBool>,
    ) -> Result<RelayReport, RelayError> {
        self.relay_across(files, &[channel], interrupted).await
    }

    /// Relays `files` across `channels` and returns one entry per file.
    ///
    /// Send failures are per file and never abort the run. Once `interrupted`
    /// is set no further file is admitted, and senders paused by flood control
    /// give up their file as cancelled; sends already on the wire finish.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NoChannels`] if `channels` is empty and
    /// [`RelayError::Ledger`] if the ledger fails, after in-flight sends have
    /// settled.
    #[instrument(skip_all, fields(files = files.len(), channels = channels.len(), concurrency = self.concurrency))]
    pub async fn relay_across(
        &self,
        files: Vec<ScannedFile>,
        channels: &[Arc<dyn Channel>],
        interrupted: &Arc<AtomicBool>,
    ) -> Result<RelayReport, RelayError> {
        if channels.is_empty() {
            return Err(RelayError::NoChannels);
        }
        let lanes: Vec<Lane> = channels
            .iter()
            .map(|channel| Lane {
                channel: Arc::clone(channel),
                semaphore: Arc::new(Semaphore::new(self.concurrency)),
            })
            .collect();

        let claims: Arc<DashSet<String>> = Arc::new(DashSet::new());
        let ledger_failed = Arc::new(AtomicBool::new(false));
        let mut entries: Vec<(usize, RelayEntry)> = Vec::with_capacity(files.len());
        let mut handles = Vec::new();

        for (position, file) in files.into_iter().enumerate() {
            if ledger_failed.load(Ordering::SeqCst) {
                break;
            }
            if interrupted.load(Ordering::SeqCst) {
                entries.push((position, entry(&file, RelayOutcome::Cancelled)));
                continue;
            }

            let (permit, lane) = tokio::select! {
                biased;
                () = wait_for_interrupt(interrupted) => {
                    entries.push((position, entry(&file, RelayOutcome::Cancelled)));
                    continue;
                }
                admitted = next_free_lane(&lanes) => admitted?,
            };

            let sender = Sender {
                channel: Arc::clone(&lanes[lane].channel),
                lane,
                ledger: self.ledger.clone(),
                flood_gate: Arc::clone(&self.flood_gate),
                encoder: self.encoder.clone(),
                retry_policy: self.retry_policy.clone(),
                claims: Arc::clone(&claims),
                interrupted: Arc::clone(interrupted),
            };
            let ledger_failed = Arc::clone(&ledger_failed);
            let name = file.name.clone();
            handles.push((
                position,
                name,
                tokio::spawn(async move {
                    let _permit = permit;
                    let result = sender.relay_one(&file).await;
                    if result.is_err() {
                        ledger_failed.store(true, Ordering::SeqCst);
                    }
                    result
                }),
            ));
        }

        let mut ledger_error = None;
        for (position, name, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    warn!(file = %name, error = %e, "ledger failure during relay");
                    ledger_error.get_or_insert(e);
                    continue;
                }
                Err(e) => {
                    warn!(file = %name, error = %e, "relay task panicked");
                    RelayOutcome::Failed {
                        reason: format!("task aborted: {e}"),
                        attempts: 0,
                    }
                }
            };
            entries.push((position, RelayEntry { name, outcome }));
        }

        if let Some(e) = ledger_error {
            return Err(e.into());
        }

        entries.sort_by_key(|(position, _)| *position);
        let report = RelayReport {
            entries: entries.into_iter().map(|(_, e)| e).collect(),
        };
        info!(
            sent = report.sent(),
            skipped = report.skipped(),
            failed = report.failed(),
            cancelled = report.cancelled(),
            "relay run complete"
        );
        Ok(report)
    }
}

impl fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayEngine")
            .field("concurrency", &self.concurrency)
            .field("retry_policy", &self.retry_policy)
            .field("has_encoder", &self.encoder.is_some())
            .finish_non_exhaustive()
    }
}

fn entry(file: &ScannedFile, outcome: RelayOutcome) -> RelayEntry {
    RelayEntry {
        name: file.name.clone(),
        outcome,
    }
}

/// One channel and the permits of its senders.
struct Lane {
    channel: Arc<dyn Channel>,
    semaphore: Arc<Semaphore>,
}

/// Waits for a free sender on any lane, preferring lower indices when several
/// are free.
async fn next_free_lane(lanes: &[Lane]) -> Result<(OwnedSemaphorePermit, usize), RelayError> {
    let waiting = lanes
        .iter()
        .map(|lane| Box::pin(Arc::clone(&lane.semaphore).acquire_owned()));
    let (permit, lane, _) = select_all(waiting).await;
    Ok((permit.map_err(|_| RelayError::SemaphoreClosed)?, lane))
}

async fn wait_for_interrupt(interrupted: &AtomicBool) {
    while !interrupted.load(Ordering::SeqCst) {
        tokio::time::sleep(INTERRUPT_POLL_INTERVAL).await;
    }
}

/// Removes relay preparation files when dropped.
#[derive(Default)]
struct TempArtifacts(Vec<PathBuf>);

impl TempArtifacts {
    fn track(&mut self, path: PathBuf) -> PathBuf {
        self.0.push(path.clone());
        path
    }
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        for path in &self.0 {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// State one spawned sender works with.
struct Sender {
    channel: Arc<dyn Channel>,
    /// Index of the channel, for logs.
    lane: usize,
    ledger: Ledger,
    flood_gate: Arc<FloodGate>,
    encoder: Option<Arc<dyn Encoder>>,
    retry_policy: RetryPolicy,
    claims: Arc<DashSet<String>>,
    interrupted: Arc<AtomicBool>,
}

/// Why a send gave up.
enum SendFailure {
    Channel { error: ChannelError, attempts: u32 },
    /// Interrupted while paused by flood control.
    Interrupted,
}

impl Sender {
    #[instrument(skip(self, file), fields(file = %file.name, lane = self.lane))]
    async fn relay_one(&self, file: &ScannedFile) -> Result<RelayOutcome, LedgerError> {
        let hash = match fingerprint(&file.path).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(error = %e, "cannot fingerprint file");
                return Ok(RelayOutcome::Failed {
                    reason: format!("fingerprint failed: {e}"),
                    attempts: 0,
                });
            }
        };

        if self.ledger.is_relayed(&hash).await? {
            debug!(%hash, "already relayed");
            return Ok(RelayOutcome::Skipped);
        }
        if !self.claims.insert(hash.clone()) {
            debug!(%hash, "same content is being relayed by another sender");
            return Ok(RelayOutcome::Skipped);
        }

        let mut artifacts = TempArtifacts::default();
        let media = self.prepare(file, &mut artifacts).await;

        match self.send_with_retry(&media).await {
            Ok(attempts) => {
                info!(attempts, "relayed");
                self.ledger.record_hash(&hash, &file.name).await?;
                Ok(RelayOutcome::Sent)
            }
            Err(SendFailure::Channel { error, attempts }) => {
                warn!(attempts, error = %error, "relay failed");
                self.claims.remove(&hash);
                Ok(RelayOutcome::Failed {
                    reason: error.to_string(),
                    attempts,
                })
            }
            Err(SendFailure::Interrupted) => {
                debug!("interrupted while paused by flood control");
                self.claims.remove(&hash);
                Ok(RelayOutcome::Cancelled)
            }
        }
    }

    /// Runs the encoder sub-steps for videos. Each step is optional: a failure
    /// leaves the corresponding field unset.
    async fn prepare(&self, file: &ScannedFile, artifacts: &mut TempArtifacts) -> OutgoingMedia {
        let mut media = OutgoingMedia::new(&file.path, &file.name);
        let Some(encoder) = self.encoder.as_deref() else {
            return media;
        };
        if media.category != MediaCategory::Video {
            return media;
        }

        let dir = file.path.parent().unwrap_or_else(|| Path::new("."));
        let stem = file
            .path
            .file_stem()
            .map_or_else(|| file.name.clone(), |s| s.to_string_lossy().into_owned());

        if !is_mp4(&file.path) {
            let normalized = artifacts.track(dir.join(format!("{stem}{NORMALIZED_MARKER}mp4")));
            match encoder.normalize_video(&file.path, &normalized).await {
                Ok(()) => media.path = normalized,
                Err(e) => warn!(error = %e, "normalize failed, sending original container"),
            }
        }

        let thumbnail = artifacts.track(dir.join(format!("{stem}{THUMBNAIL_MARKER}jpg")));
        match encoder.extract_thumbnail(&media.path, &thumbnail).await {
            Ok(()) => media.thumbnail = Some(thumbnail),
            Err(e) => warn!(error = %e, "thumbnail extraction failed"),
        }

        match encoder.probe(&media.path).await {
            Ok(probe) => media.probe = Some(probe),
            Err(e) => warn!(error = %e, "probe failed"),
        }

        media
    }

    /// Sends under the retry policy, waiting on the flood gate before each
    /// attempt. A rate-limit signal extends the gate for every sender and
    /// consumes one attempt.
    async fn send_with_retry(&self, media: &OutgoingMedia) -> Result<u32, SendFailure> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            tokio::select! {
                biased;
                () = self.flood_gate.wait() => {}
                () = wait_for_interrupt(&self.interrupted) => return Err(SendFailure::Interrupted),
            }

            let error = match self.channel.send(media).await {
                Ok(()) => return Ok(attempt),
                Err(e) => e,
            };

            if let Some(retry_after) = error.retry_after() {
                self.flood_gate.extend(retry_after).await;
            }

            match self.retry_policy.should_retry(error.failure_type(), attempt) {
                RetryDecision::Retry { delay, .. } => {
                    if error.retry_after().is_none() {
                        debug!(attempt, delay_ms = delay.as_millis(), error = %error, "retrying send");
                        tokio::time::sleep(delay).await;
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(%reason, attempts = attempt, "not retrying send");
                    return Err(SendFailure::Channel {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

fn is_mp4(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("mp4"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::db::Database;
    use crate::encoder::{EncoderError, VideoProbe};
    use crate::relay::scan;

    /// Channel answering from a script, then succeeding.
    #[derive(Default)]
    struct ScriptedChannel {
        script: Mutex<VecDeque<ChannelError>>,
        sent: Mutex<Vec<OutgoingMedia>>,
        attempts: Mutex<u32>,
    }

    impl ScriptedChannel {
        fn with_script(errors: Vec<ChannelError>) -> Self {
            Self {
                script: Mutex::new(errors.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Channel for ScriptedChannel {
        async fn send(&self, media: &OutgoingMedia) -> Result<(), ChannelError> {
            *self.attempts.lock().unwrap() += 1;
            if let Some(error) = self.script.lock().unwrap().pop_front() {
                return Err(error);
            }
            self.sent.lock().unwrap().push(media.clone());
            Ok(())
        }
    }

    /// Encoder that writes marker files and reports a fixed probe.
    struct StubEncoder {
        fail_thumbnail: bool,
    }

    #[async_trait]
    impl Encoder for StubEncoder {
        async fn normalize_video(&self, _input: &Path, output: &Path) -> Result<(), EncoderError> {
            std::fs::write(output, b"normalized").unwrap();
            Ok(())
        }

        async fn extract_thumbnail(&self, _input: &Path, output: &Path) -> Result<(), EncoderError> {
            if self.fail_thumbnail {
                return Err(EncoderError::Probe("no frames".to_string()));
            }
            std::fs::write(output, b"thumb").unwrap();
            Ok(())
        }

        async fn probe(&self, _input: &Path) -> Result<VideoProbe, EncoderError> {
            Ok(VideoProbe {
                duration_secs: Some(9),
                width: Some(1280),
                height: Some(720),
            })
        }

        async fn mux(&self, _: &Path, _: &Path, _: &Path) -> Result<(), EncoderError> {
            Ok(())
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(2), 2.0)
            .jitter(Duration::ZERO)
    }

    async fn ledger() -> Ledger {
        Ledger::new(Database::new_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_engine_rejects_bad_concurrency() {
        let ledger = ledger().await;
        assert!(matches!(
            RelayEngine::new(0, RetryPolicy::default(), ledger.clone()),
            Err(RelayError::InvalidConcurrency { value: 0 })
        ));
        assert!(RelayEngine::new(11, RetryPolicy::default(), ledger.clone()).is_err());
        assert_eq!(
            RelayEngine::new(DEFAULT_RELAY_CONCURRENCY, RetryPolicy::default(), ledger)
                .unwrap()
                .concurrency(),
            2
        );
    }

    #[tokio::test]
    async fn test_relay_records_hash_after_send() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"one").unwrap();
        let ledger = ledger().await;
        let engine = RelayEngine::new(1, fast_policy(0), ledger.clone()).unwrap();
        let channel = Arc::new(ScriptedChannel::default());

        let report = engine
            .relay(
                scan(dir.path()).await.unwrap(),
                Arc::clone(&channel) as Arc<dyn Channel>,
                &Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();

        assert_eq!(report.sent(), 1);
        assert_eq!(ledger.count_hashes().await.unwrap(), 1);
        assert_eq!(channel.sent.lock().unwrap()[0].name, "a.jpg");
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_recorded_and_run_continues() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"one").unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"two").unwrap();
        let ledger = ledger().await;
        let engine = RelayEngine::new(1, fast_policy(3), ledger.clone()).unwrap();
        let channel = Arc::new(ScriptedChannel::with_script(vec![ChannelError::Permanent(
            "file too big".to_string(),
        )]));

        let report = engine
            .relay(
                scan(dir.path()).await.unwrap(),
                Arc::clone(&channel) as Arc<dyn Channel>,
                &Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();

        assert_eq!(
            report.entries[0].outcome,
            RelayOutcome::Failed {
                reason: "channel rejected upload: file too big".to_string(),
                attempts: 1
            }
        );
        assert_eq!(report.entries[1].outcome, RelayOutcome::Sent);
        assert_eq!(ledger.count_hashes().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_share_retry_budget() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"one").unwrap();
        let engine = RelayEngine::new(1, fast_policy(2), ledger().await).unwrap();
        let channel = Arc::new(ScriptedChannel::with_script(vec![
            ChannelError::Transient("502".to_string()),
            ChannelError::RateLimited {
                retry_after: Duration::from_millis(20),
            },
            ChannelError::Transient("502".to_string()),
        ]));

        let report = engine
            .relay(
                scan(dir.path()).await.unwrap(),
                Arc::clone(&channel) as Arc<dyn Channel>,
                &Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();

        assert!(matches!(
            report.entries[0].outcome,
            RelayOutcome::Failed { attempts: 3, .. }
        ));
        assert_eq!(*channel.attempts.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_video_preparation_and_artifact_cleanup() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("clip.mkv"), b"matroska").unwrap();
        let engine = RelayEngine::new(1, fast_policy(0), ledger().await)
            .unwrap()
            .with_encoder(Arc::new(StubEncoder {
                fail_thumbnail: false,
            }));
        let channel = Arc::new(ScriptedChannel::default());

        engine
            .relay(
                scan(dir.path()).await.unwrap(),
                Arc::clone(&channel) as Arc<dyn Channel>,
                &Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();

        let sent = channel.sent.lock().unwrap()[0].clone();
        assert_eq!(sent.name, "clip.mkv");
        assert!(sent.path.to_string_lossy().ends_with("clip.relay-tmp.mp4"));
        assert!(sent.thumbnail.is_some());
        assert_eq!(sent.probe.unwrap().width, Some(1280));

        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(remaining, vec!["clip.mkv".to_string()]);
    }

    #[tokio::test]
    async fn test_encoder_substep_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"mp4").unwrap();
        let engine = RelayEngine::new(1, fast_policy(0), ledger().await)
            .unwrap()
            .with_encoder(Arc::new(StubEncoder {
                fail_thumbnail: true,
            }));
        let channel = Arc::new(ScriptedChannel::default());

        let report = engine
            .relay(
                scan(dir.path()).await.unwrap(),
                Arc::clone(&channel) as Arc<dyn Channel>,
                &Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();

        assert_eq!(report.sent(), 1);
        let sent = channel.sent.lock().unwrap()[0].clone();
        assert_eq!(sent.path, dir.path().join("clip.mp4"));
        assert!(sent.thumbnail.is_none());
        assert!(sent.probe.is_some());
    }

    #[tokio::test]
    async fn test_interrupted_relay_cancels_all() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"one").unwrap();
        let engine = RelayEngine::new(1, fast_policy(0), ledger().await).unwrap();
        let channel = Arc::new(ScriptedChannel::default());

        let report = engine
            .relay(
                scan(dir.path()).await.unwrap(),
                Arc::clone(&channel) as Arc<dyn Channel>,
                &Arc::new(AtomicBool::new(true)),
            )
            .await
            .unwrap();

        assert_eq!(report.cancelled(), 1);
        assert!(channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_during_flood_pause_cancels_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"one").unwrap();
        let ledger = ledger().await;
        let engine = RelayEngine::new(1, fast_policy(3), ledger.clone()).unwrap();
        engine.flood_gate().extend(Duration::from_secs(3600)).await;
        let channel = Arc::new(ScriptedChannel::default());
        let interrupted = Arc::new(AtomicBool::new(false));
        {
            let interrupted = Arc::clone(&interrupted);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                interrupted.store(true, Ordering::SeqCst);
            });
        }

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            engine.relay(
                scan(dir.path()).await.unwrap(),
                Arc::clone(&channel) as Arc<dyn Channel>,
                &interrupted,
            ),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(report.cancelled(), 1);
        assert_eq!(*channel.attempts.lock().unwrap(), 0);
        assert_eq!(ledger.count_hashes().await.unwrap(), 0);
    }

    // ==================== Multi-Channel Tests ====================

    #[tokio::test]
    async fn test_relay_across_uses_every_channel() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"one").unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"two").unwrap();
        let ledger = ledger().await;
        let engine = RelayEngine::new(1, fast_policy(0), ledger.clone()).unwrap();
        let first = Arc::new(ScriptedChannel::default());
        let second = Arc::new(ScriptedChannel::default());
        let channels = [
            Arc::clone(&first) as Arc<dyn Channel>,
            Arc::clone(&second) as Arc<dyn Channel>,
        ];

        let report = engine
            .relay_across(
                scan(dir.path()).await.unwrap(),
                &channels,
                &Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();

        assert_eq!(report.sent(), 2);
        assert_eq!(first.sent.lock().unwrap()[0].name, "a.jpg");
        assert_eq!(second.sent.lock().unwrap()[0].name, "b.jpg");
        assert_eq!(ledger.count_hashes().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_relay_across_requires_a_channel() {
        let engine = RelayEngine::new(1, fast_policy(0), ledger().await).unwrap();
        let result = engine
            .relay_across(Vec::new(), &[], &Arc::new(AtomicBool::new(false)))
            .await;
        assert!(matches!(result, Err(RelayError::NoChannels)));
    }
}

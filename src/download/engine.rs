//! Acquisition engine: concurrent, bounded-retry downloads of planned tasks.
//!
//! The [`AcquisitionEngine`] takes the [`AcquisitionTask`]s produced by media
//! resolution and writes each payload to the destination directory at most
//! once. Concurrency is bounded by a semaphore whose owned permits travel into
//! each spawned task, so a permit is released on every exit path including
//! panics.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//! use harvester_core::download::{AcquisitionEngine, HttpClient, RetryPolicy, TargetRegistry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(TargetRegistry::from_directory(Path::new("./media")).await?);
//! let engine = AcquisitionEngine::new(10, RetryPolicy::default(), HttpClient::new()?, registry)?;
//! let interrupted = Arc::new(AtomicBool::new(false));
//! let reports = engine.run(Vec::new(), &interrupted).await?;
//! println!("{} reports, peak in flight {}", reports.len(), engine.stats().peak_in_flight());
//! # Ok(())
//! # }
//! ```

mod task;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::retry::RetryPolicy;
use super::{HttpClient, TargetRegistry};
use crate::encoder::Encoder;
use crate::media::AcquisitionTask;

use task::TaskContext;

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 100;

/// Default concurrency if not specified.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// How often a blocked admission re-checks the interrupt flag.
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Error type for acquisition engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// Semaphore was closed unexpectedly.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// Final state of one acquisition task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The payload was written to its target name.
    Written {
        /// Size of the file on disk.
        bytes: u64,
    },
    /// The target name already existed or was claimed; nothing was fetched.
    Skipped,
    /// Every allowed attempt failed.
    Failed {
        /// Last error, rendered for humans.
        reason: String,
        /// Attempts made, including the first.
        attempts: u32,
    },
    /// The run was interrupted before the task was admitted.
    Cancelled,
}

impl TaskOutcome {
    /// Returns true if the target file exists after the task, whether written
    /// now or found in place.
    #[must_use]
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Written { .. } | Self::Skipped)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Outcome of a task together with the identity of the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub item_id: String,
    pub sequence_index: usize,
    pub target_name: String,
    pub outcome: TaskOutcome,
}

impl TaskReport {
    fn new(task: &AcquisitionTask, outcome: TaskOutcome) -> Self {
        Self {
            item_id: task.item_id.clone(),
            sequence_index: task.sequence_index,
            target_name: task.target_name.clone(),
            outcome,
        }
    }
}

/// Counters maintained across [`AcquisitionEngine::run`] calls.
///
/// Updated atomically from concurrent tasks.
#[derive(Debug, Default)]
pub struct AcquisitionStats {
    written: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    retried: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl AcquisitionStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the number of retry attempts made (attempts beyond the first).
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    /// Tasks currently holding an admission permit.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest value `in_flight` has reached.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, outcome: &TaskOutcome) {
        let counter = match outcome {
            TaskOutcome::Written { .. } => &self.written,
            TaskOutcome::Skipped => &self.skipped,
            TaskOutcome::Failed { .. } => &self.failed,
            TaskOutcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard {
            stats: Arc::clone(self),
        }
    }
}

/// Decrements `in_flight` when the task ends, however it ends.
struct InFlightGuard {
    stats: Arc<AcquisitionStats>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Concurrent downloader for acquisition tasks.
///
/// # Concurrency Model
///
/// - Each admitted task runs in its own Tokio task
/// - A semaphore permit is acquired before any network call
/// - Permits are released automatically when tasks complete (RAII)
///
/// # Retry Behavior
///
/// - Transient errors (network issues, 5xx, 429) are retried with exponential backoff
/// - Permanent errors (404, 410) fail immediately without retry
/// - A task is attempted at most `max_retries + 1` times
pub struct AcquisitionEngine {
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    retry_policy: RetryPolicy,
    client: HttpClient,
    registry: Arc<TargetRegistry>,
    encoder: Option<Arc<dyn Encoder>>,
    stats: Arc<AcquisitionStats>,
}

impl AcquisitionEngine {
    /// Creates an engine writing into the registry's directory.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] if the value is outside
    /// the valid range (1-100).
    #[instrument(level = "debug", skip(retry_policy, client, registry))]
    pub fn new(
        concurrency: usize,
        retry_policy: RetryPolicy,
        client: HttpClient,
        registry: Arc<TargetRegistry>,
    ) -> Result<Self, EngineError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(EngineError::InvalidConcurrency { value: concurrency });
        }

        debug!(
            concurrency,
            max_attempts = retry_policy.max_attempts(),
            dir = %registry.dir().display(),
            "creating acquisition engine"
        );

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            retry_policy,
            client,
            registry,
            encoder: None,
            stats: Arc::new(AcquisitionStats::new()),
        })
    }

    /// Sets the encoder used to mux separate video and audio streams.
    ///
    /// Without one, such tasks keep the video stream only.
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
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<AcquisitionStats> {
        &self.stats
    }

    #[must_use]
    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    /// Runs `tasks` and returns one report per task, in input order.
    ///
    /// Individual task failures never fail the run. Once `interrupted` is set
    /// no further task is admitted and the remainder is reported as
    /// [`TaskOutcome::Cancelled`]; tasks already running finish normally.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SemaphoreClosed`] if the admission semaphore is
    /// closed.
    #[instrument(skip(self, tasks, interrupted), fields(tasks = tasks.len()))]
    pub async fn run(
        &self,
        tasks: Vec<AcquisitionTask>,
        interrupted: &Arc<AtomicBool>,
    ) -> Result<Vec<TaskReport>, EngineError> {
        let mut reports: Vec<(usize, TaskReport)> = Vec::with_capacity(tasks.len());
        let mut handles = Vec::new();
        let mut pending = tasks.into_iter().enumerate();

        while let Some((position, task)) = pending.next() {
            if interrupted.load(Ordering::SeqCst) {
                info!("interrupt received, cancelling unadmitted tasks");
                for (position, task) in std::iter::once((position, task)).chain(pending.by_ref()) {
                    reports.push((position, self.finish(&task, TaskOutcome::Cancelled)));
                }
                break;
            }

            if !self.registry.claim(&task.target_name) {
                debug!(target = %task.target_name, "target exists, skipping");
                reports.push((position, self.finish(&task, TaskOutcome::Skipped)));
                continue;
            }

            let permit = tokio::select! {
                biased;
                () = wait_for_interrupt(interrupted) => {
                    self.registry.release(&task.target_name);
                    reports.push((position, self.finish(&task, TaskOutcome::Cancelled)));
                    continue;
                }
                permit = self.semaphore.clone().acquire_owned() => {
                    permit.map_err(|_| EngineError::SemaphoreClosed)?
                }
            };

            let context = self.task_context();
            let meta = task.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let _in_flight = context.stats.enter();

                let outcome = task::execute(&context, &task).await;
                if !matches!(outcome, TaskOutcome::Written { .. }) {
                    context.registry.release(&task.target_name);
                }
                outcome
            });
            handles.push((position, meta, handle));
        }

        debug!(task_count = handles.len(), "waiting for admitted tasks");

        for (position, task, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(target = %task.target_name, error = %e, "acquisition task panicked");
                    self.registry.release(&task.target_name);
                    TaskOutcome::Failed {
                        reason: format!("task aborted: {e}"),
                        attempts: 0,
                    }
                }
            };
            reports.push((position, self.finish(&task, outcome)));
        }

        reports.sort_by_key(|(position, _)| *position);
        info!(
            written = self.stats.written(),
            skipped = self.stats.skipped(),
            failed = self.stats.failed(),
            cancelled = self.stats.cancelled(),
            peak_in_flight = self.stats.peak_in_flight(),
            "acquisition batch complete"
        );
        Ok(reports.into_iter().map(|(_, report)| report).collect())
    }

    fn task_context(&self) -> TaskContext {
        TaskContext {
            client: self.client.clone(),
            retry_policy: self.retry_policy.clone(),
            registry: Arc::clone(&self.registry),
            encoder: self.encoder.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    fn finish(&self, task: &AcquisitionTask, outcome: TaskOutcome) -> TaskReport {
        self.stats.record(&outcome);
        TaskReport::new(task, outcome)
    }
}

impl fmt::Debug for AcquisitionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionEngine")
            .field("concurrency", &self.concurrency)
            .field("retry_policy", &self.retry_policy)
            .field("dir", &self.registry.dir())
            .field("has_encoder", &self.encoder.is_some())
            .finish_non_exhaustive()
    }
}

async fn wait_for_interrupt(interrupted: &AtomicBool) {
    while !interrupted.load(Ordering::SeqCst) {
        tokio::time::sleep(INTERRUPT_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    use super::*;
    use crate::media::TaskKind;
    use crate::test_support::socket_guard::start_mock_server_or_skip;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        )
        .jitter(Duration::ZERO)
    }

    async fn engine_in(dir: &Path, concurrency: usize, max_retries: u32) -> AcquisitionEngine {
        let registry = Arc::new(TargetRegistry::from_directory(dir).await.unwrap());
        AcquisitionEngine::new(
            concurrency,
            fast_policy(max_retries),
            HttpClient::new().unwrap(),
            registry,
        )
        .unwrap()
    }

    fn direct_task(url: String, name: &str) -> AcquisitionTask {
        AcquisitionTask {
            item_id: "abc".to_string(),
            sequence_index: 0,
            source_url: url,
            target_name: name.to_string(),
            kind: TaskKind::Direct,
        }
    }

    // ==================== Construction Tests ====================

    #[tokio::test]
    async fn test_engine_new_concurrency_bounds() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(TargetRegistry::from_directory(dir.path()).await.unwrap());
        let client = HttpClient::new().unwrap();

        for valid in [1, DEFAULT_CONCURRENCY, 100] {
            let engine =
                AcquisitionEngine::new(valid, RetryPolicy::default(), client.clone(), Arc::clone(&registry))
                    .unwrap();
            assert_eq!(engine.concurrency(), valid);
        }
        for invalid in [0, 101] {
            let result =
                AcquisitionEngine::new(invalid, RetryPolicy::default(), client.clone(), Arc::clone(&registry));
            assert!(matches!(
                result,
                Err(EngineError::InvalidConcurrency { value }) if value == invalid
            ));
        }
    }

    #[test]
    fn test_engine_error_display() {
        let msg = EngineError::InvalidConcurrency { value: 0 }.to_string();
        assert!(msg.contains("invalid concurrency"));
        assert!(msg.contains("100"));
    }

    #[test]
    fn test_outcome_helpers() {
        assert!(TaskOutcome::Written { bytes: 1 }.is_acquired());
        assert!(TaskOutcome::Skipped.is_acquired());
        assert!(!TaskOutcome::Cancelled.is_acquired());
        assert!(TaskOutcome::Cancelled.is_cancelled());
    }

    // ==================== Run Tests ====================

    #[tokio::test]
    async fn test_run_writes_and_renames_part_file() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg-bytes".to_vec()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let dir = TempDir::new().unwrap();
        let engine = engine_in(dir.path(), 2, 0).await;
        let interrupted = Arc::new(AtomicBool::new(false));
        let reports = engine
            .run(
                vec![direct_task(format!("{}/a.jpg", mock_server.uri()), "pics-abc.jpg")],
                &interrupted,
            )
            .await
            .unwrap();

        assert_eq!(reports[0].outcome, TaskOutcome::Written { bytes: 10 });
        assert_eq!(std::fs::read(dir.path().join("pics-abc.jpg")).unwrap(), b"jpeg-bytes");
        assert!(!dir.path().join("pics-abc.jpg.part").exists());
        assert_eq!(engine.stats().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_run_duplicate_targets_in_one_batch_fetch_once() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let dir = TempDir::new().unwrap();
        let engine = engine_in(dir.path(), 4, 0).await;
        let url = format!("{}/a.jpg", mock_server.uri());
        let reports = engine
            .run(
                vec![direct_task(url.clone(), "same.jpg"), direct_task(url, "same.jpg")],
                &Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();

        assert!(matches!(reports[0].outcome, TaskOutcome::Written { .. }));
        assert_eq!(reports[1].outcome, TaskOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_run_permanent_failure_is_not_retried_and_releases_claim() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let dir = TempDir::new().unwrap();
        let engine = engine_in(dir.path(), 1, 3).await;
        let reports = engine
            .run(
                vec![direct_task(format!("{}/gone.jpg", mock_server.uri()), "gone.jpg")],
                &Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();

        assert!(matches!(
            reports[0].outcome,
            TaskOutcome::Failed { attempts: 1, .. }
        ));
        assert!(!engine.registry().contains("gone.jpg"));
        assert!(!dir.path().join("gone.jpg.part").exists());
    }

    #[tokio::test]
    async fn test_run_interrupted_before_start_cancels_everything() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(dir.path(), 1, 0).await;
        let interrupted = Arc::new(AtomicBool::new(true));
        let tasks = vec![
            direct_task("http://127.0.0.1:9/a.jpg".to_string(), "a.jpg"),
            direct_task("http://127.0.0.1:9/b.jpg".to_string(), "b.jpg"),
        ];

        let reports = engine.run(tasks, &interrupted).await.unwrap();
        assert!(reports.iter().all(|r| r.outcome.is_cancelled()));
        assert_eq!(engine.stats().cancelled(), 2);
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn test_stats_peak_tracks_maximum() {
        let stats = Arc::new(AcquisitionStats::new());
        let first = stats.enter();
        let second = stats.enter();
        assert_eq!(stats.in_flight(), 2);
        drop(first);
        drop(second);
        let _third = stats.enter();
        assert_eq!(stats.in_flight(), 1);
        assert_eq!(stats.peak_in_flight(), 2);
    }
}

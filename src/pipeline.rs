//! Run entry points tying the stages together.
//!
//! [`run_acquisition`] drives enumerate, resolve, acquire, and ledger.
//! [`run_relay`] drives scan, relay, and hash recording. Both return a
//! [`RunSummary`] and treat per-item and per-file failures as data, not errors.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures_util::{StreamExt, pin_mut};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::download::{AcquisitionEngine, EngineError, TaskOutcome, TaskReport};
use crate::ledger::{Ledger, LedgerError};
use crate::media::MediaResolver;
use crate::relay::{Channel, RelayEngine, RelayError, RelayOutcome, scan};
use crate::source::{Enumerator, ItemDescriptor, SourceSpec};

/// Items resolved before their tasks are handed to the engine together.
pub const ACQUISITION_BATCH_SIZE: usize = 64;

/// Fatal run errors. Everything else ends up in [`RunSummary::errors`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("cannot scan {}: {source}", dir.display())]
    Scan {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Totals for one run.
///
/// For relay runs, `items_seen` counts scanned files and `files_acquired`
/// counts files sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub items_seen: u64,
    pub files_acquired: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub elapsed: Duration,
    /// `(subject, reason)` for every failed task, file, or unplannable item.
    /// Items are named by id, tasks and files by target name.
    pub errors: Vec<(String, String)>,
    pub interrupted: bool,
}

/// Per `(source_tag, collection)` counters flushed to `daily_stats`.
#[derive(Debug, Default)]
struct SourceTally {
    items_seen: u64,
    files_acquired: u64,
}

/// An item whose tasks are part of the current batch.
struct PlannedItem {
    item: ItemDescriptor,
    source_tag: String,
}

/// Enumerates `sources`, acquires every new item's media, and ledgers each
/// fully attempted item.
///
/// Items already in the ledger are counted as seen and otherwise ignored, so a
/// re-run over unchanged sources makes no payload requests.
///
/// # Errors
///
/// Returns [`PipelineError::Ledger`] if the ledger fails and
/// [`PipelineError::Engine`] if the engine cannot admit work.
#[instrument(skip_all, fields(sources = sources.len()))]
pub async fn run_acquisition(
    enumerator: &Enumerator,
    sources: &[SourceSpec],
    resolver: &MediaResolver,
    engine: &AcquisitionEngine,
    ledger: &Ledger,
    interrupted: &Arc<AtomicBool>,
) -> Result<RunSummary, PipelineError> {
    let started = Instant::now();
    let mut summary = RunSummary::default();
    let mut tallies: BTreeMap<(String, String), SourceTally> = BTreeMap::new();
    let mut batch: Vec<(ItemDescriptor, String)> = Vec::with_capacity(ACQUISITION_BATCH_SIZE);

    let stream = enumerator.enumerate(sources);
    pin_mut!(stream);

    loop {
        if interrupted.load(Ordering::SeqCst) {
            summary.interrupted = true;
            break;
        }
        let Some(next) = stream.next().await else {
            break;
        };
        batch.push(next);
        if batch.len() >= ACQUISITION_BATCH_SIZE {
            let items = std::mem::take(&mut batch);
            acquire_batch(items, resolver, engine, ledger, interrupted, &mut summary, &mut tallies)
                .await?;
        }
    }
    if !batch.is_empty() {
        acquire_batch(batch, resolver, engine, ledger, interrupted, &mut summary, &mut tallies)
            .await?;
    }
    summary.interrupted |= interrupted.load(Ordering::SeqCst);

    for ((source_tag, collection), tally) in &tallies {
        ledger
            .record_stat(source_tag, collection, tally.items_seen, tally.files_acquired)
            .await?;
    }

    summary.elapsed = started.elapsed();
    info!(
        items_seen = summary.items_seen,
        files_acquired = summary.files_acquired,
        files_skipped = summary.files_skipped,
        files_failed = summary.files_failed,
        interrupted = summary.interrupted,
        elapsed_ms = summary.elapsed.as_millis(),
        "acquisition run complete"
    );
    Ok(summary)
}

async fn acquire_batch(
    batch: Vec<(ItemDescriptor, String)>,
    resolver: &MediaResolver,
    engine: &AcquisitionEngine,
    ledger: &Ledger,
    interrupted: &Arc<AtomicBool>,
    summary: &mut RunSummary,
    tallies: &mut BTreeMap<(String, String), SourceTally>,
) -> Result<(), PipelineError> {
    let mut planned = Vec::new();
    let mut tasks = Vec::new();

    for (item, source_tag) in batch {
        summary.items_seen += 1;
        tallies
            .entry((source_tag.clone(), item.collection.clone()))
            .or_default()
            .items_seen += 1;

        if ledger.is_known(&item.id).await? {
            debug!(item_id = %item.id, "already ledgered");
            continue;
        }
        match resolver.resolve(&item).await {
            Ok(item_tasks) => tasks.extend(item_tasks),
            Err(e) => {
                debug!(item_id = %item.id, error = %e, "item has nothing to acquire");
                summary.files_failed += 1;
                summary.errors.push((item.id.clone(), e.to_string()));
            }
        }
        planned.push(PlannedItem { item, source_tag });
    }

    let reports = engine.run(tasks, interrupted).await?;
    let mut by_item: HashMap<String, Vec<TaskReport>> = HashMap::new();
    for report in reports {
        by_item.entry(report.item_id.clone()).or_default().push(report);
    }

    for PlannedItem { item, source_tag } in planned {
        let reports = by_item.remove(&item.id).unwrap_or_default();
        if reports.iter().any(|r| r.outcome.is_cancelled()) {
            debug!(item_id = %item.id, "item not fully attempted, leaving unledgered");
            continue;
        }

        let mut acquired: u32 = 0;
        let mut written: u64 = 0;
        for report in &reports {
            match &report.outcome {
                TaskOutcome::Written { .. } => {
                    written += 1;
                    acquired += 1;
                }
                TaskOutcome::Skipped => {
                    summary.files_skipped += 1;
                    acquired += 1;
                }
                TaskOutcome::Failed { reason, .. } => {
                    summary.files_failed += 1;
                    summary
                        .errors
                        .push((report.target_name.clone(), reason.clone()));
                }
                TaskOutcome::Cancelled => {}
            }
        }
        summary.files_acquired += written;
        tallies
            .entry((source_tag, item.collection.clone()))
            .or_default()
            .files_acquired += written;

        ledger
            .record_item(&item.id, &item.collection, item.created_at.timestamp(), acquired)
            .await?;
    }
    Ok(())
}

/// Relays every eligible file in `dir` across `channels`.
///
/// # Errors
///
/// Returns [`PipelineError::Scan`] if `dir` cannot be listed and
/// [`PipelineError::Relay`] if the ledger fails mid-run.
#[instrument(skip(engine, channels, interrupted), fields(dir = %dir.display(), channels = channels.len()))]
pub async fn run_relay(
    dir: &Path,
    engine: &RelayEngine,
    channels: &[Arc<dyn Channel>],
    interrupted: &Arc<AtomicBool>,
) -> Result<RunSummary, PipelineError> {
    let started = Instant::now();
    let files = scan(dir).await.map_err(|source| PipelineError::Scan {
        dir: dir.to_path_buf(),
        source,
    })?;
    if files.is_empty() {
        warn!("no files to relay");
    }

    let mut summary = RunSummary {
        items_seen: files.len() as u64,
        ..RunSummary::default()
    };
    let report = engine.relay_across(files, channels, interrupted).await?;

    for entry in report.entries {
        match entry.outcome {
            RelayOutcome::Sent => summary.files_acquired += 1,
            RelayOutcome::Skipped => summary.files_skipped += 1,
            RelayOutcome::Failed { reason, .. } => {
                summary.files_failed += 1;
                summary.errors.push((entry.name, reason));
            }
            RelayOutcome::Cancelled => summary.interrupted = true,
        }
    }
    summary.interrupted |= interrupted.load(Ordering::SeqCst);
    summary.elapsed = started.elapsed();

    info!(
        scanned = summary.items_seen,
        sent = summary.files_acquired,
        skipped = summary.files_skipped,
        failed = summary.files_failed,
        elapsed_ms = summary.elapsed.as_millis(),
        "relay run complete"
    );
    Ok(summary)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::DateTime;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::db::Database;
    use crate::download::{HttpClient, RetryPolicy, TargetRegistry};
    use crate::media::ProviderRegistry;
    use crate::relay::{ChannelError, OutgoingMedia};
    use crate::source::{SourceApi, SourceError};

    /// Source whose items all point at unsupported pages, so no payload is fetched.
    struct PageSource {
        ids: Vec<&'static str>,
    }

    #[async_trait]
    impl SourceApi for PageSource {
        async fn fetch(&self, spec: &SourceSpec) -> Result<Vec<ItemDescriptor>, SourceError> {
            Ok(self
                .ids
                .iter()
                .map(|id| ItemDescriptor {
                    id: (*id).to_string(),
                    collection: "pics".to_string(),
                    created_at: DateTime::from_timestamp(1_704_067_200, 0).unwrap(),
                    source_url: format!("https://example.com/{}/{id}", spec.path),
                    raw: json!({"url": format!("https://example.com/{id}")}),
                })
                .collect())
        }
    }

    async fn fixture(dir: &Path) -> (MediaResolver, AcquisitionEngine, Ledger) {
        let registry = Arc::new(TargetRegistry::from_directory(dir).await.unwrap());
        let engine =
            AcquisitionEngine::new(2, RetryPolicy::with_max_retries(0), HttpClient::new().unwrap(), registry)
                .unwrap();
        let resolver = MediaResolver::new(Arc::new(ProviderRegistry::new()), RetryPolicy::with_max_retries(0));
        let ledger = Ledger::new(Database::new_in_memory().await.unwrap());
        (resolver, engine, ledger)
    }

    #[tokio::test]
    async fn test_acquisition_ledgers_items_without_media() {
        let dir = TempDir::new().unwrap();
        let (resolver, engine, ledger) = fixture(dir.path()).await;
        let enumerator = Enumerator::new(Arc::new(PageSource { ids: vec!["a", "b"] }));
        let sources = vec![SourceSpec::new("front", "r/pics", 10)];
        let interrupted = Arc::new(AtomicBool::new(false));

        let summary = run_acquisition(&enumerator, &sources, &resolver, &engine, &ledger, &interrupted)
            .await
            .unwrap();

        assert_eq!(summary.items_seen, 2);
        assert_eq!(summary.files_acquired, 0);
        assert_eq!(summary.files_failed, 2);
        assert_eq!(summary.errors[0].0, "a");
        assert!(summary.errors[0].1.contains("no supported media"));
        assert!(!summary.interrupted);
        assert_eq!(ledger.count_items().await.unwrap(), 2);
        assert_eq!(ledger.get_item("a").await.unwrap().unwrap().acquired_count, 0);

        let stats = ledger.list_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].source_tag, "front");
        assert_eq!(stats[0].items_seen, 2);
    }

    #[tokio::test]
    async fn test_acquisition_interrupted_before_start_records_nothing() {
        let dir = TempDir::new().unwrap();
        let (resolver, engine, ledger) = fixture(dir.path()).await;
        let enumerator = Enumerator::new(Arc::new(PageSource { ids: vec!["a"] }));
        let sources = vec![SourceSpec::new("front", "r/pics", 10)];
        let interrupted = Arc::new(AtomicBool::new(true));

        let summary = run_acquisition(&enumerator, &sources, &resolver, &engine, &ledger, &interrupted)
            .await
            .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.items_seen, 0);
        assert_eq!(ledger.count_items().await.unwrap(), 0);
    }

    struct RecordingChannel {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        async fn send(&self, media: &OutgoingMedia) -> Result<(), ChannelError> {
            if media.name.starts_with("bad") {
                return Err(ChannelError::Permanent("rejected".to_string()));
            }
            self.sent.lock().unwrap().push(media.name.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_relay_summary_counts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"same").unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"same").unwrap();
        std::fs::write(dir.path().join("bad.jpg"), b"other").unwrap();
        let ledger = Ledger::new(Database::new_in_memory().await.unwrap());
        let engine = RelayEngine::new(1, RetryPolicy::with_max_retries(0), ledger.clone()).unwrap();
        let channel = Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
        });

        let summary = run_relay(
            dir.path(),
            &engine,
            &[Arc::clone(&channel) as Arc<dyn Channel>],
            &Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        assert_eq!(summary.items_seen, 3);
        assert_eq!(summary.files_acquired, 1);
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(summary.files_failed, 1);
        assert_eq!(summary.errors[0].0, "bad.jpg");
        assert_eq!(*channel.sent.lock().unwrap(), vec!["a.jpg".to_string()]);
        assert_eq!(ledger.count_hashes().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_relay_missing_directory_is_fatal() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(Database::new_in_memory().await.unwrap());
        let engine = RelayEngine::new(1, RetryPolicy::default(), ledger).unwrap();
        let channel: Arc<dyn Channel> = Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
        });

        let result = run_relay(
            &dir.path().join("missing"),
            &engine,
            &[channel],
            &Arc::new(AtomicBool::new(false)),
        )
        .await;
        assert!(matches!(result, Err(PipelineError::Scan { .. })));
    }
}

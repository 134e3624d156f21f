//! CLI entry point for the harvester tool.

use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::Parser;
use harvester_core::download::{
    AcquisitionEngine, DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, HttpClient, RetryPolicy,
    TargetRegistry,
    constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS},
};
use harvester_core::encoder::{Encoder, FfmpegEncoder};
use harvester_core::media::{MediaResolver, ProviderRegistry, is_media_item};
use harvester_core::pipeline::{RunSummary, run_acquisition, run_relay};
use harvester_core::relay::{
    Channel, DEFAULT_RELAY_CONCURRENCY, DEFAULT_TELEGRAM_API_URL, RelayEngine, TelegramChannel,
};
use harvester_core::source::{DEFAULT_LISTING_BASE_URL, Enumerator, ItemDescriptor, ListingSource};
use harvester_core::Ledger;
use tracing::{debug, info, warn};

mod app_config;
mod cli;
mod progress;

use app_config::FileConfig;
use cli::{AcquireArgs, Cli, Command, CommonArgs, RelayArgs};

const DEFAULT_OUTPUT_DIR: &str = "./media";
const DEFAULT_DB_PATH: &str = "./harvester.db";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let file_config = app_config::load(cli.config.as_deref())?;
    debug!(?file_config, "configuration loaded");

    let interrupted = Arc::new(AtomicBool::new(false));
    spawn_interrupt_listener(Arc::clone(&interrupted));

    let summary = match cli.command {
        Command::Acquire(args) => acquire(args, &file_config, cli.quiet, &interrupted).await?,
        Command::Relay(args) => relay(args, &file_config, &interrupted).await?,
    };

    print_summary(&summary);
    if summary.interrupted {
        warn!("run interrupted; remaining work will be picked up next run");
    }
    Ok(())
}

/// Settings shared by both subcommands after merging CLI, file and defaults.
struct Resolved {
    output_dir: PathBuf,
    db_path: PathBuf,
    retry_policy: RetryPolicy,
    client: HttpClient,
}

impl Resolved {
    fn new(common: CommonArgs, file: &FileConfig) -> Result<Self> {
        let max_retries = common
            .max_retries
            .or(file.max_retries)
            .map_or(DEFAULT_MAX_RETRIES, u32::from);
        let client = HttpClient::new_with_timeouts(
            file.connect_timeout_secs.unwrap_or(CONNECT_TIMEOUT_SECS),
            file.read_timeout_secs.unwrap_or(READ_TIMEOUT_SECS),
        )
        .context("Failed to build HTTP client")?;

        Ok(Self {
            output_dir: common
                .output_dir
                .or_else(|| file.output_dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            db_path: common
                .db_path
                .or_else(|| file.db_path.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            retry_policy: RetryPolicy::with_max_retries(max_retries),
            client,
        })
    }

    async fn open_ledger(&self) -> Result<Ledger> {
        if let Some(parent) = self.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create '{}'", parent.display()))?;
        }
        Ledger::open(&self.db_path)
            .await
            .with_context(|| format!("Failed to open ledger '{}'", self.db_path.display()))
    }
}

async fn acquire(
    args: AcquireArgs,
    file: &FileConfig,
    quiet: bool,
    interrupted: &Arc<AtomicBool>,
) -> Result<RunSummary> {
    let concurrency = args
        .concurrency
        .or(file.concurrency)
        .map_or(DEFAULT_CONCURRENCY, usize::from);
    let base_url = args
        .listing_base_url
        .or_else(|| file.listing_base_url.clone())
        .unwrap_or_else(|| DEFAULT_LISTING_BASE_URL.to_string());
    let resolved = Resolved::new(args.common, file)?;
    info!(
        sources = args.sources.len(),
        concurrency,
        output = %resolved.output_dir.display(),
        "starting acquisition"
    );

    let ledger = resolved.open_ledger().await?;
    let registry = Arc::new(
        TargetRegistry::from_directory(&resolved.output_dir)
            .await
            .with_context(|| format!("Failed to open '{}'", resolved.output_dir.display()))?,
    );
    let engine = AcquisitionEngine::new(
        concurrency,
        resolved.retry_policy.clone(),
        resolved.client.clone(),
        registry,
    )?
    .with_encoder(encoder());

    let providers = Arc::new(ProviderRegistry::with_defaults(&resolved.client)?);
    let media_only = {
        let providers = Arc::clone(&providers);
        Arc::new(move |item: &ItemDescriptor| is_media_item(item, &providers))
    };
    let listing = ListingSource::new(resolved.client.clone(), &base_url, resolved.retry_policy.clone())?
        .with_prefilter(media_only);
    let enumerator = Enumerator::new(Arc::new(listing));
    let resolver = MediaResolver::new(providers, resolved.retry_policy.clone());

    let show_spinner = !quiet && io::stderr().is_terminal();
    let (spinner, stop) = progress::spawn_progress_ui(show_spinner, Arc::clone(engine.stats()));
    let result = run_acquisition(
        &enumerator,
        &args.sources,
        &resolver,
        &engine,
        &ledger,
        interrupted,
    )
    .await;
    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = spinner {
        let _ = handle.await;
    }

    let summary = result?;
    debug!(
        peak_in_flight = engine.stats().peak_in_flight(),
        retried = engine.stats().retried(),
        "acquisition engine stats"
    );
    Ok(summary)
}

async fn relay(
    args: RelayArgs,
    file: &FileConfig,
    interrupted: &Arc<AtomicBool>,
) -> Result<RunSummary> {
    let Some(chat_id) = args.chat_id.or_else(|| file.chat_id.clone()) else {
        bail!("No chat id given; pass --chat-id or set `chat_id` in the config file");
    };
    let concurrency = args
        .concurrency
        .or(file.relay_concurrency)
        .map_or(DEFAULT_RELAY_CONCURRENCY, usize::from);
    let api_url = args
        .api_url
        .unwrap_or_else(|| DEFAULT_TELEGRAM_API_URL.to_string());
    let resolved = Resolved::new(args.common, file)?;
    info!(
        concurrency,
        bots = args.bot_tokens.len(),
        dir = %resolved.output_dir.display(),
        "starting relay"
    );

    let ledger = resolved.open_ledger().await?;
    let channels = args
        .bot_tokens
        .iter()
        .map(|token| -> Result<Arc<dyn Channel>> {
            let channel = TelegramChannel::new(&resolved.client, &api_url, token, &chat_id)?;
            Ok(Arc::new(channel) as Arc<dyn Channel>)
        })
        .collect::<Result<Vec<_>>>()?;
    let engine =
        RelayEngine::new(concurrency, resolved.retry_policy.clone(), ledger)?.with_encoder(encoder());

    Ok(run_relay(&resolved.output_dir, &engine, &channels, interrupted).await?)
}

fn encoder() -> Arc<dyn Encoder> {
    Arc::new(FfmpegEncoder::from_env())
}

/// First Ctrl-C stops admission of new work; a second one exits immediately.
fn spawn_interrupt_listener(interrupted: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received; finishing in-flight work (press Ctrl-C again to abort)");
        interrupted.store(true, Ordering::SeqCst);

        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

fn print_summary(summary: &RunSummary) {
    println!(
        "items seen: {}, acquired: {}, skipped: {}, failed: {} in {:.1}s",
        summary.items_seen,
        summary.files_acquired,
        summary.files_skipped,
        summary.files_failed,
        summary.elapsed.as_secs_f64()
    );
    for (subject, reason) in &summary.errors {
        println!("  failed {subject}: {reason}");
    }
}

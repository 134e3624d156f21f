//! Spinner shown while acquisition runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use harvester_core::download::AcquisitionStats;
use indicatif::{ProgressBar, ProgressStyle};

/// Spawns the spinner when enabled.
///
/// Returns the task handle and a stop flag; when disabled the handle is
/// `None` and the flag is already set.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    stats: Arc<AcquisitionStats>,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !enabled {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = tokio::spawn(run_spinner(stats, Arc::clone(&stop)));
    (Some(handle), stop)
}

async fn run_spinner(stats: Arc<AcquisitionStats>, stop: Arc<AtomicBool>) {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));

    while !stop.load(Ordering::SeqCst) {
        spinner.set_message(status_line(&stats));
        tokio::time::sleep(Duration::from_millis(120)).await;
    }

    spinner.finish_and_clear();
}

fn status_line(stats: &AcquisitionStats) -> String {
    format!(
        "{} written, {} skipped, {} failed ({} in flight)",
        stats.written(),
        stats.skipped(),
        stats.failed(),
        stats.in_flight()
    )
}

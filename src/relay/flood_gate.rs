//! Shared backpressure deadline for all relay senders.
//!
//! When the channel answers any sender with "rate limited, retry after T", the
//! whole relay pauses: the [`FloodGate`] deadline moves to `now + T` and every
//! sender waits for it before its next send.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use harvester_core::relay::FloodGate;
//!
//! # async fn example() {
//! let gate = FloodGate::new();
//! gate.extend(Duration::from_secs(10)).await;
//! gate.wait().await; // returns ten seconds later
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::download::constants::MAX_RETRY_AFTER;

/// Warning threshold for total time spent paused in one process.
const CUMULATIVE_PAUSE_WARNING_THRESHOLD: Duration = Duration::from_secs(300);

/// Monotonic "do not send before" deadline shared by relay senders.
///
/// Designed to be wrapped in `Arc` and shared across spawned Tokio tasks.
#[derive(Debug, Default)]
pub struct FloodGate {
    /// `None` until the first rate-limit signal.
    deadline: Mutex<Option<Instant>>,

    /// Sum of extensions applied, in milliseconds.
    cumulative_pause_ms: AtomicU64,
}

impl FloodGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the deadline to `now + retry_after` if that is later than the
    /// current deadline. An earlier candidate never shortens the pause.
    ///
    /// Values above one hour are capped.
    #[instrument(skip(self), fields(retry_after_ms = retry_after.as_millis()))]
    pub async fn extend(&self, retry_after: Duration) {
        let retry_after = retry_after.min(MAX_RETRY_AFTER);
        let candidate = Instant::now() + retry_after;

        let mut deadline = self.deadline.lock().await;
        if deadline.is_some_and(|current| current >= candidate) {
            debug!("flood gate already closed for longer");
            return;
        }

        let added = match *deadline {
            Some(current) if current > Instant::now() => candidate - current,
            _ => retry_after,
        };
        *deadline = Some(candidate);
        drop(deadline);

        #[allow(clippy::cast_possible_truncation)]
        let added_ms = added.as_millis() as u64;
        let total = Duration::from_millis(
            self.cumulative_pause_ms.fetch_add(added_ms, Ordering::SeqCst) + added_ms,
        );
        warn!(pause_ms = retry_after.as_millis(), "channel flood control, pausing all senders");
        if total >= CUMULATIVE_PAUSE_WARNING_THRESHOLD {
            warn!(
                total_pause_secs = total.as_secs(),
                "relay has spent a long time paused by flood control"
            );
        }
    }

    /// Waits until the deadline has passed.
    ///
    /// Re-reads the deadline after every sleep, so an extension made while
    /// waiting is honoured.
    pub async fn wait(&self) {
        loop {
            let deadline = *self.deadline.lock().await;
            match deadline {
                Some(until) if until > Instant::now() => {
                    debug!(wait_ms = (until - Instant::now()).as_millis(), "waiting on flood gate");
                    tokio::time::sleep_until(until).await;
                }
                _ => return,
            }
        }
    }

    /// Current deadline, if one was ever set.
    pub async fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock().await
    }

    /// Returns true if a send right now would have to wait.
    pub async fn is_closed(&self) -> bool {
        self.deadline()
            .await
            .is_some_and(|until| until > Instant::now())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_open_gate_does_not_wait() {
        let gate = FloodGate::new();
        assert!(!gate.is_closed().await);
        let start = Instant::now();
        gate.wait().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_is_monotonic() {
        let gate = FloodGate::new();
        gate.extend(Duration::from_secs(10)).await;
        let first = gate.deadline().await.unwrap();

        gate.extend(Duration::from_secs(3)).await;
        assert_eq!(gate.deadline().await.unwrap(), first);

        gate.extend(Duration::from_secs(20)).await;
        assert!(gate.deadline().await.unwrap() > first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_until_deadline() {
        let gate = FloodGate::new();
        let start = Instant::now();
        gate.extend(Duration::from_secs(10)).await;
        gate.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(!gate.is_closed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_honours_extension_made_while_waiting() {
        let gate = Arc::new(FloodGate::new());
        let start = Instant::now();
        gate.extend(Duration::from_secs(5)).await;

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait().await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        gate.extend(Duration::from_secs(10)).await;

        waiter.await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_caps_excessive_values() {
        let gate = FloodGate::new();
        let start = Instant::now();
        gate.extend(Duration::from_secs(86_400)).await;
        let until = gate.deadline().await.unwrap();
        assert!(until - start <= MAX_RETRY_AFTER);
    }
}

//! Relay of acquired files to a rate-limited remote channel.
//!
//! A relay run scans the acquisition output directory, fingerprints each file,
//! skips content that was already relayed, and sends the rest through a
//! [`Channel`], or across several with [`RelayEngine::relay_across`] (one per
//! bot). All senders share one [`FloodGate`]: when any channel signals flood
//! control, every sender pauses until the deadline passes.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//! use harvester_core::download::{HttpClient, RetryPolicy};
//! use harvester_core::relay::{RelayEngine, TelegramChannel, DEFAULT_TELEGRAM_API_URL, scan};
//! use harvester_core::{Database, Ledger};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = Ledger::new(Database::new(Path::new("harvester.db")).await?);
//! let channel = TelegramChannel::new(&HttpClient::new()?, DEFAULT_TELEGRAM_API_URL, "token", "-100123")?;
//! let engine = RelayEngine::new(2, RetryPolicy::default(), ledger)?;
//!
//! let files = scan(Path::new("./media")).await?;
//! let report = engine
//!     .relay(files, Arc::new(channel), &Arc::new(AtomicBool::new(false)))
//!     .await?;
//! println!("sent {}, skipped {}", report.sent(), report.skipped());
//! # Ok(())
//! # }
//! ```

mod channel;
mod engine;
mod fingerprint;
mod flood_gate;
mod scanner;

pub use channel::{
    Channel, ChannelError, DEFAULT_TELEGRAM_API_URL, MediaCategory, OutgoingMedia,
    TelegramChannel,
};
pub use engine::{
    DEFAULT_RELAY_CONCURRENCY, RelayEngine, RelayEntry, RelayError, RelayOutcome, RelayReport,
};
pub use fingerprint::fingerprint;
pub use flood_gate::FloodGate;
pub use scanner::{NORMALIZED_MARKER, ScannedFile, THUMBNAIL_MARKER, scan};

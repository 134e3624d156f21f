//! Payload acquisition: streaming HTTP downloads with bounded retry.
//!
//! # Features
//!
//! - Streaming downloads into `.part` files, renamed into place on success
//! - Configurable timeouts (30s connect, 5min read by default)
//! - One [`RetryPolicy`] shared by downloads, provider lookups, and relay sends
//! - Target-name claims through [`TargetRegistry`] so a name is fetched once
//! - Semaphore-bounded concurrency in [`AcquisitionEngine`]
//!
//! # Example
//!
//! ```no_run
//! use harvester_core::download::HttpClient;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new()?;
//! let bytes = client
//!     .download_to_path("https://i.redd.it/abc.jpg", Path::new("./media/abc.jpg"))
//!     .await?;
//! println!("Downloaded {bytes} bytes");
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod engine;
mod error;
mod registry;
mod retry;

pub use client::HttpClient;
pub use engine::{
    AcquisitionEngine, AcquisitionStats, DEFAULT_CONCURRENCY, EngineError, TaskOutcome, TaskReport,
};
pub use error::DownloadError;
pub use registry::TargetRegistry;
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, Retryable, classify_error,
    parse_retry_after, retry_after_hint, retry_with_policy,
};

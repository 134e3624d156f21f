//! Harvester Core Library
//!
//! Core functionality for the `harvester` tool, which pulls media referenced
//! by content listings into a local directory and relays it to a
//! rate-limited chat channel, remembering what it has already done.
//!
//! # Architecture
//!
//! - [`source`] - Listing enumeration and item descriptors
//! - [`media`] - Media classification, provider lookups and task planning
//! - [`download`] - HTTP client, retry policy and the concurrent acquisition engine
//! - [`encoder`] - External encoder (`ffmpeg`) for muxing, normalizing and probing
//! - [`relay`] - Directory scan, content fingerprints and the rate-limited relay engine
//! - [`ledger`] - Persistent record of processed items, statistics and relayed content
//! - [`pipeline`] - End-to-end acquisition and relay runs
//! - [`db`] - Database connection and schema management

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod db;
pub mod download;
pub mod encoder;
pub mod ledger;
pub mod media;
pub mod pipeline;
pub mod relay;
pub mod source;
pub(crate) mod user_agent;

#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use db::Database;
pub use download::{
    AcquisitionEngine, DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, EngineError, HttpClient,
    RetryPolicy, TaskOutcome, TaskReport,
};
pub use ledger::{Ledger, LedgerError};
pub use media::{AcquisitionTask, MediaKind, MediaResolver};
pub use pipeline::{PipelineError, RunSummary, run_acquisition, run_relay};
pub use relay::{Channel, RelayEngine, RelayReport, TelegramChannel};
pub use source::{Enumerator, ItemDescriptor, SourceSpec};

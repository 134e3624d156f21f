//! Error types for provider lookups.

use std::time::Duration;

use thiserror::Error;

use crate::download::{DownloadError, FailureType, Retryable, classify_error, retry_after_hint};

/// Errors that can occur while resolving a third-party hosted item.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The provider API request failed.
    #[error("{provider} lookup failed: {source}")]
    Lookup {
        /// Provider name.
        provider: String,
        /// Underlying transport error.
        #[source]
        source: DownloadError,
    },

    /// The provider answered with a document missing the expected fields.
    #[error("{provider} returned an unusable response for '{id}': {reason}")]
    Malformed {
        /// Provider name.
        provider: String,
        /// Opaque id that was looked up.
        id: String,
        /// What was missing.
        reason: String,
    },

    /// Nothing in the item points at media this tool can fetch.
    #[error("no supported media at '{url}'")]
    Unsupported {
        /// The item's link, possibly empty.
        url: String,
    },

    /// The item was recognised as media but yielded nothing to download.
    #[error("{origin} yielded no media")]
    NoMedia {
        /// Provider name, or `gallery` for a gallery with no valid parts.
        origin: String,
    },
}

impl ResolveError {
    /// Creates a lookup error.
    pub fn lookup(provider: impl Into<String>, source: DownloadError) -> Self {
        Self::Lookup {
            provider: provider.into(),
            source,
        }
    }

    /// Creates a malformed-response error.
    pub fn malformed(
        provider: impl Into<String>,
        id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Malformed {
            provider: provider.into(),
            id: id.into(),
            reason: reason.into(),
        }
    }
}

impl Retryable for ResolveError {
    fn failure_type(&self) -> FailureType {
        match self {
            Self::Lookup { source, .. } => classify_error(source),
            Self::Malformed { .. } | Self::Unsupported { .. } | Self::NoMedia { .. } => {
                FailureType::Permanent
            }
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Lookup { source, .. } => retry_after_hint(source),
            Self::Malformed { .. } | Self::Unsupported { .. } | Self::NoMedia { .. } => None,
        }
    }
}

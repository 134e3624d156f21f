//! Item enumeration from upstream content sources.
//!
//! A source is addressed by a [`SourceSpec`] (`tag=path[:limit]`, e.g.
//! `front=/best:100` for the front page or `pics` for `r/pics`) and queried
//! through a [`SourceApi`]. The [`Enumerator`] walks a list of specs lazily and
//! yields each distinct item once, tagged with the source that produced it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures_util::StreamExt;
//! use harvester_core::download::{HttpClient, RetryPolicy};
//! use harvester_core::source::{Enumerator, ListingSource, SourceSpec};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let api = ListingSource::new(HttpClient::new()?, "https://www.reddit.com/", RetryPolicy::default())?;
//! let enumerator = Enumerator::new(Arc::new(api));
//! let sources: Vec<SourceSpec> = vec!["front=r/pics:25".parse()?];
//!
//! let stream = enumerator.enumerate(&sources);
//! futures_util::pin_mut!(stream);
//! while let Some((item, tag)) = stream.next().await {
//!     println!("{tag}: {} in {}", item.id, item.collection);
//! }
//! # Ok(())
//! # }
//! ```

mod listing;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt, future, stream};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::download::DownloadError;

pub use listing::{DEFAULT_LISTING_BASE_URL, FETCH_MULTIPLIER, ItemFilter, ListingSource};

/// Number of items requested from a source when the spec gives no limit.
pub const DEFAULT_SOURCE_LIMIT: usize = 100;

/// One item as produced by a source. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDescriptor {
    /// Stable upstream identifier.
    pub id: String,
    /// Grouping the item belongs to (a community, channel, or feed).
    pub collection: String,
    pub created_at: DateTime<Utc>,
    /// Primary link carried by the item.
    pub source_url: String,
    /// The untouched upstream record, consulted by media classification.
    pub raw: serde_json::Value,
}

/// Address of one upstream listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    /// Label recorded with statistics for items from this source.
    pub tag: String,
    /// Listing path relative to the source API base, e.g. `r/pics/top`.
    pub path: String,
    /// Maximum number of items to request.
    pub limit: usize,
}

impl SourceSpec {
    /// Creates a spec with an explicit tag.
    #[must_use]
    pub fn new(tag: impl Into<String>, path: impl Into<String>, limit: usize) -> Self {
        Self {
            tag: tag.into(),
            path: path.into(),
            limit,
        }
    }
}

impl FromStr for SourceSpec {
    type Err = SourceError;

    /// Parses `tag=path[:limit]` or `path[:limit]`.
    ///
    /// A path without `/` names a collection and expands to `r/{path}`. A
    /// leading `/` takes the path verbatim, so `/best` is the front page.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| SourceError::InvalidSpec {
            spec: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        let (tag, rest) = match trimmed.split_once('=') {
            Some((tag, rest)) => (Some(tag.trim()), rest.trim()),
            None => (None, trimmed),
        };

        let (path, limit) = match rest.rsplit_once(':') {
            Some((path, limit)) => {
                let limit: usize = limit
                    .trim()
                    .parse()
                    .map_err(|_| invalid("limit must be a positive integer"))?;
                (path.trim(), limit)
            }
            None => (rest, DEFAULT_SOURCE_LIMIT),
        };

        if limit == 0 {
            return Err(invalid("limit must be a positive integer"));
        }

        let verbatim = path.starts_with('/');
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(invalid("listing path is empty"));
        }
        if path
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(invalid("listing path has an empty or relative segment"));
        }
        let path = if verbatim || path.contains('/') {
            path.to_string()
        } else {
            format!("r/{path}")
        };

        let tag = match tag {
            Some("") => return Err(invalid("tag is empty")),
            Some(tag) => tag.to_string(),
            None => path.clone(),
        };

        Ok(Self { tag, path, limit })
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=/{}:{}", self.tag, self.path, self.limit)
    }
}

/// Errors raised while querying a source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The listing request failed after retries.
    #[error("source '{tag}' unavailable: {source}")]
    Fetch {
        /// Tag of the failing source.
        tag: String,
        /// Final transport error.
        #[source]
        source: DownloadError,
    },

    /// The listing response did not have the expected shape.
    #[error("source '{tag}' returned a malformed listing: {reason}")]
    Malformed {
        /// Tag of the failing source.
        tag: String,
        /// What was wrong with the response.
        reason: String,
    },

    /// A source spec string could not be parsed.
    #[error("invalid source spec '{spec}': {reason}")]
    InvalidSpec {
        /// The offending input.
        spec: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Upstream API that lists items for a source.
#[async_trait]
pub trait SourceApi: Send + Sync {
    /// Returns up to `spec.limit` items, newest first as the upstream orders them.
    async fn fetch(&self, spec: &SourceSpec) -> Result<Vec<ItemDescriptor>, SourceError>;
}

/// Lazily enumerates items across sources, de-duplicating by item id.
#[derive(Clone)]
pub struct Enumerator {
    api: Arc<dyn SourceApi>,
}

impl Enumerator {
    #[must_use]
    pub fn new(api: Arc<dyn SourceApi>) -> Self {
        Self { api }
    }

    /// Streams `(item, source_tag)` pairs.
    ///
    /// Each source is queried only when the stream reaches it, and every call
    /// re-queries upstream. When an item appears in several sources the first
    /// occurrence wins. A failing source is logged and skipped.
    pub fn enumerate<'a>(
        &'a self,
        sources: &'a [SourceSpec],
    ) -> impl Stream<Item = (ItemDescriptor, String)> + 'a {
        let mut seen: HashSet<String> = HashSet::new();

        stream::iter(sources)
            .then(move |spec| async move {
                match self.api.fetch(spec).await {
                    Ok(items) => {
                        info!(source = %spec.tag, count = items.len(), "source listed");
                        items
                            .into_iter()
                            .map(|item| (item, spec.tag.clone()))
                            .collect::<Vec<_>>()
                    }
                    Err(error) => {
                        warn!(source = %spec.tag, error = %error, "skipping failed source");
                        Vec::new()
                    }
                }
            })
            .flat_map(stream::iter)
            .filter(move |(item, tag)| {
                let fresh = seen.insert(item.id.clone());
                if !fresh {
                    debug!(item_id = %item.id, source = %tag, "duplicate item across sources");
                }
                future::ready(fresh)
            })
    }
}

impl fmt::Debug for Enumerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enumerator").finish_non_exhaustive()
    }
}

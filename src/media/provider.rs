//! Third-party media hosts.
//!
//! A [`ProviderResolver`] recognises its host by domain, extracts an opaque id
//! from the link, and later turns that id into one or more downloadable URLs.
//! Lookups are the only network step in media resolution.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use url::Url;

use super::ResolveError;
use crate::download::{DownloadError, HttpClient};

/// Public API root of the redgifs provider.
pub const DEFAULT_REDGIFS_API_URL: &str = "https://api.redgifs.com/";

/// Resolves a third-party hosted item to downloadable URLs.
///
/// Uses `async_trait` so resolvers can be stored as `Box<dyn ProviderResolver>`.
#[async_trait]
pub trait ProviderResolver: Send + Sync {
    /// Short lowercase name, used in target names and logs.
    fn name(&self) -> &str;

    /// Returns true if links on `host` belong to this provider.
    fn can_handle(&self, host: &str) -> bool;

    /// Extracts the provider's opaque id from a link.
    fn extract_id(&self, url: &Url) -> Option<String>;

    /// Extension used when a resolved URL carries none.
    fn default_extension(&self) -> &str {
        ".mp4"
    }

    /// Looks up the downloadable URLs for `id`.
    async fn resolve(&self, id: &str) -> Result<Vec<String>, ResolveError>;
}

/// Ordered set of providers. The first provider whose domain matches wins.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Box<dyn ProviderResolver>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in provider pointed at its public API.
    ///
    /// # Errors
    ///
    /// Returns an error if a built-in API URL fails to parse.
    pub fn with_defaults(client: &HttpClient) -> Result<Self, DownloadError> {
        let mut registry = Self::new();
        registry.register(Box::new(RedgifsResolver::new(
            client.clone(),
            DEFAULT_REDGIFS_API_URL,
        )?));
        Ok(registry)
    }

    pub fn register(&mut self, provider: Box<dyn ProviderResolver>) {
        debug!(provider = provider.name(), "registered provider");
        self.providers.push(provider);
    }

    /// Finds the provider for a link host.
    #[must_use]
    pub fn find(&self, host: &str) -> Option<&dyn ProviderResolver> {
        let host = host.to_ascii_lowercase();
        self.providers
            .iter()
            .find(|provider| provider.can_handle(&host))
            .map(AsRef::as_ref)
    }

    /// Finds a provider by its name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&dyn ProviderResolver> {
        self.providers
            .iter()
            .find(|provider| provider.name() == name)
            .map(AsRef::as_ref)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.providers.iter().map(|p| p.name()))
            .finish()
    }
}

const REDGIFS: &str = "redgifs";

/// redgifs.com resolver.
///
/// The API requires a bearer token. A temporary token is fetched on first use
/// and reused until the API rejects it with 401.
pub struct RedgifsResolver {
    client: HttpClient,
    api_url: Url,
    token: Mutex<Option<String>>,
}

impl RedgifsResolver {
    /// Creates a resolver against `api_url`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidUrl`] if `api_url` is not absolute.
    pub fn new(client: HttpClient, api_url: &str) -> Result<Self, DownloadError> {
        let normalized = if api_url.ends_with('/') {
            api_url.to_string()
        } else {
            format!("{api_url}/")
        };
        let api_url = Url::parse(&normalized).map_err(|_| DownloadError::invalid_url(api_url))?;
        Ok(Self {
            client,
            api_url,
            token: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ResolveError> {
        self.api_url.join(path).map_err(|_| {
            ResolveError::lookup(REDGIFS, DownloadError::invalid_url(path))
        })
    }

    async fn token(&self) -> Result<String, ResolveError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let url = self.endpoint("v2/auth/temporary")?;
        let body = self
            .client
            .get_json(url.as_str(), None)
            .await
            .map_err(|e| ResolveError::lookup(REDGIFS, e))?;
        let token = body
            .get("token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ResolveError::malformed(REDGIFS, "auth", "missing token"))?
            .to_string();
        debug!("obtained temporary redgifs token");
        *cached = Some(token.clone());
        Ok(token)
    }
}

#[async_trait]
impl ProviderResolver for RedgifsResolver {
    fn name(&self) -> &str {
        REDGIFS
    }

    fn can_handle(&self, host: &str) -> bool {
        host == "redgifs.com" || host.ends_with(".redgifs.com")
    }

    /// `https://www.redgifs.com/watch/HappyGreenFox` and
    /// `https://i.redgifs.com/i/happygreenfox.jpg` both yield `happygreenfox`.
    fn extract_id(&self, url: &Url) -> Option<String> {
        let last = url
            .path_segments()?
            .filter(|segment| !segment.is_empty())
            .next_back()?;
        let id = last.split('.').next()?.to_ascii_lowercase();
        (!id.is_empty()).then_some(id)
    }

    #[instrument(skip(self))]
    async fn resolve(&self, id: &str) -> Result<Vec<String>, ResolveError> {
        let token = self.token().await?;
        let url = self.endpoint(&format!("v2/gifs/{id}"))?;

        let body = match self.client.get_json(url.as_str(), Some(&token)).await {
            Ok(body) => body,
            Err(error) => {
                if matches!(error, DownloadError::HttpStatus { status: 401, .. }) {
                    *self.token.lock().await = None;
                }
                return Err(ResolveError::lookup(REDGIFS, error));
            }
        };

        let urls = body
            .get("gif")
            .and_then(|gif| gif.get("urls"))
            .ok_or_else(|| ResolveError::malformed(REDGIFS, id, "missing gif.urls"))?;
        let best = ["hd", "sd"]
            .iter()
            .find_map(|key| urls.get(*key).and_then(Value::as_str))
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ResolveError::malformed(REDGIFS, id, "no hd or sd rendition"))?;

        Ok(vec![best.to_string()])
    }
}

impl fmt::Debug for RedgifsResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedgifsResolver")
            .field("api_url", &self.api_url.as_str())
            .finish_non_exhaustive()
    }
}

use std::sync::Arc;

use tracing::{debug, warn};

use super::{
    AcquisitionTask, MediaKind, ProviderRegistry, ResolveError, classify, plan_provider_tasks,
    plan_tasks,
};
use crate::download::{RetryPolicy, retry_with_policy};
use crate::source::ItemDescriptor;

/// Turns items into acquisition tasks.
///
/// An item that cannot be planned is reported through [`ResolveError`]; the
/// caller still ledgers it with nothing acquired. Provider lookups are retried
/// under the shared policy before giving up.
#[derive(Debug, Clone)]
pub struct MediaResolver {
    providers: Arc<ProviderRegistry>,
    retry_policy: RetryPolicy,
}

impl MediaResolver {
    #[must_use]
    pub fn new(providers: Arc<ProviderRegistry>, retry_policy: RetryPolicy) -> Self {
        Self {
            providers,
            retry_policy,
        }
    }

    #[must_use]
    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Classifies `item` and plans its tasks, querying a provider if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Unsupported`] when the item carries no
    /// recognisable media, [`ResolveError::NoMedia`] when it was recognised but
    /// nothing is left to fetch, and the provider's last error when a lookup
    /// fails after retries.
    pub async fn resolve(&self, item: &ItemDescriptor) -> Result<Vec<AcquisitionTask>, ResolveError> {
        let kind = classify(item, &self.providers);
        match &kind {
            MediaKind::Unsupported => {
                return Err(ResolveError::Unsupported {
                    url: item.source_url.clone(),
                });
            }
            MediaKind::Gallery(entries) if entries.is_empty() => {
                return Err(ResolveError::NoMedia {
                    origin: "gallery".to_string(),
                });
            }
            _ => {}
        }
        if let Some(tasks) = plan_tasks(item, &kind) {
            debug!(item_id = %item.id, tasks = tasks.len(), "planned tasks");
            return Ok(tasks);
        }

        let MediaKind::Provider {
            provider,
            opaque_id,
        } = kind
        else {
            return Err(ResolveError::Unsupported {
                url: item.source_url.clone(),
            });
        };
        let Some(resolver) = self.providers.by_name(&provider) else {
            return Err(ResolveError::NoMedia { origin: provider });
        };

        let lookup = retry_with_policy(&self.retry_policy, |_| resolver.resolve(&opaque_id)).await;
        match lookup {
            Ok(urls) if urls.is_empty() => {
                warn!(item_id = %item.id, %provider, "provider returned no media");
                Err(ResolveError::NoMedia { origin: provider })
            }
            Ok(urls) => Ok(plan_provider_tasks(
                item,
                &provider,
                resolver.default_extension(),
                &urls,
            )),
            Err((error, attempts)) => {
                warn!(item_id = %item.id, attempts, error = %error, "provider lookup failed");
                Err(error)
            }
        }
    }
}

//! JSON listing endpoint in the `data.children[].data` shape.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use super::{ItemDescriptor, SourceApi, SourceError, SourceSpec};
use crate::download::{DownloadError, HttpClient, RetryPolicy, retry_with_policy};

/// Default base URL for listings.
pub const DEFAULT_LISTING_BASE_URL: &str = "https://www.reddit.com/";

/// Largest page the listing endpoint serves.
const MAX_PAGE_SIZE: usize = 100;

/// With a prefilter, up to `limit * FETCH_MULTIPLIER` items are scanned to
/// find `limit` that pass it.
pub const FETCH_MULTIPLIER: usize = 3;

/// Upper bound on items scanned for one filtered source.
const MAX_SCANNED_ITEMS: usize = 1000;

/// Predicate deciding which listed items a source yields.
pub type ItemFilter = Arc<dyn Fn(&ItemDescriptor) -> bool + Send + Sync>;

/// [`SourceApi`] over a paged JSON listing endpoint.
///
/// Pages are requested as `{base}/{path}.json?limit=&after=&raw_json=1` and
/// followed through the `data.after` cursor until the spec's limit is reached
/// or the listing runs out.
///
/// With a prefilter, only matching items count towards the limit and paging
/// goes on over at most [`FETCH_MULTIPLIER`] times as many items.
#[derive(Clone)]
pub struct ListingSource {
    client: HttpClient,
    base_url: Url,
    retry_policy: RetryPolicy,
    prefilter: Option<ItemFilter>,
}

impl ListingSource {
    /// Creates a listing source rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidUrl`] if `base_url` is not an absolute URL.
    pub fn new(
        client: HttpClient,
        base_url: &str,
        retry_policy: RetryPolicy,
    ) -> Result<Self, DownloadError> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized).map_err(|_| DownloadError::invalid_url(base_url))?;
        Ok(Self {
            client,
            base_url,
            retry_policy,
            prefilter: None,
        })
    }

    /// Yields only items accepted by `filter`, e.g. those carrying media.
    #[must_use]
    pub fn with_prefilter(mut self, filter: ItemFilter) -> Self {
        self.prefilter = Some(filter);
        self
    }

    /// Most items worth scanning to fill `limit`.
    fn scan_budget(&self, limit: usize) -> usize {
        if self.prefilter.is_some() {
            limit
                .saturating_mul(FETCH_MULTIPLIER)
                .min(MAX_SCANNED_ITEMS)
                .max(limit)
        } else {
            limit
        }
    }

    fn page_url(&self, spec: &SourceSpec, limit: usize, after: Option<&str>) -> Result<Url, SourceError> {
        let mut url = self
            .base_url
            .join(&format!("{}.json", spec.path))
            .map_err(|e| SourceError::InvalidSpec {
                spec: spec.to_string(),
                reason: e.to_string(),
            })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            if let Some(after) = after {
                query.append_pair("after", after);
            }
            query.append_pair("raw_json", "1");
        }
        Ok(url)
    }
}

#[async_trait]
impl SourceApi for ListingSource {
    #[instrument(skip(self), fields(source = %spec.tag))]
    async fn fetch(&self, spec: &SourceSpec) -> Result<Vec<ItemDescriptor>, SourceError> {
        let mut items = Vec::new();
        let mut after: Option<String> = None;
        let budget = self.scan_budget(spec.limit);
        let mut scanned = 0;

        while items.len() < spec.limit && scanned < budget {
            let page_size = (budget - scanned).min(MAX_PAGE_SIZE);
            let url = self.page_url(spec, page_size, after.as_deref())?;

            let body = retry_with_policy(&self.retry_policy, |_| {
                self.client.get_json(url.as_str(), None)
            })
            .await
            .map_err(|(source, _)| SourceError::Fetch {
                tag: spec.tag.clone(),
                source,
            })?;

            let (page, next) = parse_listing(&body).map_err(|reason| SourceError::Malformed {
                tag: spec.tag.clone(),
                reason,
            })?;
            debug!(page_items = page.len(), has_next = next.is_some(), "listing page");

            if page.is_empty() {
                break;
            }
            scanned += page.len();
            match &self.prefilter {
                Some(accept) => {
                    let before = items.len();
                    items.extend(page.into_iter().filter(|item| accept(item)));
                    debug!(accepted = items.len() - before, scanned, "prefiltered page");
                }
                None => items.extend(page),
            }

            match next {
                Some(cursor) => after = Some(cursor),
                None => break,
            }
        }

        items.truncate(spec.limit);
        Ok(items)
    }
}

impl fmt::Debug for ListingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListingSource")
            .field("base_url", &self.base_url.as_str())
            .field("retry_policy", &self.retry_policy)
            .field("prefiltered", &self.prefilter.is_some())
            .finish_non_exhaustive()
    }
}

/// Splits a listing page into descriptors and the next-page cursor.
///
/// Children missing an id, collection, or timestamp are dropped.
fn parse_listing(body: &Value) -> Result<(Vec<ItemDescriptor>, Option<String>), String> {
    let data = body
        .get("data")
        .ok_or_else(|| "missing 'data' object".to_string())?;
    let children = data
        .get("children")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing 'data.children' array".to_string())?;

    let items = children
        .iter()
        .filter_map(|child| {
            let descriptor = descriptor_from_child(child);
            if descriptor.is_none() {
                debug!("skipping malformed listing child");
            }
            descriptor
        })
        .collect();

    let next = data
        .get("after")
        .and_then(Value::as_str)
        .filter(|cursor| !cursor.is_empty())
        .map(str::to_string);

    Ok((items, next))
}

#[allow(clippy::cast_possible_truncation)]
fn descriptor_from_child(child: &Value) -> Option<ItemDescriptor> {
    let data = child.get("data")?;
    let id = data.get("id")?.as_str()?.to_string();
    let collection = data.get("subreddit")?.as_str()?.to_string();
    let created_secs = data.get("created_utc")?.as_f64()?;
    if !created_secs.is_finite() {
        return None;
    }
    let created_at = DateTime::from_timestamp(created_secs.floor() as i64, 0)?;
    let source_url = data
        .get("url")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some(ItemDescriptor {
        id,
        collection,
        created_at,
        source_url,
        raw: data.clone(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, ResponseTemplate};

    use super::*;
    use crate::media::{ProviderRegistry, is_media_item};
    use crate::test_support::socket_guard::start_mock_server_or_skip;

    fn child(id: &str) -> Value {
        json!({
            "kind": "t3",
            "data": {
                "id": id,
                "subreddit": "pics",
                "created_utc": 1_704_067_200.0,
                "url": format!("https://i.redd.it/{id}.jpg"),
            }
        })
    }

    fn self_post(id: &str) -> Value {
        json!({
            "kind": "t3",
            "data": {
                "id": id,
                "subreddit": "pics",
                "created_utc": 1_704_067_200.0,
                "is_self": true,
                "url": format!("https://www.reddit.com/r/pics/comments/{id}/"),
            }
        })
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2), 2.0)
            .jitter(Duration::ZERO)
    }

    #[test]
    fn test_parse_listing_extracts_fields() {
        let body = json!({"data": {"children": [child("abc")], "after": "t3_abc"}});
        let (items, next) = parse_listing(&body).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "abc");
        assert_eq!(items[0].collection, "pics");
        assert_eq!(items[0].created_at.timestamp(), 1_704_067_200);
        assert_eq!(items[0].source_url, "https://i.redd.it/abc.jpg");
        assert_eq!(items[0].raw["id"], "abc");
        assert_eq!(next.as_deref(), Some("t3_abc"));
    }

    #[test]
    fn test_parse_listing_skips_malformed_children() {
        let body = json!({"data": {"children": [{"data": {"id": "x"}}, child("ok")], "after": null}});
        let (items, next) = parse_listing(&body).unwrap();
        assert_eq!(items.len(), 1);
        assert!(next.is_none());
    }

    #[test]
    fn test_parse_listing_rejects_wrong_shape() {
        assert!(parse_listing(&json!({"error": 403})).is_err());
    }

    #[tokio::test]
    async fn test_fetch_follows_cursor_until_limit() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };

        Mock::given(method("GET"))
            .and(path("/r/pics.json"))
            .and(query_param("after", "t3_b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"data": {"children": [child("c"), child("d")], "after": "t3_d"}}),
            ))
            .with_priority(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/r/pics.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"data": {"children": [child("a"), child("b")], "after": "t3_b"}}),
            ))
            .with_priority(5)
            .mount(&mock_server)
            .await;

        let source = ListingSource::new(HttpClient::new().unwrap(), &mock_server.uri(), fast_policy())
            .unwrap();
        let items = source
            .fetch(&SourceSpec::new("front", "r/pics", 3))
            .await
            .unwrap();

        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_fetch_retries_then_reports_source_error() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&mock_server)
            .await;

        let source = ListingSource::new(HttpClient::new().unwrap(), &mock_server.uri(), fast_policy())
            .unwrap();
        let result = source.fetch(&SourceSpec::new("front", "r/pics", 5)).await;
        assert!(matches!(result, Err(SourceError::Fetch { .. })));
    }

    #[test]
    fn test_scan_budget_applies_multiplier_only_with_prefilter() {
        let source = ListingSource::new(HttpClient::new().unwrap(), "https://example.com", fast_policy())
            .unwrap();
        assert_eq!(source.scan_budget(50), 50);

        let source = source.with_prefilter(Arc::new(|_: &ItemDescriptor| true));
        assert_eq!(source.scan_budget(50), 50 * FETCH_MULTIPLIER);
        assert_eq!(source.scan_budget(900), MAX_SCANNED_ITEMS);
        assert_eq!(source.scan_budget(2000), 2000);
    }

    #[tokio::test]
    async fn test_fetch_front_page_keeps_only_media_items() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };

        Mock::given(method("GET"))
            .and(path("/best.json"))
            .and(query_param("after", "t3_s2"))
            .and(query_param("limit", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"data": {"children": [child("b"), child("c")], "after": null}}),
            ))
            .with_priority(1)
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/best.json"))
            .and(query_param("limit", "6"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {
                "children": [self_post("s1"), child("a"), self_post("s2")],
                "after": "t3_s2"
            }})))
            .with_priority(5)
            .expect(1)
            .mount(&mock_server)
            .await;

        let providers = Arc::new(ProviderRegistry::new());
        let source = ListingSource::new(HttpClient::new().unwrap(), &mock_server.uri(), fast_policy())
            .unwrap()
            .with_prefilter(Arc::new(move |item: &ItemDescriptor| is_media_item(item, &providers)));
        let spec: SourceSpec = "front=/best:2".parse().unwrap();
        let items = source.fetch(&spec).await.unwrap();

        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}

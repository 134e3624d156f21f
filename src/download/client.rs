//! HTTP client wrapper shared by every network-facing stage.
//!
//! This module provides the `HttpClient` struct which streams payloads to an
//! exact destination path and fetches small JSON documents (listings, provider
//! lookups) with proper timeout configuration and error handling.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use crate::user_agent;

/// HTTP client for streaming downloads and JSON lookups.
///
/// This client is designed to be created once and reused, taking advantage of
/// connection pooling. Clones share the same pool.
///
/// # Example
///
/// ```no_run
/// use harvester_core::download::HttpClient;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new()?;
/// let bytes = client
///     .download_to_path("https://i.redd.it/abc.jpg", Path::new("./media/abc.jpg.part"))
///     .await?;
/// println!("Fetched {bytes} bytes");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a new HTTP client with default timeouts.
    ///
    /// Default configuration:
    /// - Connect timeout: 30 seconds
    /// - Read timeout: 5 minutes
    /// - Gzip decompression: enabled
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if the TLS backend cannot be
    /// initialised.
    pub fn new() -> Result<Self, DownloadError> {
        Self::new_with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a new HTTP client with explicit timeout values.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if the client cannot be built.
    pub fn new_with_timeouts(
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .build()
            .map_err(DownloadError::ClientBuild)?;
        Ok(Self { client })
    }

    /// Streams the body of `url` into `dest`, returning the number of bytes
    /// written.
    ///
    /// `dest` is created or truncated. On any error the partially written file
    /// is removed.
    ///
    /// # Errors
    ///
    /// Returns a [`DownloadError`] describing the network, HTTP, or IO failure.
    #[instrument(skip(self, dest), fields(url = %url, dest = %dest.display()))]
    pub async fn download_to_path(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let response = self.send_request(url, None).await?;
        let content_length = response.content_length();

        let mut file = File::create(dest)
            .await
            .map_err(|e| DownloadError::io(dest, e))?;

        let result = stream_to_file(&mut file, response, url, dest).await;
        drop(file);

        let outcome = match result {
            Ok(written) => match content_length {
                Some(expected) if expected != written => {
                    Err(DownloadError::integrity(dest, expected, written))
                }
                _ => Ok(written),
            },
            Err(e) => Err(e),
        };

        if outcome.is_err() {
            debug!(path = %dest.display(), "cleaning up partial file after error");
            let _ = tokio::fs::remove_file(dest).await;
        }

        let bytes = outcome?;
        debug!(bytes, "download complete");
        Ok(bytes)
    }

    /// Fetches `url` and decodes the body as JSON.
    ///
    /// When `bearer` is set it is sent as an `Authorization: Bearer` header.
    ///
    /// # Errors
    ///
    /// Returns a [`DownloadError`] for network and HTTP failures, or
    /// [`DownloadError::Decode`] if the body is not valid JSON.
    #[instrument(skip(self, bearer), fields(url = %url))]
    pub async fn get_json(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<serde_json::Value, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let response = self.send_request(url, bearer).await?;
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;
        serde_json::from_slice(&body).map_err(|e| DownloadError::decode(url, e))
    }

    async fn send_request(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<reqwest::Response, DownloadError> {
        let mut request = self.client.get(url);
        if let Some(token) = bearer {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(std::string::ToString::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                url,
                response.status().as_u16(),
                retry_after,
            ));
        }

        Ok(response)
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

/// Streams response body to file, returning bytes written.
async fn stream_to_file(
    file: &mut File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;

        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;

    Ok(bytes_written)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    #[tokio::test]
    async fn test_download_to_path_writes_exact_destination() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/abc.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg bytes"))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new().unwrap();
        let dest = temp_dir.path().join("pics-abc.jpg.part");
        let bytes = client
            .download_to_path(&format!("{}/abc.jpg", mock_server.uri()), &dest)
            .await
            .unwrap();

        assert_eq!(bytes, 10);
        assert_eq!(std::fs::read(&dest).unwrap(), b"jpeg bytes");
    }

    #[tokio::test]
    async fn test_download_to_path_404_leaves_nothing_behind() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/gone.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new().unwrap();
        let dest = temp_dir.path().join("gone.jpg.part");
        let result = client
            .download_to_path(&format!("{}/gone.jpg", mock_server.uri()), &dest)
            .await;

        assert!(matches!(
            result,
            Err(DownloadError::HttpStatus { status: 404, .. })
        ));
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_download_to_path_captures_retry_after() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "12"))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new().unwrap();
        let result = client
            .download_to_path(
                &format!("{}/busy.mp4", mock_server.uri()),
                &temp_dir.path().join("busy.mp4.part"),
            )
            .await;

        match result {
            Err(DownloadError::HttpStatus {
                status: 429,
                retry_after,
                ..
            }) => assert_eq!(retry_after.as_deref(), Some("12")),
            other => panic!("expected 429, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_download_cleanup_on_read_timeout() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"data")
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&mock_server)
            .await;

        let client = HttpClient::new_with_timeouts(30, 1).unwrap();
        let result = client
            .download_to_path(
                &format!("{}/slow", mock_server.uri()),
                &temp_dir.path().join("slow.part"),
            )
            .await;

        assert!(result.is_err(), "expected timeout or network error");
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_download_invalid_url() {
        let temp_dir = TempDir::new().unwrap();
        let client = HttpClient::new().unwrap();
        let result = client
            .download_to_path("not-a-valid-url", &temp_dir.path().join("x.part"))
            .await;
        assert!(matches!(result, Err(DownloadError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_get_json_sends_bearer_and_decodes() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };

        Mock::given(method("GET"))
            .and(path("/v2/gifs/abc"))
            .and(header("Authorization", "Bearer tok"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"gif": {"id": "abc"}})),
            )
            .mount(&mock_server)
            .await;

        let client = HttpClient::new().unwrap();
        let body = client
            .get_json(&format!("{}/v2/gifs/abc", mock_server.uri()), Some("tok"))
            .await
            .unwrap();
        assert_eq!(body["gif"]["id"], "abc");
    }

    #[tokio::test]
    async fn test_get_json_malformed_body() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new().unwrap();
        let result = client
            .get_json(&format!("{}/listing.json", mock_server.uri()), None)
            .await;
        assert!(matches!(result, Err(DownloadError::Decode { .. })));
    }

    #[tokio::test]
    async fn test_default_user_agent_identifies_harvester() {
        use wiremock::{Match, Request};

        struct HarvesterUaMatcher;

        impl Match for HarvesterUaMatcher {
            fn matches(&self, request: &Request) -> bool {
                request
                    .headers
                    .get("User-Agent")
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|ua| {
                        ua.contains("media-harvester") && ua.contains(env!("CARGO_PKG_VERSION"))
                    })
            }
        }

        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };

        Mock::given(method("GET"))
            .and(HarvesterUaMatcher)
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new().unwrap();
        let result = client
            .get_json(&format!("{}/ua", mock_server.uri()), None)
            .await;
        assert!(result.is_ok(), "client must send its User-Agent: {result:?}");
    }
}

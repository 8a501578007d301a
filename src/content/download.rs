use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RESOURCE_SIZE: usize = 50 * 1024 * 1024; // 50MB

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Authentication rejected: status {0}")]
    Auth(u16),
    #[error("Empty response body")]
    EmptyBody,
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Download cancelled")]
    Cancelled,
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<DownloadError>,
    },
}

impl DownloadError {
    /// Returns true for transport-level failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Timeout(_)
            | DownloadError::Network(_)
            | DownloadError::HttpStatus(_)
            | DownloadError::EmptyBody
            | DownloadError::IncompleteResponse { .. }
            | DownloadError::Io(_) => true,
            DownloadError::Auth(_)
            | DownloadError::ResponseTooLarge(_)
            | DownloadError::InvalidUrl(_)
            | DownloadError::Cancelled
            | DownloadError::Exhausted { .. } => false,
        }
    }
}

/// A single attempt at fetching a resource's bytes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<Bytes, DownloadError>;
}

/// `reqwest`-backed transport with a per-request timeout and a size cap.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
    max_size: usize,
    headers: HeaderMap,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, timeout: Duration, max_size: usize) -> Self {
        Self {
            client,
            timeout,
            max_size,
            headers: HeaderMap::new(),
        }
    }

    /// Headers sent with every download, e.g. the `Referer` and
    /// `User-Agent` a CDN checks before serving media. A configured name
    /// replaces the built-in `Accept`/`Cache-Control` value.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<Bytes, DownloadError> {
        let parsed = url::Url::parse(url).map_err(|e| DownloadError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::InvalidUrl(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }

        let request = self
            .client
            .get(parsed)
            .header("Accept", "*/*")
            .header("Cache-Control", "no-cache")
            .headers(self.headers.clone());

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| DownloadError::Timeout(self.timeout))?
            .map_err(DownloadError::Network)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(DownloadError::Auth(status.as_u16()));
        }
        if !status.is_success() {
            return Err(DownloadError::HttpStatus(status.as_u16()));
        }

        let body = tokio::time::timeout(self.timeout, read_limited_bytes(response, self.max_size))
            .await
            .map_err(|_| DownloadError::Timeout(self.timeout))??;
        if body.is_empty() {
            return Err(DownloadError::EmptyBody);
        }
        Ok(body)
    }
}

async fn read_limited_bytes(response: reqwest::Response, limit: usize) -> Result<Bytes, DownloadError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(DownloadError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = BytesMut::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(DownloadError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(DownloadError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(DownloadError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes.freeze())
}

/// Bounded exponential backoff: the wait before retry `i` (0-indexed) is
/// `backoff_base * 2^i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }
}

/// Fetches resource bytes, retrying transport failures with backoff.
#[derive(Clone)]
pub struct RetryingDownloader {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RetryingDownloader {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Download `url`, making at most `max_retries + 1` attempts.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::Cancelled`] - `cancel` fired during an attempt or a backoff sleep
    /// - [`DownloadError::Exhausted`] - every attempt failed with a retryable error
    /// - any non-retryable error from the transport, returned immediately
    pub async fn download(&self, url: &str, cancel: &CancellationToken) -> Result<Bytes, DownloadError> {
        let mut attempt = 0u32;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                outcome = self.transport.get(url) => outcome,
            };

            match outcome {
                Ok(bytes) => {
                    if attempt > 0 {
                        tracing::debug!(url = %url, attempts = attempt + 1, "Resource downloaded after retry");
                    }
                    return Ok(bytes);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::debug!(
                        url = %url,
                        error = %e,
                        retry = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying resource download after transient error"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(url = %url, error = %e, attempts = attempt + 1, "Resource download retries exhausted");
                    return Err(DownloadError::Exhausted {
                        attempts: attempt + 1,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

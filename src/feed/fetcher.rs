use crate::feed::types::{FeedItem, Subscription};
use std::time::Duration;
use thiserror::Error;

/// Default bound on a single upstream feed request.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Errors that can occur while fetching a feed batch from upstream.
///
/// Every variant maps onto one [`FetchErrorKind`]; callers decide what to do
/// based on the kind, never on the concrete variant.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Upstream rejected our credentials; re-authentication is external
    #[error("Authentication rejected: {0}")]
    Auth(String),
    /// Response could not be understood as a batch of items
    #[error("Malformed response: {0}")]
    Malformed(String),
    /// Response body exceeded the size limit
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    /// The polling task was cancelled
    #[error("Fetch cancelled")]
    Cancelled,
}

/// Coarse classification used by the polling engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Skip this cycle for the key; the next tick retries naturally.
    Transient,
    /// Surface upward; no retry, no state change.
    Auth,
    /// Drop the batch with a diagnostic.
    Malformed,
    Cancelled,
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Network(_) | FetchError::Timeout(_) => FetchErrorKind::Transient,
            FetchError::HttpStatus(401 | 403) | FetchError::Auth(_) => FetchErrorKind::Auth,
            FetchError::HttpStatus(_) => FetchErrorKind::Transient,
            FetchError::Malformed(_) | FetchError::ResponseTooLarge(_) => FetchErrorKind::Malformed,
            FetchError::Cancelled => FetchErrorKind::Cancelled,
        }
    }
}

/// Retrieves raw batches for subscriptions and puts them into a known order.
///
/// Upstream batches are documented as newest-first but have been observed out
/// of order, so every batch is re-sorted by `timestamp_ms` descending here.
/// Exact duplicates (same timestamp and payload) are dropped at the same time.
///
/// There is deliberately no retry loop: a failed fetch skips the cycle for
/// that key and the next scheduled tick tries again.
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    timeout: Duration,
}

impl Default for FeedFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_FETCH_TIMEOUT)
    }
}

impl FeedFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch one batch for `subscription`, newest first.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Timeout`] - the source did not answer within the timeout
    /// - any error reported by the source itself
    pub async fn fetch_raw(&self, subscription: &Subscription) -> Result<Vec<FeedItem>, FetchError> {
        let key = &subscription.key;
        let mut items = tokio::time::timeout(self.timeout, subscription.source.fetch(key))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))??;

        // Sources may build items for a different key (shared endpoints);
        // the subscription owns whatever it fetched.
        for item in &mut items {
            if item.source_key != *key {
                item.source_key = key.clone();
            }
        }

        let received = items.len();
        let items = sort_newest_first(items);
        if items.len() < received {
            tracing::debug!(
                key = %key,
                duplicates = received - items.len(),
                "Dropped duplicate upstream items"
            );
        }

        Ok(items)
    }
}

/// Stable sort by timestamp descending, then drop exact duplicates within
/// each run of equal timestamps.
pub fn sort_newest_first(mut items: Vec<FeedItem>) -> Vec<FeedItem> {
    items.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));

    let mut out: Vec<FeedItem> = Vec::with_capacity(items.len());
    let mut run_start = 0;
    for item in items {
        if out
            .last()
            .map_or(true, |last| last.timestamp_ms != item.timestamp_ms)
        {
            run_start = out.len();
        }
        if out[run_start..].iter().any(|seen| seen.payload == item.payload) {
            continue;
        }
        out.push(item);
    }
    out
}

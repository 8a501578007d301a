//! The polling engine: one place that ties a subscription's fetch, its
//! watermark and the resource cache together.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

use crate::content::{CacheError, ResourceCache, ResourceHandle};
use crate::feed::{
    filter, merge_cycle, DeliveryBatch, FeedFetcher, FeedItem, FetchError, FetchErrorKind,
    Subscription, SubscriptionKey,
};
use crate::storage::WatermarkStore;

/// Default fan-out of one polling cycle.
pub const DEFAULT_MAX_CONCURRENT_POLLS: usize = 8;

// ============================================================================
// Error Types
// ============================================================================

/// A failed poll of one subscription. Watermark state is untouched.
#[derive(Debug, Error)]
#[error("Poll of {key} failed: {source}")]
pub struct PollError {
    pub key: SubscriptionKey,
    #[source]
    pub source: FetchError,
}

impl PollError {
    pub fn kind(&self) -> FetchErrorKind {
        self.source.kind()
    }
}

/// Outcome of [`Engine::run_cycle`].
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Merged new items, oldest first.
    pub batch: DeliveryBatch,
    /// One entry per subscription whose poll failed this cycle.
    pub failures: Vec<PollError>,
    /// Number of subscriptions polled.
    pub polled: usize,
    /// Resource URLs that could not be resolved; their items are still in `batch`.
    pub unresolved_resources: usize,
}

// ============================================================================
// Engine
// ============================================================================

/// Incremental polling over explicitly injected state.
///
/// Nothing here is process-global: the watermark store, the resource cache
/// and the fetcher are handed in, so several engines (or tests) can run side
/// by side.
#[derive(Clone)]
pub struct Engine {
    watermarks: Arc<WatermarkStore>,
    cache: ResourceCache,
    fetcher: FeedFetcher,
    max_concurrent: usize,
}

impl Engine {
    pub fn new(watermarks: Arc<WatermarkStore>, cache: ResourceCache, fetcher: FeedFetcher) -> Self {
        Self {
            watermarks,
            cache,
            fetcher,
            max_concurrent: DEFAULT_MAX_CONCURRENT_POLLS,
        }
    }

    pub fn with_concurrency(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn watermarks(&self) -> &Arc<WatermarkStore> {
        &self.watermarks
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Fetch `subscription` and return only the items it has not delivered
    /// before, oldest first.
    pub async fn poll(&self, subscription: &Subscription) -> Result<Vec<FeedItem>, PollError> {
        self.poll_at(subscription, Utc::now().timestamp_millis()).await
    }

    /// [`Engine::poll`] with an explicit "now", used for first-poll bootstrap.
    ///
    /// State changes happen only after the fetch succeeded, and they happen
    /// without an await in between, so a failed or cancelled poll leaves the
    /// watermark exactly as it was.
    pub async fn poll_at(&self, subscription: &Subscription, now_ms: i64) -> Result<Vec<FeedItem>, PollError> {
        let key = &subscription.key;
        let raw = self
            .fetcher
            .fetch_raw(subscription)
            .await
            .map_err(|source| PollError {
                key: key.clone(),
                source,
            })?;

        let watermark = self.watermarks.ensure_initialized(key, now_ms);
        let received = raw.len();
        let outcome = filter::apply(raw, watermark);

        if let Some(candidate) = outcome.watermark_candidate {
            self.watermarks.advance(key, candidate);
        }

        tracing::debug!(
            key = %key,
            received,
            new = outcome.items.len(),
            watermark,
            "Polled subscription"
        );
        Ok(outcome.items)
    }

    /// Local handle for a resource URL, downloaded at most once at a time.
    pub async fn resolve_resource(&self, url: &str) -> Result<ResourceHandle, CacheError> {
        self.cache.get_or_fetch(url).await
    }

    /// Merge per-subscription results of one cycle into a single batch.
    pub fn merge_cycle<I>(&self, per_subscription: I) -> DeliveryBatch
    where
        I: IntoIterator<Item = Vec<FeedItem>>,
    {
        merge_cycle(per_subscription)
    }

    /// Poll every subscription, resolve the resources of what is new, and
    /// merge everything into one batch.
    ///
    /// Subscriptions are polled concurrently up to the configured limit.
    /// Results are merged in subscription order regardless of completion
    /// order. A failing subscription is reported and skipped; the others
    /// proceed as if it were absent.
    pub async fn run_cycle(&self, subscriptions: &[Subscription]) -> CycleReport {
        let results: Vec<Result<Vec<FeedItem>, PollError>> = stream::iter(subscriptions.iter().map(|subscription| self.poll(subscription)).collect::<Vec<_>>())
            .buffered(self.max_concurrent)
            .collect()
            .await;

        let mut report = CycleReport {
            polled: subscriptions.len(),
            ..CycleReport::default()
        };

        let mut fresh = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(items) => fresh.push(items),
                Err(e) => {
                    log_poll_failure(&e);
                    report.failures.push(e);
                }
            }
        }

        report.unresolved_resources = self.attach_resources(&mut fresh).await;
        report.batch = merge_cycle(fresh);

        if !report.failures.is_empty() || !report.batch.is_empty() {
            tracing::info!(
                polled = report.polled,
                failed = report.failures.len(),
                items = report.batch.len(),
                unresolved_resources = report.unresolved_resources,
                "Polling cycle complete"
            );
        }
        report
    }

    /// Resolve every resource URL referenced by `items` and fill in the local
    /// handles. Returns how many URLs failed.
    async fn attach_resources(&self, per_subscription: &mut [Vec<FeedItem>]) -> usize {
        let urls: BTreeSet<String> = per_subscription
            .iter()
            .flatten()
            .flat_map(|item| item.resources.iter().map(|r| r.url.clone()))
            .collect();
        if urls.is_empty() {
            return 0;
        }

        let mut resolved: HashMap<String, ResourceHandle> = HashMap::with_capacity(urls.len());
        let mut failed = 0;
        for (url, result) in self.cache.resolve_all(urls.iter().map(String::as_str)).await {
            match result {
                Ok(handle) => {
                    resolved.insert(url, handle);
                }
                Err(e) => {
                    failed += 1;
                    if e.is_cancelled() {
                        tracing::debug!(url = %url, "Resource fetch cancelled");
                    } else {
                        tracing::warn!(url = %url, error = %e, "Delivering item without resource");
                    }
                }
            }
        }

        for resource in per_subscription
            .iter_mut()
            .flatten()
            .flat_map(|item| item.resources.iter_mut())
        {
            resource.local = resolved.get(&resource.url).cloned();
        }
        failed
    }
}

fn log_poll_failure(e: &PollError) {
    match e.kind() {
        FetchErrorKind::Transient => {
            tracing::warn!(key = %e.key, error = %e.source, "Skipping cycle after transient failure")
        }
        FetchErrorKind::Auth => {
            tracing::error!(key = %e.key, error = %e.source, "Upstream rejected credentials; re-authentication required")
        }
        FetchErrorKind::Malformed => {
            tracing::warn!(key = %e.key, error = %e.source, "Dropped malformed batch")
        }
        FetchErrorKind::Cancelled => tracing::debug!(key = %e.key, "Poll cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{CachePolicy, DownloadError, RetryPolicy, RetryingDownloader, Transport};
    use crate::feed::FeedSource;
    use async_trait::async_trait;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Serves a scripted sequence of batches, one per fetch.
    struct ScriptedSource {
        batches: Mutex<Vec<Result<Vec<i64>, FetchError>>>,
    }

    impl ScriptedSource {
        fn new(batches: Vec<Result<Vec<i64>, FetchError>>) -> Self {
            Self {
                batches: Mutex::new(batches),
            }
        }
    }

    #[async_trait]
    impl FeedSource for ScriptedSource {
        async fn fetch(&self, key: &SubscriptionKey) -> Result<Vec<FeedItem>, FetchError> {
            let next = self.batches.lock().unwrap().remove(0);
            next.map(|times| {
                times
                    .into_iter()
                    .map(|t| FeedItem::new(key.clone(), t, json!({ "t": t })))
                    .collect()
            })
        }
    }

    struct NoNetwork;

    #[async_trait]
    impl Transport for NoNetwork {
        async fn get(&self, _url: &str) -> Result<Bytes, DownloadError> {
            Err(DownloadError::HttpStatus(503))
        }
    }

    fn engine() -> Engine {
        let dir = std::env::temp_dir().join(format!("feedwarden_engine_{}", std::process::id()));
        let downloader = RetryingDownloader::new(
            Arc::new(NoNetwork),
            RetryPolicy {
                max_retries: 0,
                backoff_base: Duration::from_millis(1),
            },
        );
        let cache = ResourceCache::new(CachePolicy::new(dir), downloader, CancellationToken::new());
        Engine::new(Arc::new(WatermarkStore::in_memory()), cache, FeedFetcher::default())
    }

    fn subscription(name: &str, source: ScriptedSource) -> Subscription {
        Subscription::new("room", SubscriptionKey::scoped(name, "g"), Arc::new(source))
    }

    fn times(items: &[FeedItem]) -> Vec<i64> {
        items.iter().map(|i| i.timestamp_ms).collect()
    }

    #[tokio::test]
    async fn test_first_poll_delivers_no_backlog() {
        let engine = engine();
        let sub = subscription("r", ScriptedSource::new(vec![Ok(vec![900, 500, 100])]));

        let items = engine.poll_at(&sub, 1_000).await.unwrap();
        assert!(items.is_empty());
        assert_eq!(engine.watermarks().get(&sub.key), Some(1_000));
    }

    #[tokio::test]
    async fn test_second_poll_delivers_only_new_items() {
        let engine = engine();
        let sub = subscription(
            "r",
            ScriptedSource::new(vec![Ok(vec![900]), Ok(vec![1_300, 1_100, 1_000, 900])]),
        );

        engine.poll_at(&sub, 1_000).await.unwrap();
        let items = engine.poll_at(&sub, 2_000).await.unwrap();

        assert_eq!(times(&items), vec![1_100, 1_300]);
        assert_eq!(engine.watermarks().get(&sub.key), Some(1_300));
    }

    #[tokio::test]
    async fn test_failed_first_poll_does_not_bootstrap() {
        let engine = engine();
        let sub = subscription(
            "r",
            ScriptedSource::new(vec![Err(FetchError::Auth("expired".into()))]),
        );

        let err = engine.poll_at(&sub, 1_000).await.unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::Auth);
        assert_eq!(engine.watermarks().get(&sub.key), None);
    }

    #[tokio::test]
    async fn test_run_cycle_isolates_failures() {
        let engine = engine();
        let a = subscription(
            "a",
            ScriptedSource::new(vec![Ok(vec![]), Err(FetchError::HttpStatus(502))]),
        );
        let b = subscription("b", ScriptedSource::new(vec![Ok(vec![]), Ok(vec![40, 20])]));
        engine.watermarks().advance(&a.key, 5);
        engine.watermarks().advance(&b.key, 5);

        // First cycle has nothing new for either key.
        let subs = vec![a.clone(), b.clone()];
        engine.run_cycle(&subs).await;

        let report = engine.run_cycle(&subs).await;
        assert_eq!(report.polled, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key, a.key);
        assert_eq!(report.batch.timestamps(), vec![20, 40]);
        assert_eq!(engine.watermarks().get(&a.key), Some(5));
        assert_eq!(engine.watermarks().get(&b.key), Some(40));
    }

    #[tokio::test]
    async fn test_unresolvable_resource_keeps_item() {
        struct WithImage;

        #[async_trait]
        impl FeedSource for WithImage {
            async fn fetch(&self, key: &SubscriptionKey) -> Result<Vec<FeedItem>, FetchError> {
                Ok(vec![FeedItem::new(key.clone(), 50, json!({}))
                    .with_resources(["http://127.0.0.1:9/a.jpg"])])
            }
        }

        let engine = engine();
        let sub = Subscription::new("room", SubscriptionKey::scoped("img", "g"), Arc::new(WithImage));
        engine.watermarks().advance(&sub.key, 10);

        let report = engine.run_cycle(std::slice::from_ref(&sub)).await;
        assert_eq!(report.batch.len(), 1);
        assert_eq!(report.unresolved_resources, 1);
        assert_eq!(report.batch.items[0].resources[0].local, None);
    }
}

use crate::content::download::{DownloadError, RetryingDownloader};
use crate::util::cache_file_name;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default TTL for cached resources (72 hours)
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(72 * 3600);
/// Default total size bound (512 MB)
pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The download failed; the entry was dropped so a later call retries.
    #[error("Download failed for {url}: {source}")]
    DownloadFailed {
        url: String,
        #[source]
        source: Arc<DownloadError>,
    },
}

impl CacheError {
    fn download_failed(url: &str, source: DownloadError) -> Self {
        CacheError::DownloadFailed {
            url: url.to_string(),
            source: Arc::new(source),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            CacheError::DownloadFailed { source, .. } => matches!(**source, DownloadError::Cancelled),
        }
    }
}

/// Local handle to a cached resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceHandle {
    pub url: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Capacity bounds and location of the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub dir: PathBuf,
    pub max_age: Duration,
    pub max_total_bytes: u64,
}

impl CachePolicy {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_age: DEFAULT_MAX_AGE,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
        }
    }
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub ready_entries: usize,
    pub pending_entries: usize,
    pub total_bytes: u64,
    /// Network downloads started since the cache was created.
    pub downloads: u64,
}

type SharedFetch = Shared<BoxFuture<'static, Result<ResourceHandle, CacheError>>>;

enum Slot {
    /// One in-flight fetch; every requester awaits a clone of it.
    Pending { id: u64, fetch: SharedFetch },
    Ready(ReadyEntry),
}

struct ReadyEntry {
    handle: ResourceHandle,
    fetched_at: Instant,
    last_access: Instant,
}

struct Inner {
    entries: DashMap<String, Slot>,
    downloader: RetryingDownloader,
    policy: CachePolicy,
    total_bytes: AtomicU64,
    next_id: AtomicU64,
    downloads: AtomicU64,
    cancel: CancellationToken,
}

/// Content-addressed resource cache keyed by source URL.
///
/// At most one fetch per URL is in flight at any time: concurrent callers
/// attach to the pending fetch and all observe its outcome. Successes are
/// cached; failures remove the entry so the next call starts from scratch.
///
/// The entry table is a sharded map, so unrelated URLs never contend on one
/// lock, and no shard lock is held while a download is running.
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<Inner>,
}

impl ResourceCache {
    pub fn new(policy: CachePolicy, downloader: RetryingDownloader, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                downloader,
                policy,
                total_bytes: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                downloads: AtomicU64::new(0),
                cancel,
            }),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    /// Return a local handle for `url`, downloading it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::DownloadFailed`] when the shared fetch fails. The
    /// failure is not remembered.
    pub async fn get_or_fetch(&self, url: &str) -> Result<ResourceHandle, CacheError> {
        let fetch = match self.inner.entries.entry(url.to_string()) {
            Entry::Occupied(mut occupied) => {
                let stale_size = match occupied.get_mut() {
                    Slot::Ready(ready) if ready.fetched_at.elapsed() < self.inner.policy.max_age => {
                        ready.last_access = Instant::now();
                        tracing::trace!(url = %url, "Resource cache hit");
                        return Ok(ready.handle.clone());
                    }
                    Slot::Ready(ready) => Some(ready.handle.size),
                    Slot::Pending { .. } => None,
                };
                match stale_size {
                    Some(size) => {
                        tracing::debug!(url = %url, "Cached resource expired, refetching");
                        self.inner.total_bytes.fetch_sub(size, Ordering::Relaxed);
                        let (id, fetch) = self.start_fetch(url);
                        occupied.insert(Slot::Pending {
                            id,
                            fetch: fetch.clone(),
                        });
                        fetch
                    }
                    None => match occupied.get() {
                        Slot::Pending { fetch, .. } => {
                            tracing::debug!(url = %url, "Joining in-flight resource fetch");
                            fetch.clone()
                        }
                        Slot::Ready(ready) => return Ok(ready.handle.clone()),
                    },
                }
            }
            Entry::Vacant(vacant) => {
                let (id, fetch) = self.start_fetch(url);
                vacant.insert(Slot::Pending {
                    id,
                    fetch: fetch.clone(),
                });
                fetch
            }
        };

        // Shard guard is released here; only the shared future is awaited.
        fetch.await
    }

    /// Resolve several URLs concurrently, keeping each URL's outcome.
    pub async fn resolve_all<'a, I>(&self, urls: I) -> Vec<(String, Result<ResourceHandle, CacheError>)>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let lookups = urls.into_iter().map(|url| async move {
            let result = self.get_or_fetch(url).await;
            (url.to_string(), result)
        });
        futures::future::join_all(lookups).await
    }

    /// Drop expired entries, then least-recently-used entries until the
    /// total size fits the policy. Pending entries are never evicted.
    ///
    /// Returns the number of entries removed.
    pub async fn evict(&self) -> usize {
        self.inner.evict_except(None).await
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            total_bytes: self.inner.total_bytes.load(Ordering::Relaxed),
            downloads: self.inner.downloads.load(Ordering::Relaxed),
            ..CacheStats::default()
        };
        for entry in self.inner.entries.iter() {
            match entry.value() {
                Slot::Pending { .. } => stats.pending_entries += 1,
                Slot::Ready(_) => stats.ready_entries += 1,
            }
        }
        stats
    }

    fn start_fetch(&self, url: &str) -> (u64, SharedFetch) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let url = url.to_string();

        let fetch = async move {
            let result = inner.fetch_into_cache(&url).await;
            inner.complete(&url, id, &result).await;
            result
        }
        .boxed()
        .shared();

        (id, fetch)
    }
}

impl Inner {
    async fn fetch_into_cache(&self, url: &str) -> Result<ResourceHandle, CacheError> {
        let path = self.policy.dir.join(cache_file_name(url));

        if let Some(handle) = self.adopt_from_disk(url, &path).await {
            tracing::debug!(url = %url, path = %path.display(), "Adopted resource already on disk");
            return Ok(handle);
        }

        self.downloads.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(url = %url, "Downloading resource");
        let bytes = self
            .downloader
            .download(url, &self.cancel)
            .await
            .map_err(|e| CacheError::download_failed(url, e))?;

        let dir = self.policy.dir.clone();
        let target = path.clone();
        let size = bytes.len() as u64;
        tokio::task::spawn_blocking(move || write_atomic(&dir, &target, &bytes))
            .await
            .map_err(|e| CacheError::download_failed(url, DownloadError::Io(std::io::Error::other(e))))?
            .map_err(|e| CacheError::download_failed(url, DownloadError::Io(e)))?;

        tracing::info!(url = %url, path = %path.display(), size = size, "Resource cached");
        Ok(ResourceHandle {
            url: url.to_string(),
            path,
            size,
        })
    }

    /// A file from an earlier run counts as cached while it is younger than
    /// `max_age`.
    async fn adopt_from_disk(&self, url: &str, path: &Path) -> Option<ResourceHandle> {
        let metadata = tokio::fs::metadata(path).await.ok()?;
        if !metadata.is_file() || metadata.len() == 0 {
            return None;
        }
        let age = metadata.modified().ok()?.elapsed().ok()?;
        if age >= self.policy.max_age {
            return None;
        }
        Some(ResourceHandle {
            url: url.to_string(),
            path: path.to_path_buf(),
            size: metadata.len(),
        })
    }

    async fn complete(&self, url: &str, id: u64, result: &Result<ResourceHandle, CacheError>) {
        match result {
            Ok(handle) => {
                let stored = match self.entries.get_mut(url) {
                    Some(mut slot) => match &*slot {
                        Slot::Pending { id: pending, .. } if *pending == id => {
                            let now = Instant::now();
                            *slot = Slot::Ready(ReadyEntry {
                                handle: handle.clone(),
                                fetched_at: now,
                                last_access: now,
                            });
                            true
                        }
                        _ => false,
                    },
                    None => false,
                };
                if stored {
                    self.total_bytes.fetch_add(handle.size, Ordering::Relaxed);
                    self.evict_except(Some(url)).await;
                }
            }
            Err(e) => {
                self.entries.remove_if(url, |_, slot| {
                    matches!(slot, Slot::Pending { id: pending, .. } if *pending == id)
                });
                if e.is_cancelled() {
                    tracing::debug!(url = %url, "Resource fetch cancelled");
                } else {
                    tracing::warn!(url = %url, error = %e, "Resource fetch failed, entry not cached");
                }
            }
        }
    }

    async fn evict_except(&self, keep: Option<&str>) -> usize {
        let max_age = self.policy.max_age;
        let mut expired = Vec::new();
        let mut live: Vec<(String, Instant)> = Vec::new();

        for entry in self.entries.iter() {
            if keep == Some(entry.key().as_str()) {
                continue;
            }
            if let Slot::Ready(ready) = entry.value() {
                if ready.fetched_at.elapsed() >= max_age {
                    expired.push(entry.key().clone());
                } else {
                    live.push((entry.key().clone(), ready.last_access));
                }
            }
        }

        let mut removed_paths = Vec::new();
        for url in expired {
            if let Some(path) = self.remove_ready(&url) {
                removed_paths.push(path);
            }
        }

        live.sort_by_key(|(_, last_access)| *last_access);
        for (url, _) in live {
            if self.total_bytes.load(Ordering::Relaxed) <= self.policy.max_total_bytes {
                break;
            }
            if let Some(path) = self.remove_ready(&url) {
                removed_paths.push(path);
            }
        }

        let removed = removed_paths.len();
        for path in removed_paths {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to delete evicted resource");
                }
            }
        }
        if removed > 0 {
            tracing::debug!(
                removed = removed,
                total_bytes = self.total_bytes.load(Ordering::Relaxed),
                "Evicted cached resources"
            );
        }
        removed
    }

    fn remove_ready(&self, url: &str) -> Option<PathBuf> {
        let (_, slot) = self
            .entries
            .remove_if(url, |_, slot| matches!(slot, Slot::Ready(_)))?;
        match slot {
            Slot::Ready(ready) => {
                self.total_bytes
                    .fetch_sub(ready.handle.size, Ordering::Relaxed);
                Some(ready.handle.path)
            }
            Slot::Pending { .. } => None,
        }
    }
}

/// Write `bytes` to `target` via a temp file and rename, so a crash never
/// leaves a partial file under the cached name.
fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;

    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = target.with_extension(format!("tmp.{suffix:016x}"));

    let mut temp_file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)?;

    let written = temp_file
        .write_all(bytes)
        .and_then(|()| temp_file.sync_all());
    drop(temp_file);
    if let Err(e) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    std::fs::rename(&temp_path, target).inspect_err(|_| {
        let _ = std::fs::remove_file(&temp_path);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::download::{RetryPolicy, Transport};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    struct CountingTransport {
        calls: AtomicUsize,
        body: &'static [u8],
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn get(&self, _url: &str) -> Result<Bytes, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Bytes::from_static(self.body))
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("feedwarden_cache_unit_{name}"));
        std::fs::remove_dir_all(&dir).ok();
        dir
    }

    fn cache_with(dir: &Path, policy: impl FnOnce(&mut CachePolicy), body: &'static [u8]) -> (ResourceCache, Arc<CountingTransport>) {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            body,
        });
        let mut cache_policy = CachePolicy::new(dir);
        policy(&mut cache_policy);
        let downloader = RetryingDownloader::new(transport.clone(), RetryPolicy::default());
        (
            ResourceCache::new(cache_policy, downloader, CancellationToken::new()),
            transport,
        )
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_cache() {
        let dir = temp_dir("hit");
        let (cache, transport) = cache_with(&dir, |_| {}, b"image-bytes");

        let first = cache.get_or_fetch("https://cdn.example.com/a.jpg").await.unwrap();
        let second = cache.get_or_fetch("https://cdn.example.com/a.jpg").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&first.path).unwrap(), b"image-bytes");
        assert_eq!(first.path.extension().and_then(|e| e.to_str()), Some("jpg"));

        let stats = cache.stats();
        assert_eq!(stats.ready_entries, 1);
        assert_eq!(stats.pending_entries, 0);
        assert_eq!(stats.total_bytes, b"image-bytes".len() as u64);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_size_bound_evicts_least_recently_used() {
        let dir = temp_dir("lru");
        // Each body is 10 bytes; room for two.
        let (cache, _transport) = cache_with(&dir, |p| p.max_total_bytes = 20, b"0123456789");

        let a = cache.get_or_fetch("https://cdn.example.com/a.png").await.unwrap();
        let b = cache.get_or_fetch("https://cdn.example.com/b.png").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Touch a so that b becomes least recently used
        cache.get_or_fetch("https://cdn.example.com/a.png").await.unwrap();
        let c = cache.get_or_fetch("https://cdn.example.com/c.png").await.unwrap();

        assert!(a.path.exists());
        assert!(!b.path.exists());
        assert!(c.path.exists());
        assert_eq!(cache.stats().ready_entries, 2);
        assert_eq!(cache.stats().total_bytes, 20);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_expired_entries_are_evicted() {
        let dir = temp_dir("ttl");
        let (cache, transport) = cache_with(&dir, |p| p.max_age = Duration::from_millis(20), b"old");

        let handle = cache.get_or_fetch("https://cdn.example.com/a.mp3").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.evict().await, 1);
        assert!(!handle.path.exists());
        assert_eq!(cache.stats().ready_entries, 0);
        assert_eq!(cache.stats().total_bytes, 0);

        // An expired entry is fetched again rather than served
        cache.get_or_fetch("https://cdn.example.com/a.mp3").await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_file_on_disk_is_adopted() {
        let dir = temp_dir("adopt");
        let url = "https://cdn.example.com/warm.mp4";
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(cache_file_name(url)), b"from-last-run").unwrap();

        let (cache, transport) = cache_with(&dir, |_| {}, b"fresh");
        let handle = cache.get_or_fetch(url).await.unwrap();

        assert_eq!(handle.size, b"from-last-run".len() as u64);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.stats().downloads, 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_files() {
        let dir = temp_dir("atomic");
        let target = dir.join("file.bin");
        write_atomic(&dir, &target, b"abc").unwrap();
        write_atomic(&dir, &target, b"defg").unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"defg");
        let names: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }
}

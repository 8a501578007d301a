//! Resource retrieval: retrying downloads and the local resource cache.
//!
//! - [`download`] - one resource fetch with bounded exponential backoff
//! - [`cache`] - content-addressed cache with single-flight fetches per URL

pub mod cache;
pub mod download;

pub use cache::{CacheError, CachePolicy, CacheStats, ResourceCache, ResourceHandle};
pub use download::{DownloadError, HttpTransport, RetryPolicy, RetryingDownloader, Transport};

//! Incremental feed synchronization.
//!
//! A polling cycle moves through these pieces in order:
//!
//! - [`source`] - the upstream collaborator returning a raw batch
//! - [`fetcher`] - bounded-time fetch plus defensive newest-first re-sort
//! - [`filter`] - trims a batch against the subscription's watermark
//! - [`assembler`] - merges the results of many subscriptions by time

pub mod assembler;
pub mod fetcher;
pub mod filter;
pub mod source;
mod types;

pub use assembler::merge_cycle;
pub use fetcher::{FeedFetcher, FetchError, FetchErrorKind};
pub use filter::FilterOutcome;
pub use source::{FeedSource, HttpJsonSource, HttpMethod};
pub use types::{DeliveryBatch, FeedItem, Resource, Subscription, SubscriptionKey};

use crate::content::ResourceHandle;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

use super::source::FeedSource;

// ============================================================================
// Subscription Key
// ============================================================================

/// Opaque identifier for one pollable (source, destination) pair.
///
/// Cloning is cheap: the underlying string is reference counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey(Arc<str>);

impl SubscriptionKey {
    /// Build a key scoping `source` (a room id, a shop's order feed, ...) to
    /// the `destination` it is delivered to.
    pub fn scoped(source: &str, destination: &str) -> Self {
        Self(Arc::from(format!("{source}->{destination}")))
    }

    /// Wrap an already-formatted key, e.g. one loaded back from storage.
    pub fn from_raw(raw: impl Into<Arc<str>>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for SubscriptionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

// ============================================================================
// Feed Items
// ============================================================================

/// A resource referenced by a feed item (image, audio, video).
///
/// `local` is filled in once the URL has been resolved through the
/// resource cache; it stays `None` when the download failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    pub url: String,
    pub local: Option<ResourceHandle>,
}

/// One upstream item. The payload is opaque to the engine; `timestamp_ms`
/// is the authoritative ordering field (epoch milliseconds).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedItem {
    pub source_key: SubscriptionKey,
    pub timestamp_ms: i64,
    pub payload: serde_json::Value,
    pub resources: Vec<Resource>,
}

impl FeedItem {
    pub fn new(source_key: SubscriptionKey, timestamp_ms: i64, payload: serde_json::Value) -> Self {
        Self {
            source_key,
            timestamp_ms,
            payload,
            resources: Vec::new(),
        }
    }

    /// Attach unresolved resource URLs.
    pub fn with_resources<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources.extend(urls.into_iter().map(|url| Resource {
            url: url.into(),
            local: None,
        }));
        self
    }
}

// ============================================================================
// Delivery Batch
// ============================================================================

/// Ascending-time-ordered output of one polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryBatch {
    pub items: Vec<FeedItem>,
}

impl DeliveryBatch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn timestamps(&self) -> Vec<i64> {
        self.items.iter().map(|i| i.timestamp_ms).collect()
    }
}

impl IntoIterator for DeliveryBatch {
    type Item = FeedItem;
    type IntoIter = std::vec::IntoIter<FeedItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// An active subscription: its key, the source kind it belongs to (one
/// polling timeline runs per kind) and the collaborator that fetches it.
#[derive(Clone)]
pub struct Subscription {
    pub kind: Arc<str>,
    pub key: SubscriptionKey,
    pub source: Arc<dyn FeedSource>,
}

impl Subscription {
    pub fn new(kind: &str, key: SubscriptionKey, source: Arc<dyn FeedSource>) -> Self {
        Self {
            kind: Arc::from(kind),
            key,
            source,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

//! Incremental feed polling with per-subscription watermarks and a
//! single-flight resource cache.
//!
//! The crate is organized bottom-up:
//!
//! - [`content`] - retrying resource downloads and the on-disk resource cache
//! - [`storage`] - the watermark store and its optional SQLite persistence
//! - [`feed`] - feed sources, the defensive fetcher, the incremental filter
//!   and the cross-subscription assembler
//! - [`engine`] - the `poll` / `resolve_resource` / `merge_cycle` facade
//! - [`scheduler`] - one periodic timeline per source kind
//! - [`sink`] - delivery collaborators that receive merged batches
//! - [`config`] - TOML configuration

pub mod config;
pub mod content;
pub mod engine;
pub mod feed;
pub mod scheduler;
pub mod sink;
pub mod storage;
pub mod util;

pub use engine::{CycleReport, Engine, PollError};
pub use feed::{DeliveryBatch, FeedItem, Subscription, SubscriptionKey};

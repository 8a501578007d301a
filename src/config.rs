//! Configuration file parser for ~/.config/feedwarden/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`,
//! which polls nothing. Unknown top-level keys are accepted and logged as
//! warnings to catch typos.
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::content::{CachePolicy, RetryPolicy};
use crate::feed::{HttpJsonSource, HttpMethod, Subscription, SubscriptionKey};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// Values parse but contradict each other.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tick period of each source kind's polling timeline.
    pub poll_interval_secs: u64,

    /// Subscriptions polled at once within one cycle.
    pub max_concurrent_polls: usize,

    /// Upper bound on a single feed fetch.
    pub fetch_timeout_secs: u64,

    pub downloader: DownloaderConfig,
    pub cache: CacheConfig,
    pub watermarks: WatermarkConfig,
    pub subscriptions: Vec<SubscriptionConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            max_concurrent_polls: crate::engine::DEFAULT_MAX_CONCURRENT_POLLS,
            fetch_timeout_secs: 20,
            downloader: DownloaderConfig::default(),
            cache: CacheConfig::default(),
            watermarks: WatermarkConfig::default(),
            subscriptions: Vec::new(),
        }
    }
}

/// Custom Debug impl lists header names only.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub request_timeout_secs: u64,
    pub max_resource_bytes: usize,
    /// Sent with every resource download (`Referer`, `User-Agent`, ...).
    pub headers: BTreeMap<String, String>,
}

impl std::fmt::Debug for DownloaderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloaderConfig")
            .field("max_retries", &self.max_retries)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_resource_bytes", &self.max_resource_bytes)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_retries: crate::content::download::DEFAULT_MAX_RETRIES,
            backoff_base_ms: 1000,
            request_timeout_secs: 30,
            max_resource_bytes: crate::content::download::DEFAULT_MAX_RESOURCE_SIZE,
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Defaults to `<system temp>/feedwarden-cache`.
    pub dir: Option<PathBuf>,
    pub max_age_hours: u64,
    pub max_total_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_age_hours: 72,
            max_total_bytes: 512 * 1024 * 1024,
        }
    }
}

/// What happens to watermarks when the process restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    /// Forget everything; each key bootstraps to "now" again.
    #[default]
    Rebootstrap,
    /// Persist to SQLite and continue from the stored values.
    Resume,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WatermarkConfig {
    pub restart: RestartPolicy,
    pub database: Option<PathBuf>,
}

/// One `[[subscriptions]]` table.
///
/// Custom Debug impl masks `token` and header values to prevent secret
/// leakage in logs.
#[derive(Clone, Deserialize)]
pub struct SubscriptionConfig {
    /// Source kind; one polling timeline runs per kind.
    pub source: String,
    pub id: String,
    pub destination: String,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub body: Option<String>,
    /// JSON pointer to the item array.
    #[serde(default = "default_items")]
    pub items: String,
    #[serde(default = "default_time_field")]
    pub time_field: String,
    #[serde(default)]
    pub resource_fields: Vec<String>,
    #[serde(default)]
    pub status_field: Option<String>,
    #[serde(default = "default_ok_status")]
    pub ok_status: i64,
    #[serde(default)]
    pub token: Option<String>,
    /// Extra request headers such as `Cookie`, `pa` or `User-Agent`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_items() -> String {
    "/items".to_string()
}

fn default_time_field() -> String {
    "timestamp".to_string()
}

fn default_ok_status() -> i64 {
    200
}

impl std::fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("source", &self.source)
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("url", &self.url)
            .field("method", &self.method)
            .field("body", &self.body)
            .field("items", &self.items)
            .field("time_field", &self.time_field)
            .field("resource_fields", &self.resource_fields)
            .field("status_field", &self.status_field)
            .field("ok_status", &self.ok_status)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field(
                "headers",
                &self
                    .headers
                    .keys()
                    .map(|name| (name, "[REDACTED]"))
                    .collect::<BTreeMap<_, _>>(),
            )
            .finish()
    }
}

impl SubscriptionConfig {
    /// Watermark key, scoped by source kind so two kinds that reuse an id
    /// for the same destination never share a watermark.
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::scoped(&format!("{}:{}", self.source, self.id), &self.destination)
    }

    fn to_source(&self, client: &reqwest::Client) -> HttpJsonSource {
        let mut source = HttpJsonSource::new(client.clone(), &self.url)
            .method(self.method)
            .items_at(&self.items)
            .time_field(&self.time_field)
            .resource_fields(&self.resource_fields);
        if let Some(body) = &self.body {
            source = source.body(body);
        }
        if let Some(pointer) = &self.status_field {
            source = source.status_check(pointer, self.ok_status);
        }
        if let Some(token) = &self.token {
            source = source.token(SecretString::from(token.clone()));
        }
        for (name, value) in &self.headers {
            source = source.header(name, SecretString::from(value.clone()));
        }
        source
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 7] = [
        "poll_interval_secs",
        "max_concurrent_polls",
        "fetch_timeout_secs",
        "downloader",
        "cache",
        "watermarks",
        "subscriptions",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown top-level keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to avoid pulling a huge file into memory.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            subscriptions = config.subscriptions.len(),
            restart = ?config.watermarks.restart,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Reject combinations that parse but cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_polls == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_polls must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.watermarks.restart == RestartPolicy::Resume && self.watermarks.database.is_none() {
            return Err(ConfigError::Invalid(
                "watermarks.restart = \"resume\" requires watermarks.database".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for sub in &self.subscriptions {
            if !seen.insert((&sub.source, &sub.id, &sub.destination)) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate subscription: source={} id={} destination={}",
                    sub.source, sub.id, sub.destination
                )));
            }
            header_map(&sub.headers)?;
        }
        header_map(&self.downloader.headers)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.downloader.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.downloader.max_retries,
            backoff_base: Duration::from_millis(self.downloader.backoff_base_ms),
        }
    }

    pub fn cache_policy(&self) -> CachePolicy {
        let dir = self
            .cache
            .dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("feedwarden-cache"));
        CachePolicy {
            dir,
            max_age: Duration::from_secs(self.cache.max_age_hours.saturating_mul(3600)),
            max_total_bytes: self.cache.max_total_bytes,
        }
    }

    /// Headers for resource downloads, marked sensitive so reqwest keeps
    /// them out of its own debug output.
    pub fn resource_headers(&self) -> Result<HeaderMap, ConfigError> {
        header_map(&self.downloader.headers)
    }

    /// Build the configured subscriptions, each with its own HTTP source
    /// sharing `client`.
    pub fn subscriptions(&self, client: &reqwest::Client) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .map(|sub| Subscription::new(&sub.source, sub.key(), Arc::new(sub.to_source(client))))
            .collect()
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, ConfigError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ConfigError::Invalid(format!("invalid header name: {name}")))?;
        let mut header_value = HeaderValue::from_str(value)
            .map_err(|_| ConfigError::Invalid(format!("invalid value for header {name}")))?;
        header_value.set_sensitive(true);
        map.insert(header_name, header_value);
    }
    Ok(map)
}

// ============================================================================
// Tests
// ============================================================================

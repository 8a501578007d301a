use crate::feed::fetcher::FetchError;
use crate::feed::types::{FeedItem, SubscriptionKey};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

const MAX_BATCH_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// UTC+8, the local zone of the marketplace's order timestamps.
const ORDER_TIME_OFFSET_SECS: i32 = 8 * 3600;

/// The subscription-source collaborator: returns the current upstream batch
/// for one key. Ordering and deduplication are the fetcher's concern.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, key: &SubscriptionKey) -> Result<Vec<FeedItem>, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// Generic JSON-over-HTTP feed source.
///
/// Covers room message lists (numeric epoch-ms times), order lists
/// (`"yyyy-MM-dd HH:mm:ss"` pay times) and user/topic feeds
/// (`"Tue Oct 15 10:00:00 +0800 2024"` or RFC 3339 times). Field paths are
/// JSON pointers; a bare name such as `msgTime` is treated as `/msgTime`.
pub struct HttpJsonSource {
    client: reqwest::Client,
    url: String,
    method: HttpMethod,
    body: Option<String>,
    items_pointer: String,
    time_field: String,
    resource_fields: Vec<String>,
    status_check: Option<(String, i64)>,
    token: Option<SecretString>,
    headers: Vec<(String, SecretString)>,
}

impl HttpJsonSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            method: HttpMethod::Get,
            body: None,
            items_pointer: "/items".to_string(),
            time_field: "/timestamp".to_string(),
            resource_fields: Vec::new(),
            status_check: None,
            token: None,
            headers: Vec::new(),
        }
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn items_at(mut self, pointer: &str) -> Self {
        self.items_pointer = as_pointer(pointer);
        self
    }

    pub fn time_field(mut self, field: &str) -> Self {
        self.time_field = as_pointer(field);
        self
    }

    pub fn resource_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.resource_fields = fields.into_iter().map(|f| as_pointer(f.as_ref())).collect();
        self
    }

    /// Require the envelope value at `pointer` to equal `ok` before any
    /// items are read.
    pub fn status_check(mut self, pointer: &str, ok: i64) -> Self {
        self.status_check = Some((as_pointer(pointer), ok));
        self
    }

    pub fn token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    /// Extra request header, e.g. a session `Cookie` or the app's `pa`
    /// signature. Values are kept secret since most of them authenticate.
    pub fn header(mut self, name: impl Into<String>, value: SecretString) -> Self {
        self.headers.push((name.into(), value));
        self
    }

    async fn request(&self) -> Result<Vec<u8>, FetchError> {
        let mut request = match self.method {
            HttpMethod::Get => self.client.get(&self.url),
            HttpMethod::Post => self.client.post(&self.url),
        };
        if let Some(body) = &self.body {
            request = request
                .header("Content-Type", "application/json;charset=utf-8")
                .body(body.clone());
        }
        if let Some(token) = &self.token {
            request = request.header("token", token.expose_secret());
        }
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.expose_secret());
        }

        let response = request.send().await.map_err(FetchError::Network)?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(FetchError::Auth(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        read_limited_bytes(response, MAX_BATCH_SIZE).await
    }

    /// Turn a response document into items, dropping individual items whose
    /// time field is missing or unparseable.
    fn parse_batch(&self, key: &SubscriptionKey, bytes: &[u8]) -> Result<Vec<FeedItem>, FetchError> {
        let document: Value =
            serde_json::from_slice(bytes).map_err(|e| FetchError::Malformed(e.to_string()))?;

        if let Some((pointer, ok)) = &self.status_check {
            let status = document.pointer(pointer).and_then(as_i64);
            if status != Some(*ok) {
                let message = document
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if is_auth_message(&message) {
                    return Err(FetchError::Auth(message));
                }
                return Err(FetchError::Malformed(format!(
                    "unexpected status {status:?}: {message}"
                )));
            }
        }

        let raw_items = document
            .pointer(&self.items_pointer)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                FetchError::Malformed(format!("no item array at {}", self.items_pointer))
            })?;

        let mut items = Vec::with_capacity(raw_items.len());
        let mut skipped = 0usize;
        for raw in raw_items {
            let Some(timestamp_ms) = raw.pointer(&self.time_field).and_then(parse_time_ms) else {
                skipped += 1;
                continue;
            };
            let resources: Vec<String> = self
                .resource_fields
                .iter()
                .filter_map(|field| raw.pointer(field))
                .flat_map(resource_urls)
                .collect();
            items.push(FeedItem::new(key.clone(), timestamp_ms, raw.clone()).with_resources(resources));
        }

        if skipped > 0 {
            tracing::warn!(
                key = %key,
                url = %self.url,
                skipped = skipped,
                field = %self.time_field,
                "Items without a usable time field dropped"
            );
        }

        Ok(items)
    }
}

#[async_trait]
impl FeedSource for HttpJsonSource {
    async fn fetch(&self, key: &SubscriptionKey) -> Result<Vec<FeedItem>, FetchError> {
        let bytes = self.request().await?;
        self.parse_batch(key, &bytes)
    }
}

fn as_pointer(path: &str) -> String {
    if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_auth_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    message.contains("非法授权")
        || lower.contains("unauthorized")
        || lower.contains("token expired")
        || lower.contains("invalid token")
}

fn resource_urls(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) if !s.is_empty() => vec![s.clone()],
        Value::Array(values) => values
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Parse an upstream time value into epoch milliseconds.
///
/// Accepts epoch-ms numbers or digit strings, RFC 3339,
/// `"Tue Oct 15 10:00:00 +0800 2024"`, and `"2024-10-15 10:00:00"` (UTC+8).
pub fn parse_time_ms(value: &Value) -> Option<i64> {
    if let Some(ms) = as_i64(value) {
        return Some(ms);
    }
    let text = value.as_str()?.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_str(text, "%a %b %d %H:%M:%S %z %Y") {
        return Some(dt.timestamp_millis());
    }
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").ok()?;
    let offset = FixedOffset::east_opt(ORDER_TIME_OFFSET_SECS)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp_millis())
}

async fn read_limited_bytes(response: reqwest::Response, limit: usize) -> Result<Vec<u8>, FetchError> {
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

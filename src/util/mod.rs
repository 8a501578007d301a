//! Small helpers shared across modules.

use sha2::{Digest, Sha256};

/// Fallback extension for URLs whose path has none.
const DEFAULT_EXTENSION: &str = "bin";

/// Content-addressed file name for a resource URL:
/// `<sha256(url) hex>.<extension from the URL path>`.
pub fn cache_file_name(url: &str) -> String {
    let hash = Sha256::digest(url.as_bytes());
    format!("{:x}.{}", hash, file_extension(url))
}

/// Lowercased extension of the URL's last path segment, restricted to short
/// alphanumeric values so a hostile URL cannot shape the file name.
pub fn file_extension(url: &str) -> String {
    let path = match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };

    path.rsplit('/')
        .next()
        .and_then(|segment| segment.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

use thiserror::Error;

use crate::lifecycle::WorkerState;

/// Transport-level failure of a network fetch.
///
/// A response with a non-2xx status is not an error: the fetch resolved and
/// the caller decides what to do with it.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network unavailable: {0}")]
    Offline(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode cache entry: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Refusing to cache response with status {status} for {key}")]
    NotCacheable { key: String, status: u16 },

    #[error("Invalid cache name: {0}")]
    InvalidName(String),
}

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Not supported by host: {0}")]
    Unsupported(String),

    #[error("Host error: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Install failed for {url}: {reason}")]
    Install { url: String, reason: String },

    #[error("Cache store error: {0}")]
    Store(#[from] StoreError),

    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("Invalid worker state: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: WorkerState,
    },
}

/// Maximum length for response bodies quoted in error messages
const MAX_ERROR_BODY_LENGTH: usize = 200;

impl LifecycleError {
    /// Build an install error for a response that resolved with a bad status.
    pub fn bad_status(url: &str, status: u16, body: &[u8]) -> Self {
        let body = String::from_utf8_lossy(body);
        let reason = if body.is_empty() {
            format!("status {}", status)
        } else {
            format!("status {}: {}", status, truncate_body(&body))
        };
        LifecycleError::Install {
            url: url.to_string(),
            reason,
        }
    }
}

/// Truncate a response body to avoid logging excessive data
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        body.to_string()
    } else {
        let cut = body
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_ERROR_BODY_LENGTH)
            .last()
            .unwrap_or(0);
        format!("{}... (truncated, {} total bytes)", &body[..cut], body.len())
    }
}

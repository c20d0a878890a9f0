use ingest_core::Provider;
use thiserror::Error;

use crate::http::{classify_reqwest_error, classify_status, RetryDisposition};

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("result not ready: {0}")]
    NotReady(String),

    #[error("unexpected response: {0}")]
    Malformed(String),

    #[error("no client configured for provider {0}")]
    NotConfigured(Provider),

    #[error("provider client is shutting down")]
    Closed,
}

impl ProviderError {
    /// Worth retrying: network trouble, rate limiting, server errors, or a
    /// result that is still being assembled.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            ProviderError::Api { status, .. } => reqwest::StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            ProviderError::NotReady(_) => true,
            ProviderError::Malformed(_)
            | ProviderError::NotConfigured(_)
            | ProviderError::Closed => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProviderError::Http(err) if err.is_timeout())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_split_into_transient_and_terminal() {
        let api = |status| ProviderError::Api {
            status,
            message: String::new(),
        };
        assert!(api(500).is_transient());
        assert!(api(503).is_transient());
        assert!(api(429).is_transient());
        assert!(!api(400).is_transient());
        assert!(!api(401).is_transient());
        assert!(!api(404).is_transient());
        assert!(ProviderError::NotReady("building".into()).is_transient());
        assert!(!ProviderError::Malformed("no id".into()).is_transient());
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::{ProviderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else if let Some(status) = err.status() {
        classify_status(status)
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Simultaneous requests allowed against one provider.
    pub per_provider_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            per_provider_concurrency: 8,
        }
    }
}

/// Shared reqwest client plus the per-provider request limit.
#[derive(Debug, Clone)]
pub(crate) struct ProviderHttp {
    pub client: reqwest::Client,
    limit: Arc<Semaphore>,
}

impl ProviderHttp {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.per_provider_concurrency.max(1))),
        })
    }

    pub async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.limit.acquire().await.map_err(|_| ProviderError::Closed)
    }
}

/// Turn a non-success response into [`ProviderError::Api`], keeping the body
/// as the message.
pub(crate) async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(ProviderError::Api {
        status: status.as_u16(),
        message: message.chars().take(512).collect(),
    })
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_join_without_double_slashes() {
        assert_eq!(join_url("http://x/v3/", "/trigger"), "http://x/v3/trigger");
        assert_eq!(join_url("http://x/v3", "progress/1"), "http://x/v3/progress/1");
    }

    #[test]
    fn statuses_classify_like_retry_policy() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }
}

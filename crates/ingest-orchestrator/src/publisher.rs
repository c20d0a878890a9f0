//! Lifecycle event delivery.

use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ingest_core::{BackoffPolicy, EventKind, LifecycleEvent};
use ingest_providers::{classify_reqwest_error, classify_status, HttpClientConfig, RetryDisposition};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

pub const PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com/v1";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("publish rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publisher unavailable: {0}")]
    Unavailable(String),
}

impl PublishError {
    pub fn is_transient(&self) -> bool {
        match self {
            PublishError::Http(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            PublishError::Rejected { status, .. } => reqwest::StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            PublishError::Unavailable(_) => true,
            PublishError::Encode(_) => false,
        }
    }
}

/// Delivers events to the topic for their kind. Delivery is at least once;
/// consumers deduplicate on `job_id`.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &LifecycleEvent) -> Result<(), PublishError>;
}

/// Publish, retrying transient failures with backoff.
pub async fn publish_with_retry(
    publisher: &dyn EventPublisher,
    event: &LifecycleEvent,
    policy: &BackoffPolicy,
) -> Result<(), PublishError> {
    let mut attempt = 0;
    loop {
        match publisher.publish(event).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                warn!(
                    job_id = %event.job_id,
                    event = event.kind().topic(),
                    attempt,
                    error = %err,
                    "event delivery failed; retrying"
                );
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Google Cloud Pub/Sub over its REST API.
#[derive(Debug, Clone)]
pub struct PubSubPublisher {
    client: reqwest::Client,
    endpoint: String,
    project: String,
    topic_prefix: String,
    access_token: String,
}

impl PubSubPublisher {
    pub fn new(
        http: &HttpClientConfig,
        project: impl Into<String>,
        topic_prefix: impl Into<String>,
        access_token: impl Into<String>,
        endpoint: Option<String>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(http.timeout);
        if let Some(user_agent) = &http.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build().context("building pub/sub client")?,
            endpoint: endpoint.unwrap_or_else(|| PUBSUB_ENDPOINT.to_string()),
            project: project.into(),
            topic_prefix: topic_prefix.into(),
            access_token: access_token.into(),
        })
    }

    pub fn topic_name(&self, kind: EventKind) -> String {
        format!("{}-{}", self.topic_prefix, kind.topic())
    }

    fn publish_url(&self, kind: EventKind) -> String {
        format!(
            "{}/projects/{}/topics/{}:publish",
            self.endpoint.trim_end_matches('/'),
            self.project,
            self.topic_name(kind)
        )
    }
}

#[async_trait]
impl EventPublisher for PubSubPublisher {
    async fn publish(&self, event: &LifecycleEvent) -> Result<(), PublishError> {
        let kind = event.kind();
        let data = serde_json::to_vec(&event.to_message())?;
        let body = json!({
            "messages": [{
                "data": BASE64.encode(data),
                "attributes": {
                    "job_id": event.job_id.to_string(),
                    "event_type": kind.topic(),
                },
            }]
        });

        let resp = self
            .client
            .post(self.publish_url(kind))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

/// Writes events to the log instead of a broker.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: &LifecycleEvent) -> Result<(), PublishError> {
        info!(
            topic = event.kind().topic(),
            job_id = %event.job_id,
            message = %event.to_message(),
            "lifecycle event"
        );
        Ok(())
    }
}

/// Keeps every published event in memory.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<LifecycleEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.kind() == kind)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, event: &LifecycleEvent) -> Result<(), PublishError> {
        self.events
            .lock()
            .map_err(|_| PublishError::Unavailable("memory publisher lock poisoned".into()))?
            .push(event.clone());
        Ok(())
    }
}

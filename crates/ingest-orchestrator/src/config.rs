use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ingest_core::BackoffPolicy;
use ingest_platforms::PlatformRegistry;
use ingest_providers::{ApifyClient, BrightDataClient, HttpClientConfig, ProviderClients};
use tracing::{info, warn};

use crate::publisher::{EventPublisher, LogPublisher, PubSubPublisher};

/// Tuning for the background polling pool.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Worker slots; at most this many jobs are polled or downloaded at once.
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub download_timeout: Duration,
    /// Retries for one status check or download that fails transiently.
    pub status_retry: BackoffPolicy,
    /// Retries for one event delivery.
    pub publish_retry: BackoffPolicy,
    /// How long terminal jobs stay in the live registry.
    pub retention: Duration,
    pub keep_failed_payloads: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            poll_interval: Duration::from_secs(30),
            max_polls: 120,
            download_timeout: Duration::from_secs(300),
            status_retry: BackoffPolicy::default(),
            publish_retry: BackoffPolicy::default(),
            retention: Duration::from_secs(86_400),
            keep_failed_payloads: false,
        }
    }
}

impl OrchestratorConfig {
    /// Overall deadline for one job: poll interval times max polls.
    pub fn job_deadline(&self) -> Duration {
        self.poll_interval.saturating_mul(self.max_polls)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PubSubSettings {
    pub project: Option<String>,
    pub topic_prefix: String,
    pub access_token: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub orchestrator: OrchestratorConfig,
    pub eviction_cron: String,
    pub artifacts_dir: PathBuf,
    pub database_url: Option<String>,
    pub platforms_config: Option<PathBuf>,
    pub brightdata_api_key: Option<String>,
    pub brightdata_base_url: Option<String>,
    pub apify_api_token: Option<String>,
    pub apify_base_url: Option<String>,
    pub pubsub: PubSubSettings,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn truthy(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = OrchestratorConfig::default();
        let status_retries: usize = parse_or(lookup("BACKGROUND_STATUS_RETRIES"), 3);
        let orchestrator = OrchestratorConfig {
            max_workers: parse_or(lookup("BACKGROUND_MAX_WORKERS"), defaults.max_workers).max(1),
            poll_interval: Duration::from_secs(parse_or(lookup("BACKGROUND_POLL_INTERVAL"), 30)),
            max_polls: parse_or(lookup("BACKGROUND_MAX_POLLS"), defaults.max_polls).max(1),
            download_timeout: Duration::from_secs(parse_or(
                lookup("BACKGROUND_DOWNLOAD_TIMEOUT"),
                300,
            )),
            status_retry: defaults.status_retry.with_max_retries(status_retries),
            publish_retry: defaults.publish_retry,
            retention: Duration::from_secs(parse_or(lookup("JOB_RETENTION_SECS"), 86_400)),
            keep_failed_payloads: truthy(lookup("KEEP_FAILED_PAYLOADS")),
        };

        Self {
            orchestrator,
            eviction_cron: non_empty(lookup("EVICTION_CRON"))
                .unwrap_or_else(|| "0 */10 * * * *".to_string()),
            artifacts_dir: non_empty(lookup("ARTIFACTS_DIR"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            database_url: non_empty(lookup("DATABASE_URL")),
            platforms_config: non_empty(lookup("PLATFORMS_CONFIG")).map(PathBuf::from),
            brightdata_api_key: non_empty(lookup("BRIGHTDATA_API_KEY")),
            brightdata_base_url: non_empty(lookup("BRIGHTDATA_BASE_URL")),
            apify_api_token: non_empty(lookup("APIFY_API_TOKEN")),
            apify_base_url: non_empty(lookup("APIFY_BASE_URL")),
            pubsub: PubSubSettings {
                project: non_empty(lookup("GOOGLE_CLOUD_PROJECT")),
                topic_prefix: non_empty(lookup("PUBSUB_TOPIC_PREFIX"))
                    .unwrap_or_else(|| "social-analytics".to_string()),
                access_token: non_empty(lookup("PUBSUB_ACCESS_TOKEN")),
                endpoint: non_empty(lookup("PUBSUB_ENDPOINT")),
            },
            user_agent: non_empty(lookup("INGEST_USER_AGENT"))
                .unwrap_or_else(|| format!("social-ingest/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: parse_or(lookup("INGEST_HTTP_TIMEOUT_SECS"), 30),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        }
    }

    pub fn load_platforms(&self) -> Result<PlatformRegistry> {
        match &self.platforms_config {
            Some(path) => PlatformRegistry::from_path(path)
                .with_context(|| format!("loading platforms from {}", path.display())),
            None => Ok(PlatformRegistry::builtin()),
        }
    }

    /// Clients for every provider that has credentials configured.
    pub fn build_provider_clients(&self) -> Result<ProviderClients> {
        let http = self.http_client_config();
        let mut clients = ProviderClients::new();
        match &self.brightdata_api_key {
            Some(key) => {
                let client = BrightDataClient::new(&http, key.clone(), self.brightdata_base_url.clone())
                    .context("building brightdata client")?;
                clients = clients.with(Arc::new(client));
            }
            None => warn!("BRIGHTDATA_API_KEY not set; brightdata platforms are unavailable"),
        }
        match &self.apify_api_token {
            Some(token) => {
                let client = ApifyClient::new(&http, token.clone(), self.apify_base_url.clone())
                    .context("building apify client")?;
                clients = clients.with(Arc::new(client));
            }
            None => warn!("APIFY_API_TOKEN not set; apify platforms are unavailable"),
        }
        Ok(clients)
    }

    /// Pub/Sub when a project and token are configured, log-only otherwise.
    pub fn build_publisher(&self) -> Result<Arc<dyn EventPublisher>> {
        match (&self.pubsub.project, &self.pubsub.access_token) {
            (Some(project), Some(token)) => {
                let publisher = PubSubPublisher::new(
                    &self.http_client_config(),
                    project.clone(),
                    self.pubsub.topic_prefix.clone(),
                    token.clone(),
                    self.pubsub.endpoint.clone(),
                )?;
                info!(project, prefix = %self.pubsub.topic_prefix, "publishing lifecycle events to pub/sub");
                Ok(Arc::new(publisher))
            }
            _ => {
                info!("pub/sub not configured; lifecycle events are logged only");
                Ok(Arc::new(LogPublisher))
            }
        }
    }
}

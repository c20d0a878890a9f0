use async_trait::async_trait;
use ingest_core::{Provider, ProviderRequest, RemoteJobId};
use serde::Deserialize;
use tracing::debug;

use crate::client::{ProviderClient, RemoteStatus};
use crate::error::{ProviderError, Result};
use crate::http::{ensure_success, join_url, HttpClientConfig, ProviderHttp};

pub const APIFY_BASE_URL: &str = "https://api.apify.com/v2";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunData {
    id: String,
    status: String,
    #[serde(default)]
    status_message: Option<String>,
}

/// Apify actor runs: start a run, watch it, read its default dataset.
#[derive(Debug, Clone)]
pub struct ApifyClient {
    http: ProviderHttp,
    token: String,
    base_url: String,
}

impl ApifyClient {
    pub fn new(
        config: &HttpClientConfig,
        token: impl Into<String>,
        base_url: Option<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: ProviderHttp::new(config)?,
            token: token.into(),
            base_url: base_url.unwrap_or_else(|| APIFY_BASE_URL.to_string()),
        })
    }
}

/// Actor ids use `~` in place of `/` inside URL paths.
pub(crate) fn actor_path_id(actor_id: &str) -> String {
    actor_id.replace('/', "~")
}

pub(crate) fn map_run_status(status: &str, message: Option<String>) -> RemoteStatus {
    match status {
        "SUCCEEDED" => RemoteStatus::Ready,
        "FAILED" | "ABORTED" | "TIMED-OUT" | "TIMED_OUT" => {
            RemoteStatus::Failed(message.unwrap_or_else(|| format!("run {status}")))
        }
        _ => RemoteStatus::Processing,
    }
}

#[async_trait]
impl ProviderClient for ApifyClient {
    fn provider(&self) -> Provider {
        Provider::Apify
    }

    async fn trigger(&self, request: &ProviderRequest) -> Result<RemoteJobId> {
        let _permit = self.http.permit().await?;
        let url = join_url(
            &self.base_url,
            &format!("acts/{}/runs", actor_path_id(&request.dataset_id)),
        );
        let resp = self
            .http
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&request.input)
            .send()
            .await?;
        let run: ApiResponse<RunData> = ensure_success(resp).await?.json().await?;
        if run.data.id.trim().is_empty() {
            return Err(ProviderError::Malformed("run response has an empty id".into()));
        }
        Ok(RemoteJobId::new(run.data.id))
    }

    async fn poll_status(&self, remote_job_id: &RemoteJobId) -> Result<RemoteStatus> {
        let _permit = self.http.permit().await?;
        let url = join_url(&self.base_url, &format!("actor-runs/{remote_job_id}"));
        let resp = self
            .http
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let run: ApiResponse<RunData> = ensure_success(resp).await?.json().await?;
        debug!(%remote_job_id, status = %run.data.status, "apify run status");
        Ok(map_run_status(&run.data.status, run.data.status_message))
    }

    async fn download(&self, remote_job_id: &RemoteJobId) -> Result<Vec<u8>> {
        let _permit = self.http.permit().await?;
        let url = join_url(
            &self.base_url,
            &format!("actor-runs/{remote_job_id}/dataset/items"),
        );
        let resp = self
            .http
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("format", "json"), ("clean", "true")])
            .send()
            .await?;
        let bytes = ensure_success(resp).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

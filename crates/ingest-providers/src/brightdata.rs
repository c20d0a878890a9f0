use async_trait::async_trait;
use ingest_core::{Provider, ProviderRequest, RemoteJobId};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::client::{ProviderClient, RemoteStatus};
use crate::error::{ProviderError, Result};
use crate::http::{ensure_success, join_url, HttpClientConfig, ProviderHttp};

pub const BRIGHTDATA_BASE_URL: &str = "https://api.brightdata.com/datasets/v3";

#[derive(Debug, Deserialize)]
struct TriggerResponse {
    snapshot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProgressResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// BrightData dataset API: trigger a snapshot, watch its progress, fetch it.
#[derive(Debug, Clone)]
pub struct BrightDataClient {
    http: ProviderHttp,
    api_key: String,
    base_url: String,
}

impl BrightDataClient {
    pub fn new(
        config: &HttpClientConfig,
        api_key: impl Into<String>,
        base_url: Option<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: ProviderHttp::new(config)?,
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| BRIGHTDATA_BASE_URL.to_string()),
        })
    }
}

pub(crate) fn map_progress_status(status: &str, error: Option<String>) -> RemoteStatus {
    match status.to_ascii_lowercase().as_str() {
        "ready" | "completed" => RemoteStatus::Ready,
        "failed" | "error" | "cancelled" => {
            RemoteStatus::Failed(error.unwrap_or_else(|| format!("snapshot {status}")))
        }
        _ => RemoteStatus::Processing,
    }
}

#[async_trait]
impl ProviderClient for BrightDataClient {
    fn provider(&self) -> Provider {
        Provider::BrightData
    }

    async fn trigger(&self, request: &ProviderRequest) -> Result<RemoteJobId> {
        let _permit = self.http.permit().await?;
        let url = join_url(&self.base_url, "trigger");
        let resp = self
            .http
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .query(&[
                ("dataset_id", request.dataset_id.as_str()),
                ("include_errors", "true"),
            ])
            .json(&[&request.input])
            .send()
            .await?;
        let body: TriggerResponse = ensure_success(resp).await?.json().await?;
        body.snapshot_id
            .filter(|id| !id.trim().is_empty())
            .map(RemoteJobId::new)
            .ok_or_else(|| ProviderError::Malformed("trigger response has no snapshot_id".into()))
    }

    async fn poll_status(&self, remote_job_id: &RemoteJobId) -> Result<RemoteStatus> {
        let _permit = self.http.permit().await?;
        let url = join_url(&self.base_url, &format!("progress/{remote_job_id}"));
        let resp = self
            .http
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let body: ProgressResponse = ensure_success(resp).await?.json().await?;
        let status = body
            .status
            .ok_or_else(|| ProviderError::Malformed("progress response has no status".into()))?;
        debug!(%remote_job_id, status, "brightdata progress");
        Ok(map_progress_status(&status, body.error))
    }

    async fn download(&self, remote_job_id: &RemoteJobId) -> Result<Vec<u8>> {
        let _permit = self.http.permit().await?;
        let url = join_url(&self.base_url, &format!("snapshot/{remote_job_id}"));
        let resp = self
            .http
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("format", "json")])
            .send()
            .await?;
        // 202 means the snapshot is still being assembled.
        if resp.status() == StatusCode::ACCEPTED {
            let detail = resp.text().await.unwrap_or_default();
            return Err(ProviderError::NotReady(detail));
        }
        let bytes = ensure_success(resp).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_statuses_map_to_remote_status() {
        assert_eq!(map_progress_status("ready", None), RemoteStatus::Ready);
        assert_eq!(map_progress_status("Completed", None), RemoteStatus::Ready);
        assert_eq!(map_progress_status("running", None), RemoteStatus::Processing);
        assert_eq!(
            map_progress_status("failed", Some("blocked".into())),
            RemoteStatus::Failed("blocked".into())
        );
        assert_eq!(
            map_progress_status("cancelled", None),
            RemoteStatus::Failed("snapshot cancelled".into())
        );
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ingest_core::{Provider, ProviderRequest, RemoteJobId};

use crate::error::{ProviderError, Result};

/// Remote job status as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Ready,
    Processing,
    /// Terminal provider-side failure with the provider's detail.
    Failed(String),
}

/// One external scraping API. Every call is a fallible remote operation.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    async fn trigger(&self, request: &ProviderRequest) -> Result<RemoteJobId>;

    async fn poll_status(&self, remote_job_id: &RemoteJobId) -> Result<RemoteStatus>;

    /// Raw result bytes, exactly as the provider sent them.
    async fn download(&self, remote_job_id: &RemoteJobId) -> Result<Vec<u8>>;
}

/// Provider to client table.
#[derive(Clone, Default)]
pub struct ProviderClients {
    clients: HashMap<Provider, Arc<dyn ProviderClient>>,
}

impl std::fmt::Debug for ProviderClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClients")
            .field("providers", &self.clients.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.clients.insert(client.provider(), client);
        self
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ProviderClient>> {
        self.clients
            .get(&provider)
            .cloned()
            .ok_or(ProviderError::NotConfigured(provider))
    }

    pub fn contains(&self, provider: Provider) -> bool {
        self.clients.contains_key(&provider)
    }
}

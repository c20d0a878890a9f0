//! Background polling orchestration: job registry, worker pool and
//! lifecycle event delivery.

mod config;
mod orchestrator;
mod publisher;
mod registry;

pub use config::{IngestConfig, OrchestratorConfig, PubSubSettings};
pub use orchestrator::{Dependencies, PollingOrchestrator, SubmitError, SubmitReceipt};
pub use publisher::{
    publish_with_retry, EventPublisher, LogPublisher, MemoryPublisher, PubSubPublisher,
    PublishError, PUBSUB_ENDPOINT,
};
pub use registry::{JobClaim, JobRegistry, RegistryError};

pub const CRATE_NAME: &str = "ingest-orchestrator";

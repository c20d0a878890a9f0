use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Path;
use axum::routing::{get, post};
use axum::{Json, Router};
use ingest_core::{
    BackoffPolicy, BusinessContext, CrawlJob, CrawlRequest, EventKind, FailureStage, JobId,
    JobState, JobStatus, LifecycleEvent, Platform, Provider, ProviderRequest, RemoteJobId,
};
use ingest_orchestrator::{
    Dependencies, EventPublisher, MemoryPublisher, OrchestratorConfig, PollingOrchestrator,
    PublishError, SubmitError,
};
use ingest_platforms::PlatformRegistry;
use ingest_providers::{
    BrightDataClient, HttpClientConfig, ProviderClient, ProviderClients, ProviderError,
    RemoteStatus,
};
use ingest_storage::{
    MemoryMetadataStore, MemoryObjectStore, MetadataStore, ObjectStore, StorageError,
    StoredObject,
};
use serde_json::{json, Value};

#[derive(Debug, Clone, Default)]
struct Script {
    /// Status checks per remote job before it reports ready; `None` never settles.
    ready_after: Option<u32>,
    failure: Option<String>,
    payload: Vec<u8>,
    download_delay: Duration,
    panic_on_download: bool,
}

#[derive(Default)]
struct ScriptedProvider {
    script: Mutex<Script>,
    triggers: AtomicUsize,
    polls: Mutex<HashMap<String, u32>>,
    first_polls: Mutex<Vec<String>>,
    in_flight: Mutex<HashSet<String>>,
    max_in_flight: AtomicUsize,
    /// HTTP statuses answered to the next status checks, before the script applies.
    status_errors: Mutex<VecDeque<u16>>,
}

impl ScriptedProvider {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            ..Self::default()
        })
    }

    fn set_script(&self, script: Script) {
        *self.script.lock().expect("lock") = script;
    }

    fn queue_status_errors(&self, statuses: &[u16]) {
        self.status_errors
            .lock()
            .expect("lock")
            .extend(statuses.iter().copied());
    }

    fn polls_for(&self, remote: &RemoteJobId) -> u32 {
        self.polls
            .lock()
            .expect("lock")
            .get(remote.as_str())
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn provider(&self) -> Provider {
        Provider::BrightData
    }

    async fn trigger(&self, _request: &ProviderRequest) -> Result<RemoteJobId, ProviderError> {
        let n = self.triggers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RemoteJobId::new(format!("snap-{n}")))
    }

    async fn poll_status(&self, remote_job_id: &RemoteJobId) -> Result<RemoteStatus, ProviderError> {
        let id = remote_job_id.as_str().to_string();
        let count = {
            let mut polls = self.polls.lock().expect("lock");
            let count = polls.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if count == 1 {
            self.first_polls.lock().expect("lock").push(id.clone());
            let mut in_flight = self.in_flight.lock().expect("lock");
            in_flight.insert(id);
            self.max_in_flight.fetch_max(in_flight.len(), Ordering::SeqCst);
        }

        let queued = self.status_errors.lock().expect("lock").pop_front();
        if let Some(status) = queued {
            return Err(ProviderError::Api {
                status,
                message: format!("scripted {status}"),
            });
        }

        let script = self.script.lock().expect("lock").clone();
        if let Some(detail) = script.failure {
            return Ok(RemoteStatus::Failed(detail));
        }
        match script.ready_after {
            Some(after) if count >= after => Ok(RemoteStatus::Ready),
            _ => Ok(RemoteStatus::Processing),
        }
    }

    async fn download(&self, remote_job_id: &RemoteJobId) -> Result<Vec<u8>, ProviderError> {
        let script = self.script.lock().expect("lock").clone();
        tokio::time::sleep(script.download_delay).await;
        if script.panic_on_download {
            panic!("scripted download panic");
        }
        self.in_flight
            .lock()
            .expect("lock")
            .remove(remote_job_id.as_str());
        Ok(script.payload)
    }
}

/// Object store that refuses every write.
#[derive(Default)]
struct BrokenObjectStore {
    inner: MemoryObjectStore,
}

#[async_trait]
impl ObjectStore for BrokenObjectStore {
    async fn put(
        &self,
        _path: &str,
        _bytes: &[u8],
        _content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        Err(StorageError::Unavailable("bucket is read-only".into()))
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        self.inner.exists(path).await
    }
}

/// Publisher whose broker is always down.
struct DownPublisher {
    attempts: AtomicUsize,
}

#[async_trait]
impl EventPublisher for DownPublisher {
    async fn publish(&self, _event: &LifecycleEvent) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PublishError::Unavailable("broker offline".into()))
    }
}

struct Harness {
    orchestrator: PollingOrchestrator,
    deps: Dependencies,
    provider: Arc<ScriptedProvider>,
    objects: Arc<MemoryObjectStore>,
    metadata: Arc<MemoryMetadataStore>,
    publisher: Arc<MemoryPublisher>,
}

fn fast_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

fn fast_config(max_workers: usize, max_polls: u32) -> OrchestratorConfig {
    OrchestratorConfig {
        max_workers,
        poll_interval: Duration::from_millis(5),
        max_polls,
        download_timeout: Duration::from_secs(2),
        status_retry: fast_policy(),
        publish_retry: fast_policy(),
        ..OrchestratorConfig::default()
    }
}

fn harness_with(
    config: OrchestratorConfig,
    script: Script,
    objects_override: Option<Arc<dyn ObjectStore>>,
) -> Harness {
    let provider = ScriptedProvider::new(script);
    let objects = Arc::new(MemoryObjectStore::new());
    let metadata = Arc::new(MemoryMetadataStore::new());
    let publisher = Arc::new(MemoryPublisher::new());
    let deps = Dependencies {
        platforms: PlatformRegistry::builtin(),
        providers: ProviderClients::new().with(provider.clone()),
        objects: objects_override.unwrap_or_else(|| objects.clone() as Arc<dyn ObjectStore>),
        metadata: metadata.clone(),
        publisher: publisher.clone(),
    };
    Harness {
        orchestrator: PollingOrchestrator::start(config, deps.clone()),
        deps,
        provider,
        objects,
        metadata,
        publisher,
    }
}

fn harness(config: OrchestratorConfig, script: Script) -> Harness {
    harness_with(config, script, None)
}

fn facebook_request() -> CrawlRequest {
    CrawlRequest::new(Platform::Facebook, "https://www.facebook.com/acme")
        .with_business_context(BusinessContext::new("acme", "cola", "drinks"))
}

const TWO_POSTS: &[u8] = br#"{"id":"1","likes":3}{"id":"2","likes":"5","num_comments":1}"#;

async fn status_of(orchestrator: &PollingOrchestrator, job_id: JobId) -> JobStatus {
    orchestrator
        .get_status(job_id)
        .await
        .expect("status lookup")
        .expect("job is known")
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn never_ready_job_times_out_after_max_polls() {
    let h = harness(fast_config(2, 3), Script::default());
    let receipt = h
        .orchestrator
        .submit_crawl(facebook_request())
        .await
        .expect("submit");
    h.orchestrator.drain().await;

    let status = status_of(&h.orchestrator, receipt.job_id).await;
    assert_eq!(status.state, JobState::Timeout);
    assert_eq!(status.poll_count, 3);
    assert_eq!(h.provider.polls_for(&receipt.remote_job_id), 3);
    assert_eq!(status.failure.expect("failure").stage, FailureStage::Timeout);

    let failed = h.publisher.of_kind(EventKind::Failed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].to_message()["error_stage"], "timeout");
    assert!(h.publisher.of_kind(EventKind::Completed).is_empty());
}

#[tokio::test]
async fn concatenated_download_completes_with_snapshot() {
    let h = harness(
        fast_config(2, 10),
        Script {
            ready_after: Some(2),
            payload: TWO_POSTS.to_vec(),
            ..Script::default()
        },
    );
    let receipt = h
        .orchestrator
        .submit_crawl(facebook_request())
        .await
        .expect("submit");
    h.orchestrator.drain().await;

    let status = status_of(&h.orchestrator, receipt.job_id).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.record_count, Some(2));
    let location = status.result_location.expect("location");
    let path = location.strip_prefix("memory://").expect("memory location");
    assert!(path.starts_with("platform=facebook/competitor=acme/brand=cola/category=drinks/"));

    let object = h.objects.get(path).expect("snapshot stored");
    assert!(object.content_type.starts_with("application/json"));
    let document: Value = serde_json::from_slice(&object.bytes).expect("snapshot json");
    assert_eq!(document["record_count"], 2);
    assert_eq!(document["remote_job_id"], receipt.remote_job_id.as_str());
    assert_eq!(document["records"][1]["likes"], 5);

    let completed = h.publisher.of_kind(EventKind::Completed);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].to_message()["record_count"], 2);

    let events = h.publisher.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind(), EventKind::Triggered);

    let stored = h
        .metadata
        .get(receipt.job_id)
        .await
        .expect("metadata")
        .expect("recorded");
    assert_eq!(stored.state(), JobState::Completed);
}

#[tokio::test]
async fn storage_failure_leaves_no_partial_snapshot() {
    let broken: Arc<BrokenObjectStore> = Arc::new(BrokenObjectStore::default());
    let h = harness_with(
        fast_config(1, 10),
        Script {
            ready_after: Some(1),
            payload: TWO_POSTS.to_vec(),
            ..Script::default()
        },
        Some(broken.clone() as Arc<dyn ObjectStore>),
    );
    let receipt = h
        .orchestrator
        .submit_crawl(facebook_request())
        .await
        .expect("submit");
    h.orchestrator.drain().await;

    let status = status_of(&h.orchestrator, receipt.job_id).await;
    assert_eq!(status.state, JobState::Failed);
    assert!(status.result_location.is_none());
    assert_eq!(status.failure.expect("failure").stage, FailureStage::Storage);
    assert!(broken.inner.paths().is_empty());

    let failed = h.publisher.of_kind(EventKind::Failed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].to_message()["error_stage"], "storage");
}

#[tokio::test]
async fn provider_reported_failure_is_attributed_to_provider() {
    let h = harness(
        fast_config(1, 10),
        Script {
            failure: Some("login wall".into()),
            ..Script::default()
        },
    );
    let receipt = h
        .orchestrator
        .submit_crawl(facebook_request())
        .await
        .expect("submit");
    h.orchestrator.drain().await;

    let status = status_of(&h.orchestrator, receipt.job_id).await;
    assert_eq!(status.state, JobState::Failed);
    let failure = status.failure.expect("failure");
    assert_eq!(failure.stage, FailureStage::Provider);
    assert_eq!(failure.message, "login wall");
}

#[tokio::test]
async fn slow_download_fails_with_download_timeout() {
    let mut config = fast_config(1, 10);
    config.download_timeout = Duration::from_millis(30);
    let h = harness(
        config,
        Script {
            ready_after: Some(1),
            payload: TWO_POSTS.to_vec(),
            download_delay: Duration::from_millis(500),
            ..Script::default()
        },
    );
    let receipt = h
        .orchestrator
        .submit_crawl(facebook_request())
        .await
        .expect("submit");
    h.orchestrator.drain().await;

    let status = status_of(&h.orchestrator, receipt.job_id).await;
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(
        status.failure.expect("failure").stage,
        FailureStage::DownloadTimeout
    );
}

#[tokio::test]
async fn undecodable_payload_fails_decode_and_is_kept_when_enabled() {
    let mut config = fast_config(1, 10);
    config.keep_failed_payloads = true;
    let h = harness(
        config,
        Script {
            ready_after: Some(1),
            payload: b"<html>rate limited</html>".to_vec(),
            ..Script::default()
        },
    );
    let receipt = h
        .orchestrator
        .submit_crawl(facebook_request())
        .await
        .expect("submit");
    h.orchestrator.drain().await;

    let status = status_of(&h.orchestrator, receipt.job_id).await;
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.failure.expect("failure").stage, FailureStage::Decode);
    assert_eq!(
        h.objects.paths(),
        vec![format!("failed_payloads/platform=facebook/{}.txt", receipt.job_id)]
    );
}

#[tokio::test]
async fn single_worker_admits_jobs_in_submission_order() {
    let h = harness(
        fast_config(1, 10),
        Script {
            ready_after: Some(2),
            payload: TWO_POSTS.to_vec(),
            ..Script::default()
        },
    );
    let mut remotes = Vec::new();
    for _ in 0..4 {
        let receipt = h
            .orchestrator
            .submit_crawl(facebook_request())
            .await
            .expect("submit");
        remotes.push(receipt.remote_job_id.as_str().to_string());
    }
    h.orchestrator.drain().await;

    assert_eq!(*h.provider.first_polls.lock().expect("lock"), remotes);
    assert_eq!(h.provider.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(h.publisher.of_kind(EventKind::Completed).len(), 4);
}

#[tokio::test]
async fn worker_pool_bounds_concurrent_jobs() {
    let h = harness(
        fast_config(2, 10),
        Script {
            ready_after: Some(3),
            payload: TWO_POSTS.to_vec(),
            ..Script::default()
        },
    );
    let mut job_ids = Vec::new();
    for _ in 0..5 {
        let receipt = h
            .orchestrator
            .submit_crawl(facebook_request())
            .await
            .expect("submit");
        job_ids.push(receipt.job_id);
    }
    assert!(h.orchestrator.active_workers() <= 2);
    h.orchestrator.drain().await;

    assert_eq!(h.provider.max_in_flight.load(Ordering::SeqCst), 2);
    for job_id in job_ids {
        assert_eq!(
            status_of(&h.orchestrator, job_id).await.state,
            JobState::Completed
        );
    }
    assert_eq!(h.orchestrator.registry().claimed_count(), 0);
}

#[tokio::test]
async fn invalid_request_is_rejected_before_trigger() {
    let h = harness(fast_config(1, 10), Script::default());
    let err = h
        .orchestrator
        .submit_crawl(CrawlRequest::new(
            Platform::Facebook,
            "https://www.tiktok.com/@acme",
        ))
        .await
        .expect_err("cross-platform url");
    assert!(matches!(
        err,
        SubmitError::InvalidRequest {
            platform: Platform::Facebook,
            ..
        }
    ));
    assert_eq!(h.provider.triggers.load(Ordering::SeqCst), 0);
    assert!(h.orchestrator.registry().is_empty());
    assert!(h.publisher.events().is_empty());
}

#[tokio::test]
async fn platform_without_provider_client_is_rejected() {
    let h = harness(fast_config(1, 10), Script::default());
    let err = h
        .orchestrator
        .submit_crawl(CrawlRequest::new(
            Platform::TikTok,
            "https://www.tiktok.com/@acme",
        ))
        .await
        .expect_err("no apify client");
    assert!(matches!(
        err,
        SubmitError::Provider(ProviderError::NotConfigured(Provider::Apify))
    ));
}

#[tokio::test]
async fn terminal_jobs_are_not_resumed() {
    let h = harness(
        fast_config(1, 10),
        Script {
            ready_after: Some(1),
            payload: TWO_POSTS.to_vec(),
            ..Script::default()
        },
    );

    let mut finished = CrawlJob::new(facebook_request());
    finished
        .assign_remote_job_id(RemoteJobId::new("old-1"))
        .expect("assign");
    finished.advance(JobState::Polling).expect("polling");
    finished
        .fail(FailureStage::Timeout, "remote job not ready")
        .expect("timeout");
    h.metadata.record(&finished).await.expect("record");

    let mut pending = CrawlJob::new(facebook_request());
    pending
        .assign_remote_job_id(RemoteJobId::new("old-2"))
        .expect("assign");
    pending.advance(JobState::Polling).expect("polling");
    h.metadata.record(&pending).await.expect("record");

    assert_eq!(h.orchestrator.resume_unfinished().await.expect("resume"), 1);
    h.orchestrator.drain().await;

    assert_eq!(h.provider.polls_for(&RemoteJobId::new("old-1")), 0);
    assert_eq!(
        status_of(&h.orchestrator, finished.job_id()).await.state,
        JobState::Timeout
    );
    assert_eq!(
        status_of(&h.orchestrator, pending.job_id()).await.state,
        JobState::Completed
    );
    assert_eq!(h.publisher.of_kind(EventKind::Failed).len(), 0);
}

#[tokio::test]
async fn shutdown_leaves_job_resumable() {
    let mut config = fast_config(1, 10);
    config.poll_interval = Duration::from_secs(60);
    let h = harness(config.clone(), Script::default());
    let receipt = h
        .orchestrator
        .submit_crawl(facebook_request())
        .await
        .expect("submit");

    let provider = h.provider.clone();
    let remote = receipt.remote_job_id.clone();
    wait_until(|| provider.polls_for(&remote) >= 1).await;
    tokio::time::timeout(Duration::from_secs(5), h.orchestrator.shutdown())
        .await
        .expect("shutdown does not wait for the poll interval");

    let interrupted = status_of(&h.orchestrator, receipt.job_id).await;
    assert_eq!(interrupted.state, JobState::Polling);
    assert_eq!(interrupted.poll_count, 1);
    assert!(h.publisher.of_kind(EventKind::Failed).is_empty());
    assert!(matches!(
        h.orchestrator.submit_crawl(facebook_request()).await,
        Err(SubmitError::ShuttingDown)
    ));

    h.provider.set_script(Script {
        ready_after: Some(2),
        payload: TWO_POSTS.to_vec(),
        ..Script::default()
    });
    let restarted = PollingOrchestrator::start(config, h.deps.clone());
    assert_eq!(restarted.resume_unfinished().await.expect("resume"), 1);
    restarted.drain().await;

    let resumed = status_of(&restarted, receipt.job_id).await;
    assert_eq!(resumed.state, JobState::Completed);
    assert_eq!(resumed.poll_count, 2);
    assert_eq!(h.publisher.of_kind(EventKind::Completed).len(), 1);
}

#[tokio::test]
async fn evicted_jobs_fall_back_to_metadata_status() {
    let mut config = fast_config(1, 10);
    config.retention = Duration::ZERO;
    let h = harness(
        config,
        Script {
            ready_after: Some(1),
            payload: TWO_POSTS.to_vec(),
            ..Script::default()
        },
    );
    let receipt = h
        .orchestrator
        .submit_crawl(facebook_request())
        .await
        .expect("submit");
    h.orchestrator.drain().await;

    assert_eq!(h.orchestrator.evict_expired(), 1);
    assert!(!h.orchestrator.registry().contains(receipt.job_id));
    let status = status_of(&h.orchestrator, receipt.job_id).await;
    assert_eq!(status.state, JobState::Completed);
    assert!(h.orchestrator.get_status(JobId::new()).await.expect("lookup").is_none());
}

#[tokio::test]
async fn transient_status_errors_are_retried_within_one_poll() {
    let h = harness(
        fast_config(1, 10),
        Script {
            ready_after: Some(3),
            payload: TWO_POSTS.to_vec(),
            ..Script::default()
        },
    );
    h.provider.queue_status_errors(&[503, 503]);
    let receipt = h
        .orchestrator
        .submit_crawl(facebook_request())
        .await
        .expect("submit");
    h.orchestrator.drain().await;

    let status = status_of(&h.orchestrator, receipt.job_id).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.poll_count, 1);
    assert_eq!(h.provider.polls_for(&receipt.remote_job_id), 3);
}

#[tokio::test]
async fn exhausted_transient_checks_consume_polls_but_never_fail() {
    let h = harness(fast_config(1, 2), Script::default());
    // Two polls, each a first try plus two retries.
    h.provider.queue_status_errors(&[503; 6]);
    let receipt = h
        .orchestrator
        .submit_crawl(facebook_request())
        .await
        .expect("submit");
    h.orchestrator.drain().await;

    let status = status_of(&h.orchestrator, receipt.job_id).await;
    assert_eq!(status.state, JobState::Timeout);
    assert_eq!(status.poll_count, 2);
    assert_eq!(h.provider.polls_for(&receipt.remote_job_id), 6);
    assert_eq!(status.failure.expect("failure").stage, FailureStage::Timeout);
}

#[tokio::test]
async fn exhausted_transient_check_is_followed_by_a_fresh_poll() {
    let h = harness(
        fast_config(1, 5),
        Script {
            ready_after: Some(4),
            payload: TWO_POSTS.to_vec(),
            ..Script::default()
        },
    );
    h.provider.queue_status_errors(&[503, 429, 502]);
    let receipt = h
        .orchestrator
        .submit_crawl(facebook_request())
        .await
        .expect("submit");
    h.orchestrator.drain().await;

    let status = status_of(&h.orchestrator, receipt.job_id).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.poll_count, 2);
    assert_eq!(h.provider.polls_for(&receipt.remote_job_id), 4);
    assert!(h.publisher.of_kind(EventKind::Failed).is_empty());
}

#[tokio::test]
async fn non_transient_status_error_fails_at_polling_stage() {
    let h = harness(fast_config(1, 10), Script::default());
    h.provider.queue_status_errors(&[401]);
    let receipt = h
        .orchestrator
        .submit_crawl(facebook_request())
        .await
        .expect("submit");
    h.orchestrator.drain().await;

    let status = status_of(&h.orchestrator, receipt.job_id).await;
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.poll_count, 1);
    assert_eq!(h.provider.polls_for(&receipt.remote_job_id), 1);
    assert_eq!(status.failure.expect("failure").stage, FailureStage::Polling);

    let failed = h.publisher.of_kind(EventKind::Failed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].to_message()["error_stage"], "polling");
}

#[tokio::test]
async fn publish_outage_does_not_undo_completion() {
    let h = harness(
        fast_config(1, 10),
        Script {
            ready_after: Some(1),
            payload: TWO_POSTS.to_vec(),
            ..Script::default()
        },
    );
    let down = Arc::new(DownPublisher {
        attempts: AtomicUsize::new(0),
    });
    let orchestrator = PollingOrchestrator::start(
        fast_config(1, 10),
        Dependencies {
            publisher: down.clone(),
            ..h.deps.clone()
        },
    );
    let receipt = orchestrator
        .submit_crawl(facebook_request())
        .await
        .expect("submit survives a failed triggered event");
    orchestrator.drain().await;

    let status = status_of(&orchestrator, receipt.job_id).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.record_count, Some(2));
    assert!(status.result_location.is_some());

    let stored = h
        .metadata
        .get(receipt.job_id)
        .await
        .expect("metadata")
        .expect("recorded");
    assert_eq!(stored.state(), JobState::Completed);
    assert!(stored.result_location().is_some());

    // Triggered and completed, each tried once plus two retries.
    assert_eq!(down.attempts.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn http_timeout_during_download_is_a_download_timeout() {
    let app = Router::new()
        .route(
            "/trigger",
            post(|| async { Json(json!({"snapshot_id": "s_slow"})) }),
        )
        .route(
            "/progress/{id}",
            get(|Path(_id): Path<String>| async { Json(json!({"status": "ready"})) }),
        )
        .route(
            "/snapshot/{id}",
            get(|Path(_id): Path<String>| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "[]"
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let http = HttpClientConfig {
        timeout: Duration::from_millis(100),
        ..HttpClientConfig::default()
    };
    let client = BrightDataClient::new(&http, "key", Some(format!("http://{addr}")))
        .expect("client");
    let publisher = Arc::new(MemoryPublisher::new());
    let orchestrator = PollingOrchestrator::start(
        fast_config(1, 5),
        Dependencies {
            platforms: PlatformRegistry::builtin(),
            providers: ProviderClients::new().with(Arc::new(client)),
            objects: Arc::new(MemoryObjectStore::new()),
            metadata: Arc::new(MemoryMetadataStore::new()),
            publisher: publisher.clone(),
        },
    );
    let receipt = orchestrator
        .submit_crawl(facebook_request())
        .await
        .expect("submit");
    orchestrator.drain().await;

    let status = status_of(&orchestrator, receipt.job_id).await;
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(
        status.failure.expect("failure").stage,
        FailureStage::DownloadTimeout
    );
    assert_eq!(
        publisher.of_kind(EventKind::Failed)[0].to_message()["error_stage"],
        "download_timeout"
    );
}

#[tokio::test]
async fn resumed_ready_job_without_provider_client_is_failed() {
    let h = harness(fast_config(1, 10), Script::default());
    let mut ready = CrawlJob::new(facebook_request());
    ready
        .assign_remote_job_id(RemoteJobId::new("old-ready"))
        .expect("assign");
    ready.advance(JobState::Polling).expect("polling");
    ready.advance(JobState::Ready).expect("ready");
    h.metadata.record(&ready).await.expect("record");

    let orchestrator = PollingOrchestrator::start(
        fast_config(1, 10),
        Dependencies {
            providers: ProviderClients::new(),
            ..h.deps.clone()
        },
    );
    assert_eq!(orchestrator.resume_unfinished().await.expect("resume"), 1);
    orchestrator.drain().await;

    let status = status_of(&orchestrator, ready.job_id()).await;
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.failure.expect("failure").stage, FailureStage::Provider);
    assert_eq!(orchestrator.registry().claimed_count(), 0);
    let failed = h.publisher.of_kind(EventKind::Failed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].to_message()["error_stage"], "provider");
}

#[tokio::test]
async fn worker_panic_still_settles_the_job() {
    let h = harness(
        fast_config(1, 10),
        Script {
            ready_after: Some(1),
            panic_on_download: true,
            ..Script::default()
        },
    );
    let receipt = h
        .orchestrator
        .submit_crawl(facebook_request())
        .await
        .expect("submit");
    h.orchestrator.drain().await;

    let status = status_of(&h.orchestrator, receipt.job_id).await;
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.failure.expect("failure").stage, FailureStage::Download);
    assert_eq!(h.orchestrator.registry().claimed_count(), 0);
    assert_eq!(h.publisher.of_kind(EventKind::Failed).len(), 1);
    let stored = h
        .metadata
        .get(receipt.job_id)
        .await
        .expect("metadata")
        .expect("recorded");
    assert_eq!(stored.state(), JobState::Failed);
}

//! Background polling pool driving crawl jobs to a terminal state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use ingest_core::{
    BackoffPolicy, BusinessContext, CrawlJob, CrawlRequest, FailureStage, JobFailure, JobId,
    JobState, JobStatus, LifecycleEvent, NormalizedRecord, Platform, RemoteJobId,
    TransitionError,
};
use ingest_platforms::{failed_payload_path, PlatformHandler, PlatformRegistry};
use ingest_providers::{ProviderClient, ProviderClients, ProviderError, RemoteStatus};
use ingest_storage::{MetadataError, MetadataStore, ObjectStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::OrchestratorConfig;
use crate::publisher::{publish_with_retry, EventPublisher};
use crate::registry::{JobClaim, JobRegistry, RegistryError};

const SNAPSHOT_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Collaborators injected into the orchestrator.
#[derive(Clone)]
pub struct Dependencies {
    pub platforms: PlatformRegistry,
    pub providers: ProviderClients,
    pub objects: Arc<dyn ObjectStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub publisher: Arc<dyn EventPublisher>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub remote_job_id: RemoteJobId,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("platform {0} is not configured")]
    UnsupportedPlatform(Platform),
    #[error("invalid {platform} crawl request for {url:?}")]
    InvalidRequest { platform: Platform, url: String },
    #[error("provider rejected the crawl: {0}")]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

/// Why a worker stopped before its job reached a terminal state.
#[derive(Debug, Error)]
enum Interrupted {
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

enum PollOutcome {
    Ready,
    Failed(FailureStage, String),
}

struct Admission {
    claim: JobClaim,
}

#[derive(Serialize)]
struct SnapshotDocument<'a> {
    job_id: JobId,
    platform: Platform,
    remote_job_id: &'a RemoteJobId,
    business_context: &'a BusinessContext,
    collected_at: DateTime<Utc>,
    record_count: usize,
    media_count: u64,
    records: &'a [NormalizedRecord],
}

struct Inner {
    config: OrchestratorConfig,
    deps: Dependencies,
    registry: Arc<JobRegistry>,
}

/// Owns the bounded worker pool. Jobs are admitted in submission order and
/// each one is driven by exactly one worker from admission to a terminal
/// state, or until cancellation.
pub struct PollingOrchestrator {
    inner: Arc<Inner>,
    admissions: Mutex<Option<mpsc::UnboundedSender<Admission>>>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl PollingOrchestrator {
    /// Spawn the dispatcher on the current runtime.
    pub fn start(config: OrchestratorConfig, deps: Dependencies) -> Self {
        let max_workers = config.max_workers.max(1);
        let inner = Arc::new(Inner {
            config,
            deps,
            registry: Arc::new(JobRegistry::new()),
        });
        let slots = Arc::new(Semaphore::new(max_workers));
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let dispatcher = tokio::spawn(
            dispatch(Arc::clone(&inner), rx, Arc::clone(&slots), cancel.clone())
                .instrument(info_span!("dispatcher", max_workers)),
        );
        info!(max_workers, "polling orchestrator started");

        Self {
            inner,
            admissions: Mutex::new(Some(tx)),
            dispatcher: tokio::sync::Mutex::new(Some(dispatcher)),
            slots,
            cancel,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Jobs currently holding a worker slot.
    pub fn active_workers(&self) -> usize {
        self.inner.config.max_workers.max(1) - self.slots.available_permits()
    }

    /// Validate, trigger the remote job and enqueue it for polling. Returns as
    /// soon as the provider has accepted the job.
    pub async fn submit_crawl(&self, request: CrawlRequest) -> Result<SubmitReceipt, SubmitError> {
        if self.cancel.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }
        let platform = request.platform;
        let handler = self
            .inner
            .deps
            .platforms
            .handler(platform)
            .ok_or(SubmitError::UnsupportedPlatform(platform))?;
        if !handler.validate(&request) {
            return Err(SubmitError::InvalidRequest {
                platform,
                url: request.url.clone(),
            });
        }
        let provider_request = handler.build_request(&request);
        let client = self.inner.deps.providers.get(provider_request.provider)?;

        let remote_job_id = client.trigger(&provider_request).await?;
        let mut job = CrawlJob::new(request);
        job.assign_remote_job_id(remote_job_id.clone())?;
        let job_id = job.job_id();
        info!(%job_id, %remote_job_id, %platform, provider = %provider_request.provider, "remote job accepted");

        self.inner.record(&job).await;
        self.inner.registry.insert(job.clone())?;
        let claim = self.inner.registry.claim(job_id)?;

        let event = LifecycleEvent::triggered(
            job_id,
            remote_job_id.clone(),
            platform,
            job.business_context().clone(),
        );
        self.inner.publish(event).await;

        self.admit(claim)?;
        Ok(SubmitReceipt {
            job_id,
            remote_job_id,
        })
    }

    fn admit(&self, claim: JobClaim) -> Result<(), SubmitError> {
        let admissions = self
            .admissions
            .lock()
            .map_err(|_| SubmitError::ShuttingDown)?;
        let tx = admissions.as_ref().ok_or(SubmitError::ShuttingDown)?;
        tx.send(Admission { claim })
            .map_err(|_| SubmitError::ShuttingDown)
    }

    /// Live registry first, then the metadata store for evicted or
    /// pre-restart jobs.
    pub async fn get_status(&self, job_id: JobId) -> Result<Option<JobStatus>, MetadataError> {
        let now = Utc::now();
        if let Some(status) = self.inner.registry.status(job_id, now) {
            return Ok(Some(status));
        }
        Ok(self
            .inner
            .deps
            .metadata
            .get(job_id)
            .await?
            .map(|job| job.status(now)))
    }

    /// Re-admit non-terminal jobs left behind by a previous process.
    pub async fn resume_unfinished(&self) -> Result<usize, SubmitError> {
        let unfinished = self.inner.deps.metadata.list_unfinished().await?;
        let mut resumed = 0;
        for job in unfinished {
            let job_id = job.job_id();
            if job.remote_job_id().is_none() || self.inner.registry.contains(job_id) {
                continue;
            }
            if self.inner.deps.platforms.handler(job.platform()).is_none() {
                warn!(%job_id, platform = %job.platform(), "cannot resume job for unconfigured platform");
                continue;
            }
            info!(%job_id, state = %job.state(), poll_count = job.poll_count(), "resuming job");
            self.inner.registry.insert(job)?;
            let claim = self.inner.registry.claim(job_id)?;
            self.admit(claim)?;
            resumed += 1;
        }
        Ok(resumed)
    }

    pub fn evict_expired(&self) -> usize {
        self.inner
            .registry
            .evict_terminal(self.inner.config.retention, Utc::now())
    }

    /// Cron job that evicts expired terminal jobs from the live registry.
    pub async fn eviction_scheduler(&self, cron: &str) -> anyhow::Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let registry = Arc::clone(&self.inner.registry);
        let retention = self.inner.config.retention;
        let job = Job::new_async(cron, move |_uuid, _l| {
            let registry = Arc::clone(&registry);
            Box::pin(async move {
                let evicted = registry.evict_terminal(retention, Utc::now());
                if evicted > 0 {
                    info!(evicted, remaining = registry.len(), "evicted terminal jobs");
                }
            })
        })
        .with_context(|| format!("creating eviction job for cron {cron}"))?;
        sched.add(job).await.context("adding eviction job")?;
        Ok(sched)
    }

    /// Stop accepting work and wait for every admitted job to finish.
    pub async fn drain(&self) {
        if let Ok(mut admissions) = self.admissions.lock() {
            admissions.take();
        }
        self.join_dispatcher().await;
    }

    /// Abort in-flight polling promptly. Unfinished jobs keep their last
    /// known state for a later [`resume_unfinished`](Self::resume_unfinished).
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Ok(mut admissions) = self.admissions.lock() {
            admissions.take();
        }
        self.join_dispatcher().await;
        info!("polling orchestrator stopped");
    }

    // The handle stays in place until joined so an abandoned drain() can be
    // followed by shutdown().
    async fn join_dispatcher(&self) {
        let mut slot = self.dispatcher.lock().await;
        if let Some(handle) = slot.as_mut() {
            if let Err(err) = handle.await {
                error!(error = %err, "dispatcher task failed");
            }
            *slot = None;
        }
    }
}

async fn dispatch(
    inner: Arc<Inner>,
    mut admissions: mpsc::UnboundedReceiver<Admission>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    let mut workers = JoinSet::new();
    loop {
        while let Some(joined) = workers.try_join_next() {
            log_worker_exit(joined);
        }

        let admission = tokio::select! {
            _ = cancel.cancelled() => break,
            next = admissions.recv() => match next {
                Some(admission) => admission,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let job_id = admission.claim.job_id();
        let (platform, remote_job_id) = match admission.claim.snapshot() {
            Ok(job) => (
                job.platform().as_str(),
                job.remote_job_id().map(|id| id.to_string()).unwrap_or_default(),
            ),
            Err(_) => ("unknown", String::new()),
        };
        let span = info_span!("crawl_job", %job_id, platform, %remote_job_id);
        workers.spawn(
            run_worker(Arc::clone(&inner), admission, permit, cancel.clone()).instrument(span),
        );
    }

    // Queued admissions are dropped here, releasing their claims.
    admissions.close();
    while let Some(joined) = workers.join_next().await {
        log_worker_exit(joined);
    }
}

fn log_worker_exit(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "job worker panicked");
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    admission: Admission,
    _permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
) {
    let job_id = admission.claim.job_id();
    // The lifecycle runs in its own task so a panic still ends in a terminal state.
    let lifecycle = tokio::spawn({
        let inner = Arc::clone(&inner);
        async move {
            let claim = admission.claim;
            let outcome = inner.drive(&claim, &cancel).await;
            (claim, outcome)
        }
        .in_current_span()
    });

    match lifecycle.await {
        Ok((_, Ok(()))) => {}
        Ok((claim, Err(Interrupted::Cancelled))) => {
            let state = claim.state().map(|s| s.as_str()).unwrap_or("unknown");
            info!(state, "job interrupted by shutdown; left for resume");
        }
        Ok((claim, Err(err))) => {
            error!(error = %err, "job worker stopped unexpectedly");
            inner.abandon(&claim, err.to_string()).await;
        }
        Err(err) => {
            error!(error = %err, "job worker panicked");
            match inner.registry.claim(job_id) {
                Ok(claim) => inner.abandon(&claim, format!("worker panicked: {err}")).await,
                Err(claim_err) => error!(error = %claim_err, "cannot settle job after panic"),
            }
        }
    }
}

impl Inner {
    async fn drive(&self, claim: &JobClaim, cancel: &CancellationToken) -> Result<(), Interrupted> {
        let job = claim.snapshot()?;
        let platform = job.platform();
        let Some(remote_job_id) = job.remote_job_id().cloned() else {
            return Err(TransitionError::MissingRemoteJobId.into());
        };
        let Some(handler) = self.deps.platforms.handler(platform) else {
            return self
                .fail_from_any(
                    claim,
                    FailureStage::Provider,
                    format!("platform {platform} is not configured"),
                )
                .await;
        };
        let client = match self.deps.providers.get(handler.config().provider) {
            Ok(client) => client,
            Err(err) => {
                return self
                    .fail_from_any(claim, FailureStage::Provider, err.to_string())
                    .await;
            }
        };
        info!(%remote_job_id, %platform, state = %job.state(), "job admitted");

        loop {
            match claim.state()? {
                JobState::Started => self.transition(claim, JobState::Polling).await?,
                JobState::Polling => {
                    match self
                        .poll_until_settled(claim, client.as_ref(), &remote_job_id, cancel)
                        .await?
                    {
                        PollOutcome::Ready => self.transition(claim, JobState::Ready).await?,
                        PollOutcome::Failed(stage, message) => {
                            return self.fail(claim, stage, message).await;
                        }
                    }
                }
                JobState::Ready => self.transition(claim, JobState::Downloading).await?,
                JobState::Downloading => {
                    return self
                        .download_and_store(claim, handler.as_ref(), client.as_ref(), &remote_job_id, cancel)
                        .await;
                }
                JobState::Completed | JobState::Failed | JobState::Timeout => return Ok(()),
            }
        }
    }

    async fn poll_until_settled(
        &self,
        claim: &JobClaim,
        client: &dyn ProviderClient,
        remote_job_id: &RemoteJobId,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, Interrupted> {
        let max_polls = self.config.max_polls.max(1);
        loop {
            let job = claim.snapshot()?;
            if job.poll_count() >= max_polls {
                return Ok(PollOutcome::Failed(
                    FailureStage::Timeout,
                    format!("remote job not ready after {max_polls} status checks"),
                ));
            }

            let result = self
                .check_status(client, remote_job_id, cancel, job.poll_count() + 1)
                .await?;
            let (_, job) = claim.update(|job| job.record_poll(Utc::now()))?;
            let attempt = job.poll_count();

            match result {
                Ok(RemoteStatus::Ready) => {
                    info!(attempt, "remote job ready");
                    return Ok(PollOutcome::Ready);
                }
                Ok(RemoteStatus::Failed(detail)) => {
                    error!(attempt, stage = "provider", detail, "provider reported failure");
                    return Ok(PollOutcome::Failed(FailureStage::Provider, detail));
                }
                Ok(RemoteStatus::Processing) => debug!(attempt, "remote job still processing"),
                Err(err) if err.is_transient() => warn!(
                    attempt,
                    transient = true,
                    error = %err,
                    "status check failed after retries; counting as a poll attempt"
                ),
                Err(err) => {
                    error!(attempt, stage = "polling", error = %err, "status check failed");
                    return Ok(PollOutcome::Failed(FailureStage::Polling, err.to_string()));
                }
            }

            if attempt >= max_polls {
                warn!(attempt, stage = "timeout", "poll budget exhausted");
                return Ok(PollOutcome::Failed(
                    FailureStage::Timeout,
                    format!("remote job not ready after {max_polls} status checks"),
                ));
            }

            self.transition(claim, JobState::Polling).await?;
            sleep_or_cancel(self.config.poll_interval, cancel).await?;
        }
    }

    /// One status check, retrying transient errors with backoff.
    async fn check_status(
        &self,
        client: &dyn ProviderClient,
        remote_job_id: &RemoteJobId,
        cancel: &CancellationToken,
        poll: u32,
    ) -> Result<Result<RemoteStatus, ProviderError>, Interrupted> {
        let policy = &self.config.status_retry;
        let mut retry = 0;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Interrupted::Cancelled),
                result = client.poll_status(remote_job_id) => result,
            };
            match result {
                Err(err) if err.is_transient() && retry < policy.max_retries => {
                    warn!(poll, retry, transient = true, error = %err, "status check failed; retrying");
                    sleep_or_cancel(policy.delay_for_attempt(retry), cancel).await?;
                    retry += 1;
                }
                other => return Ok(other),
            }
        }
    }

    async fn download_and_store(
        &self,
        claim: &JobClaim,
        handler: &dyn PlatformHandler,
        client: &dyn ProviderClient,
        remote_job_id: &RemoteJobId,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted> {
        let deadline = self.config.download_timeout;
        let download = download_with_retry(client, remote_job_id, &self.config.status_retry);
        let raw = tokio::select! {
            _ = cancel.cancelled() => return Err(Interrupted::Cancelled),
            result = tokio::time::timeout(deadline, download) => result,
        };
        let raw = match raw {
            Err(_) => {
                return self
                    .fail(
                        claim,
                        FailureStage::DownloadTimeout,
                        format!("download did not finish within {}s", deadline.as_secs_f64()),
                    )
                    .await;
            }
            Ok(Err(err)) if err.is_timeout() => {
                return self
                    .fail(claim, FailureStage::DownloadTimeout, err.to_string())
                    .await;
            }
            Ok(Err(err)) => {
                return self.fail(claim, FailureStage::Download, err.to_string()).await;
            }
            Ok(Ok(raw)) => raw,
        };
        info!(bytes = raw.len(), "result downloaded");

        let job = claim.snapshot()?;
        let records = match handler.decode_response(&raw) {
            Ok(records) => records,
            Err(err) => {
                if self.config.keep_failed_payloads {
                    self.keep_failed_payload(&job, &raw).await;
                }
                return self.fail(claim, FailureStage::Decode, err.to_string()).await;
            }
        };

        let collected_at = Utc::now();
        let media_count: u64 = records.iter().map(|r| u64::from(r.media_count())).sum();
        let document = SnapshotDocument {
            job_id: job.job_id(),
            platform: job.platform(),
            remote_job_id,
            business_context: job.business_context(),
            collected_at,
            record_count: records.len(),
            media_count,
            records: &records,
        };
        let bytes = match serde_json::to_vec(&document) {
            Ok(bytes) => bytes,
            Err(err) => return self.fail(claim, FailureStage::Storage, err.to_string()).await,
        };

        let path = handler.storage_path(job.job_id(), job.business_context(), collected_at);
        let stored = match self
            .deps
            .objects
            .put(&path, &bytes, SNAPSHOT_CONTENT_TYPE)
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                error!(stage = "storage", path, error = %err, "snapshot write failed");
                return self.fail(claim, FailureStage::Storage, err.to_string()).await;
            }
        };

        let (outcome, job) = claim.update(|job| job.complete(stored.location.clone(), records.len()))?;
        outcome?;
        info!(
            location = %stored.location,
            records = records.len(),
            media_count,
            sha256 = %stored.content_hash,
            "job completed"
        );
        self.record(&job).await;
        self.publish(LifecycleEvent::completed(
            job.job_id(),
            stored.location,
            records.len(),
            media_count,
            job.platform(),
            job.business_context().clone(),
        ))
        .await;
        Ok(())
    }

    async fn keep_failed_payload(&self, job: &CrawlJob, raw: &[u8]) {
        let path = failed_payload_path(job.platform(), job.job_id());
        match self
            .deps
            .objects
            .put(&path, raw, "text/plain; charset=utf-8")
            .await
        {
            Ok(stored) => info!(location = %stored.location, "undecodable payload kept"),
            Err(err) => warn!(path, error = %err, "could not keep undecodable payload"),
        }
    }

    async fn transition(&self, claim: &JobClaim, next: JobState) -> Result<(), Interrupted> {
        let (outcome, job) = claim.update(|job| {
            let from = job.state();
            job.advance(next).map(|()| from)
        })?;
        let from = outcome?;
        if from != next {
            debug!(from = %from, to = %next, "state transition");
        }
        // Also persists the poll counter on self-loops.
        self.record(&job).await;
        Ok(())
    }

    async fn fail(
        &self,
        claim: &JobClaim,
        stage: FailureStage,
        message: String,
    ) -> Result<(), Interrupted> {
        let (outcome, job) = claim.update(|job| job.fail(stage, message.clone()))?;
        outcome?;
        warn!(stage = %stage, state = %job.state(), error = %message, "job failed");
        self.record(&job).await;
        self.publish(LifecycleEvent::failed(
            job.job_id(),
            JobFailure { stage, message },
            job.platform(),
        ))
        .await;
        Ok(())
    }

    /// Fail a job from any non-terminal state, first stepping along the
    /// lifecycle to the nearest state with a failing edge.
    async fn fail_from_any(
        &self,
        claim: &JobClaim,
        stage: FailureStage,
        message: String,
    ) -> Result<(), Interrupted> {
        match claim.state()? {
            JobState::Started => self.transition(claim, JobState::Polling).await?,
            JobState::Ready => self.transition(claim, JobState::Downloading).await?,
            JobState::Completed | JobState::Failed | JobState::Timeout => return Ok(()),
            JobState::Polling | JobState::Downloading => {}
        }
        let stage = match (claim.state()?, stage) {
            (JobState::Downloading, FailureStage::Timeout) => FailureStage::DownloadTimeout,
            (_, stage) => stage,
        };
        self.fail(claim, stage, message).await
    }

    /// Last resort for a worker that stopped without settling its job.
    async fn abandon(&self, claim: &JobClaim, message: String) {
        let stage = match claim.state() {
            Ok(JobState::Ready | JobState::Downloading) => FailureStage::Download,
            Ok(_) => FailureStage::Polling,
            Err(err) => {
                error!(error = %err, "cannot read state of abandoned job");
                return;
            }
        };
        if let Err(err) = self.fail_from_any(claim, stage, message).await {
            error!(error = %err, "abandoned job could not be failed");
        }
    }

    /// Metadata writes never decide the job outcome.
    async fn record(&self, job: &CrawlJob) {
        if let Err(err) = self.deps.metadata.record(job).await {
            warn!(job_id = %job.job_id(), state = %job.state(), error = %err, "metadata write failed");
        }
    }

    /// Delivery failures are reported on their own and never roll back a
    /// committed transition.
    async fn publish(&self, event: LifecycleEvent) {
        if let Err(err) =
            publish_with_retry(self.deps.publisher.as_ref(), &event, &self.config.publish_retry)
                .await
        {
            error!(
                job_id = %event.job_id,
                event = event.kind().topic(),
                error = %err,
                "event delivery failed"
            );
        }
    }
}

async fn download_with_retry(
    client: &dyn ProviderClient,
    remote_job_id: &RemoteJobId,
    policy: &BackoffPolicy,
) -> Result<Vec<u8>, ProviderError> {
    let mut retry = 0;
    loop {
        match client.download(remote_job_id).await {
            Err(err) if err.is_transient() && retry < policy.max_retries => {
                warn!(retry, transient = true, error = %err, "download failed; retrying");
                tokio::time::sleep(policy.delay_for_attempt(retry)).await;
                retry += 1;
            }
            other => return other,
        }
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), Interrupted> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Interrupted::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

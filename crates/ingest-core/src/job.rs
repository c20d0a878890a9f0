//! Crawl job record and its lifecycle state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{BusinessContext, CrawlRequest, JobId, Platform, RemoteJobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Started,
    Polling,
    Ready,
    Downloading,
    Completed,
    Failed,
    Timeout,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Started => "STARTED",
            JobState::Polling => "POLLING",
            JobState::Ready => "READY",
            JobState::Downloading => "DOWNLOADING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "STARTED" => JobState::Started,
            "POLLING" => JobState::Polling,
            "READY" => JobState::Ready,
            "DOWNLOADING" => JobState::Downloading,
            "COMPLETED" => JobState::Completed,
            "FAILED" => JobState::Failed,
            "TIMEOUT" => JobState::Timeout,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Timeout)
    }

    /// Edges of the job lifecycle graph. Terminal states have no outgoing edges.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Started, Polling)
                | (Polling, Polling)
                | (Polling, Ready)
                | (Polling, Failed)
                | (Polling, Timeout)
                | (Ready, Downloading)
                | (Downloading, Completed)
                | (Downloading, Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// The provider reported the remote job as failed.
    Provider,
    /// A status check failed with a non-retryable error.
    Polling,
    Timeout,
    Download,
    DownloadTimeout,
    Decode,
    Storage,
}

impl FailureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureStage::Provider => "provider",
            FailureStage::Polling => "polling",
            FailureStage::Timeout => "timeout",
            FailureStage::Download => "download",
            FailureStage::DownloadTimeout => "download_timeout",
            FailureStage::Decode => "decode",
            FailureStage::Storage => "storage",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub stage: FailureStage,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal transition {from} -> {to}")]
    Illegal { from: JobState, to: JobState },
    #[error("remote job id must be assigned before polling")]
    MissingRemoteJobId,
    #[error("remote job id already assigned")]
    RemoteJobIdAlreadySet,
    #[error("completed jobs require a non-empty result location")]
    EmptyResultLocation,
    #[error("{0} must be reached through complete() or fail()")]
    OutcomeRequired(JobState),
}

/// One submitted crawl request and its orchestration bookkeeping.
///
/// State-bearing fields are private so every change goes through the
/// transition checks below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlJob {
    job_id: JobId,
    request: CrawlRequest,
    remote_job_id: Option<RemoteJobId>,
    state: JobState,
    poll_count: u32,
    created_at: DateTime<Utc>,
    last_polled_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    result_location: Option<String>,
    record_count: Option<usize>,
    failure: Option<JobFailure>,
}

impl CrawlJob {
    pub fn new(request: CrawlRequest) -> Self {
        Self::with_id(JobId::new(), request, Utc::now())
    }

    pub fn with_id(job_id: JobId, request: CrawlRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            request,
            remote_job_id: None,
            state: JobState::Started,
            poll_count: 0,
            created_at,
            last_polled_at: None,
            finished_at: None,
            result_location: None,
            record_count: None,
            failure: None,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn platform(&self) -> Platform {
        self.request.platform
    }

    pub fn business_context(&self) -> &BusinessContext {
        &self.request.business_context
    }

    pub fn request(&self) -> &CrawlRequest {
        &self.request
    }

    pub fn remote_job_id(&self) -> Option<&RemoteJobId> {
        self.remote_job_id.as_ref()
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn poll_count(&self) -> u32 {
        self.poll_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_polled_at(&self) -> Option<DateTime<Utc>> {
        self.last_polled_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn result_location(&self) -> Option<&str> {
        self.result_location.as_deref()
    }

    pub fn record_count(&self) -> Option<usize> {
        self.record_count
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        self.failure.as_ref()
    }

    pub fn assign_remote_job_id(&mut self, remote: RemoteJobId) -> Result<(), TransitionError> {
        if self.remote_job_id.is_some() {
            return Err(TransitionError::RemoteJobIdAlreadySet);
        }
        self.remote_job_id = Some(remote);
        Ok(())
    }

    /// Move along a non-terminal edge of the lifecycle graph.
    pub fn advance(&mut self, next: JobState) -> Result<(), TransitionError> {
        if next.is_terminal() {
            return Err(TransitionError::OutcomeRequired(next));
        }
        self.check_edge(next)?;
        if next == JobState::Polling && self.remote_job_id.is_none() {
            return Err(TransitionError::MissingRemoteJobId);
        }
        self.state = next;
        Ok(())
    }

    pub fn record_poll(&mut self, at: DateTime<Utc>) {
        self.poll_count = self.poll_count.saturating_add(1);
        self.last_polled_at = Some(at);
    }

    pub fn complete(
        &mut self,
        result_location: impl Into<String>,
        record_count: usize,
    ) -> Result<(), TransitionError> {
        let location = result_location.into();
        if location.trim().is_empty() {
            return Err(TransitionError::EmptyResultLocation);
        }
        self.check_edge(JobState::Completed)?;
        self.state = JobState::Completed;
        self.result_location = Some(location);
        self.record_count = Some(record_count);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Enter FAILED, or TIMEOUT when the stage is [`FailureStage::Timeout`].
    pub fn fail(
        &mut self,
        stage: FailureStage,
        message: impl Into<String>,
    ) -> Result<(), TransitionError> {
        let next = if stage == FailureStage::Timeout {
            JobState::Timeout
        } else {
            JobState::Failed
        };
        self.check_edge(next)?;
        self.state = next;
        self.failure = Some(JobFailure {
            stage,
            message: message.into(),
        });
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn status(&self, now: DateTime<Utc>) -> JobStatus {
        let until = self.finished_at.unwrap_or(now);
        JobStatus {
            job_id: self.job_id,
            platform: self.platform(),
            state: self.state,
            remote_job_id: self.remote_job_id.clone(),
            poll_count: self.poll_count,
            elapsed_secs: (until - self.created_at).num_seconds().max(0) as u64,
            result_location: self.result_location.clone(),
            record_count: self.record_count,
            failure: self.failure.clone(),
        }
    }

    fn check_edge(&self, next: JobState) -> Result<(), TransitionError> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(TransitionError::Illegal {
                from: self.state,
                to: next,
            })
        }
    }
}

/// Point-in-time view returned by status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub platform: Platform,
    pub state: JobState,
    pub remote_job_id: Option<RemoteJobId>,
    pub poll_count: u32,
    pub elapsed_secs: u64,
    pub result_location: Option<String>,
    pub record_count: Option<usize>,
    pub failure: Option<JobFailure>,
}

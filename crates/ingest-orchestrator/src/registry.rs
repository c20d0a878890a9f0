//! Live registry of tracked jobs with single-owner claims.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ingest_core::{CrawlJob, JobId, JobState, JobStatus};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("job {0} is already registered")]
    Duplicate(JobId),
    #[error("job {0} is not registered")]
    NotFound(JobId),
    #[error("job {0} is already owned by a worker")]
    AlreadyClaimed(JobId),
    #[error("job {0} is in terminal state {1}")]
    Terminal(JobId, JobState),
    #[error("job registry lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct Entry {
    job: CrawlJob,
    claimed: bool,
}

/// Authoritative in-memory record of every tracked job. Mutation goes
/// through a [`JobClaim`], and at most one claim exists per job.
#[derive(Debug, Default)]
pub struct JobRegistry {
    entries: Mutex<HashMap<JobId, Entry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<JobId, Entry>>, RegistryError> {
        self.entries.lock().map_err(|_| RegistryError::Poisoned)
    }

    pub fn insert(&self, job: CrawlJob) -> Result<(), RegistryError> {
        let mut entries = self.lock()?;
        let job_id = job.job_id();
        if entries.contains_key(&job_id) {
            return Err(RegistryError::Duplicate(job_id));
        }
        entries.insert(job_id, Entry { job, claimed: false });
        Ok(())
    }

    /// Take exclusive ownership of a non-terminal job. Released on drop.
    pub fn claim(self: &Arc<Self>, job_id: JobId) -> Result<JobClaim, RegistryError> {
        let mut entries = self.lock()?;
        let entry = entries
            .get_mut(&job_id)
            .ok_or(RegistryError::NotFound(job_id))?;
        if entry.job.state().is_terminal() {
            return Err(RegistryError::Terminal(job_id, entry.job.state()));
        }
        if entry.claimed {
            return Err(RegistryError::AlreadyClaimed(job_id));
        }
        entry.claimed = true;
        Ok(JobClaim {
            registry: Arc::clone(self),
            job_id,
        })
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.lock()
            .map(|entries| entries.contains_key(&job_id))
            .unwrap_or(false)
    }

    pub fn get(&self, job_id: JobId) -> Option<CrawlJob> {
        self.lock()
            .ok()
            .and_then(|entries| entries.get(&job_id).map(|e| e.job.clone()))
    }

    pub fn status(&self, job_id: JobId, now: DateTime<Utc>) -> Option<JobStatus> {
        self.get(job_id).map(|job| job.status(now))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn claimed_count(&self) -> usize {
        self.lock()
            .map(|entries| entries.values().filter(|e| e.claimed).count())
            .unwrap_or(0)
    }

    /// Drop terminal jobs that finished more than `retention` before `now`.
    pub fn evict_terminal(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let Ok(mut entries) = self.lock() else {
            return 0;
        };
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let before = entries.len();
        entries.retain(|_, entry| {
            let expired = !entry.claimed
                && entry.job.state().is_terminal()
                && entry
                    .job
                    .finished_at()
                    .and_then(|at| at.checked_add_signed(retention))
                    .map(|deadline| deadline <= now)
                    .unwrap_or(false);
            !expired
        });
        before - entries.len()
    }

    fn release(&self, job_id: JobId) {
        if let Ok(mut entries) = self.lock() {
            if let Some(entry) = entries.get_mut(&job_id) {
                entry.claimed = false;
            }
        }
    }
}

/// Exclusive right to mutate one job.
#[derive(Debug)]
pub struct JobClaim {
    registry: Arc<JobRegistry>,
    job_id: JobId,
}

impl JobClaim {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn snapshot(&self) -> Result<CrawlJob, RegistryError> {
        self.registry
            .get(self.job_id)
            .ok_or(RegistryError::NotFound(self.job_id))
    }

    pub fn state(&self) -> Result<JobState, RegistryError> {
        self.snapshot().map(|job| job.state())
    }

    /// Apply `f` to the job under the registry lock and return the updated copy.
    pub fn update<R>(
        &self,
        f: impl FnOnce(&mut CrawlJob) -> R,
    ) -> Result<(R, CrawlJob), RegistryError> {
        let mut entries = self.registry.lock()?;
        let entry = entries
            .get_mut(&self.job_id)
            .ok_or(RegistryError::NotFound(self.job_id))?;
        let out = f(&mut entry.job);
        Ok((out, entry.job.clone()))
    }
}

impl Drop for JobClaim {
    fn drop(&mut self) {
        self.registry.release(self.job_id);
    }
}

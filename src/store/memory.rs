use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::{StateStore, StoreError};
use crate::job::{Job, JobId, JobStatus, StateMachine, StatusPatch};

/// How long job records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub ttl: Duration,
    /// Push the deadline to `now + ttl` on every client read.
    pub sliding: bool,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(24),
            sliding: true,
        }
    }
}

/// Process-local state store.
pub struct MemoryStateStore {
    policy: TtlPolicy,
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl MemoryStateStore {
    pub fn new(policy: TtlPolicy) -> Self {
        Self {
            policy,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> TtlPolicy {
        self.policy
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Expired records are evicted on sight so a stale job is never served.
    fn live_entry<'a>(
        jobs: &'a mut HashMap<JobId, Job>,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<&'a mut Job, StoreError> {
        if jobs.get(&id).is_some_and(|job| job.is_expired(now)) {
            jobs.remove(&id);
            debug!(job_id = %id, "job record expired");
        }
        jobs.get_mut(&id).ok_or(StoreError::NotFound(id))
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new(TtlPolicy::default())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.lock();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut jobs = self.lock();
        let job = Self::live_entry(&mut jobs, id, now)?;
        if self.policy.sliding {
            job.expires_at = job.expires_at.max(now + self.policy.ttl);
        }
        Ok(job.clone())
    }

    async fn peek(&self, id: JobId) -> Result<Job, StoreError> {
        let mut jobs = self.lock();
        Self::live_entry(&mut jobs, id, Utc::now()).map(|job| job.clone())
    }

    async fn compare_and_set_status(
        &self,
        id: JobId,
        expected: JobStatus,
        next: JobStatus,
        patch: StatusPatch,
    ) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut jobs = self.lock();
        let job = Self::live_entry(&mut jobs, id, now)?;
        if job.status != expected {
            return Err(StoreError::Conflict {
                id,
                expected,
                actual: job.status,
            });
        }
        StateMachine::apply(job, next, patch, now)?;
        Ok(job.clone())
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, usize>, StoreError> {
        let now = Utc::now();
        let jobs = self.lock();
        let mut counts = HashMap::new();
        for job in jobs.values().filter(|job| !job.is_expired(now)) {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, job| !job.is_expired(now));
        Ok(before - jobs.len())
    }
}

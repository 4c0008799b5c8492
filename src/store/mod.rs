//! Job metadata storage and the result cache in front of it.

mod cache;
mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{InvalidTransition, Job, JobId, JobStatus, StatusPatch};

pub use cache::ResultCache;
pub use memory::{MemoryStateStore, TtlPolicy};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("status conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable record of job metadata and status.
///
/// [`StateStore::compare_and_set_status`] is the only way to mutate a job
/// once created. Records disappear only through TTL expiry.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create(&self, job: Job) -> Result<(), StoreError>;

    /// Read a job on behalf of a client. Counts as an access for the TTL
    /// policy.
    async fn get(&self, id: JobId) -> Result<Job, StoreError>;

    /// Read a job without counting as an access.
    async fn peek(&self, id: JobId) -> Result<Job, StoreError>;

    /// Move `id` from `expected` to `next`, applying `patch`.
    ///
    /// Fails with [`StoreError::Conflict`] if the current status is not
    /// `expected` and with [`StoreError::InvalidTransition`] if the lattice
    /// forbids the move. Neither failure modifies the record.
    async fn compare_and_set_status(
        &self,
        id: JobId,
        expected: JobStatus,
        next: JobStatus,
        patch: StatusPatch,
    ) -> Result<Job, StoreError>;

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, usize>, StoreError>;

    /// Drop every record whose TTL has passed at `now`. Returns how many
    /// were evicted.
    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

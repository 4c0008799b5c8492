//! Cancellation of queued and in-flight jobs.
//!
//! Queued jobs are pulled from the broker and cancelled on the spot. For a
//! job that is already processing, the coordinator only raises the job's
//! interrupt flag; the worker that owns the job acknowledges it once the
//! engine call returns (or stops early) and records `Cancelled` itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifacts::ArtifactStore;
use crate::broker::Broker;
use crate::error::ServiceError;
use crate::job::{JobId, JobStatus, StatusPatch};
use crate::store::{StateStore, StoreError};

/// Per-job interrupt flags shared between the coordinator and the workers.
#[derive(Default)]
pub struct InterruptRegistry {
    tokens: Mutex<HashMap<JobId, CancellationToken>>,
}

impl InterruptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The job's flag, created on first use by either side.
    pub fn token(&self, id: JobId) -> CancellationToken {
        self.lock().entry(id).or_insert_with(CancellationToken::new).clone()
    }

    pub fn signal(&self, id: JobId) {
        self.token(id).cancel();
    }

    pub fn is_signalled(&self, id: JobId) -> bool {
        self.lock().get(&id).is_some_and(CancellationToken::is_cancelled)
    }

    pub fn clear(&self, id: JobId) {
        self.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "status", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job had not started and is now `Cancelled`.
    Cancelled,
    /// The job is processing; its worker has been asked to stop.
    Requested,
    /// Nothing to cancel, the job already ended with this status.
    AlreadyFinished(JobStatus),
}

pub struct CancellationCoordinator {
    store: Arc<dyn StateStore>,
    broker: Arc<dyn Broker>,
    artifacts: Arc<ArtifactStore>,
    interrupts: Arc<InterruptRegistry>,
}

impl CancellationCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        broker: Arc<dyn Broker>,
        artifacts: Arc<ArtifactStore>,
        interrupts: Arc<InterruptRegistry>,
    ) -> Self {
        Self {
            store,
            broker,
            artifacts,
            interrupts,
        }
    }

    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome, ServiceError> {
        // Each retry follows a forward move of the job, so this terminates.
        loop {
            let job = self.store.peek(id).await?;
            match job.status {
                JobStatus::Queued => {
                    let removed = self.broker.remove_if_pending(id).await;
                    match self
                        .store
                        .compare_and_set_status(
                            id,
                            JobStatus::Queued,
                            JobStatus::Cancelled,
                            StatusPatch::default(),
                        )
                        .await
                    {
                        Ok(job) => {
                            if let Err(e) = self.artifacts.delete_if_exists(&job.artifact).await {
                                warn!(job_id = %id, error = %e, "artifact left for the sweeper");
                            }
                            info!(job_id = %id, removed_from_queue = removed, "queued job cancelled");
                            return Ok(CancelOutcome::Cancelled);
                        }
                        Err(StoreError::Conflict { actual, .. }) => {
                            info!(job_id = %id, status = %actual, "job moved on while cancelling");
                            continue;
                        }
                        Err(e) => {
                            if removed {
                                // Keep the job runnable rather than stranding it.
                                if let Err(requeue) = self.broker.enqueue(job.work_item()).await {
                                    warn!(job_id = %id, error = %requeue, "could not requeue job");
                                }
                            }
                            return Err(e.into());
                        }
                    }
                }
                JobStatus::Processing => {
                    self.interrupts.signal(id);
                    // The worker may have finished between the read and the signal.
                    let current = self.store.peek(id).await?;
                    if current.status.is_terminal() {
                        self.interrupts.clear(id);
                        return Ok(CancelOutcome::AlreadyFinished(current.status));
                    }
                    info!(job_id = %id, "cancellation requested for running job");
                    return Ok(CancelOutcome::Requested);
                }
                status => return Ok(CancelOutcome::AlreadyFinished(status)),
            }
        }
    }
}

//! The transcription service: wires every component together and exposes
//! the operations a request layer calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::artifacts::ArtifactStore;
use crate::broker::{Broker, MemoryBroker};
use crate::cancel::{CancelOutcome, CancellationCoordinator, InterruptRegistry};
use crate::config::WhisperqConfig;
use crate::dispatcher::{Dispatcher, Upload};
use crate::engine::{Engine, EngineHandle, Readiness};
use crate::error::ServiceError;
use crate::job::{Job, JobId, JobOptions, JobStatus, Transcript};
use crate::pool::{WorkerContext, WorkerPool};
use crate::rate_limit::Admission;
use crate::store::{MemoryStateStore, ResultCache, StateStore};
use crate::sweeper::{CleanupSweeper, SweepReport};

/// What a poller sees for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Job> for StatusView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            message: job.message(),
            submitted_at: job.submitted_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub processing: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Queued => self.queued,
            JobStatus::Processing => self.processing,
            JobStatus::Succeeded => self.succeeded,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub jobs: StatusCounts,
    pub queue_depth: usize,
    pub workers: usize,
    pub busy_workers: usize,
    pub peak_busy_workers: usize,
    /// Every executor is busy; new jobs wait in the queue.
    pub saturated: bool,
    pub submitted: u64,
    pub processed: u64,
    pub rate_limited: u64,
    pub cached_results: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub healthy: bool,
    pub engine: String,
    pub readiness: Readiness,
    pub workers: usize,
    pub busy_workers: usize,
    pub queue_depth: usize,
}

pub struct TranscriptionService {
    store: Arc<dyn StateStore>,
    broker: Arc<dyn Broker>,
    cache: Arc<ResultCache>,
    admission: Arc<Admission>,
    dispatcher: Dispatcher,
    coordinator: CancellationCoordinator,
    engine: Arc<EngineHandle>,
    pool: WorkerPool,
    sweeper: Arc<CleanupSweeper>,
    sweeper_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl TranscriptionService {
    /// Build one engine per worker with `engines`, then start the worker
    /// pool and the sweeper.
    ///
    /// Fails without starting anything if the configuration is invalid or
    /// any engine instance does not become ready within the warm-up timeout.
    pub async fn start(
        config: &WhisperqConfig,
        engines: impl Fn() -> Arc<dyn Engine>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;

        let engine = Arc::new(EngineHandle::build(config.pool.workers, engines)?);
        engine.warm_up(config.warm_up_timeout()).await?;

        let artifacts = Arc::new(ArtifactStore::open(&config.artifacts.dir).await?);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new(config.ttl_policy()));
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let interrupts = Arc::new(InterruptRegistry::new());
        let cache = Arc::new(ResultCache::new(store.clone(), config.result_cache_ttl()));
        let admission = Arc::new(Admission::new(config.submit_bucket(), config.query_bucket()));

        let dispatcher = Dispatcher::new(
            store.clone(),
            broker.clone(),
            artifacts.clone(),
            admission.clone(),
            config.upload_policy(),
            config.ttl_policy().ttl,
        );
        let coordinator = CancellationCoordinator::new(
            store.clone(),
            broker.clone(),
            artifacts.clone(),
            interrupts.clone(),
        );

        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            broker: broker.clone(),
            artifacts: artifacts.clone(),
            engine: engine.clone(),
            interrupts,
        });
        let pool = WorkerPool::start(config.pool_config(), ctx);

        let shutdown = CancellationToken::new();
        let sweeper = Arc::new(CleanupSweeper::new(
            store.clone(),
            artifacts,
            cache.clone(),
            config.sweep_policy(),
            &shutdown,
        ));
        let sweeper_task = sweeper.clone().spawn();

        info!(
            engine = engine.name(),
            workers = pool.size(),
            artifacts = %config.artifacts.dir.display(),
            "transcription service started"
        );

        Ok(Self {
            store,
            broker,
            cache,
            admission,
            dispatcher,
            coordinator,
            engine,
            pool,
            sweeper,
            sweeper_task: Mutex::new(Some(sweeper_task)),
            shutdown,
        })
    }

    /// Queue a transcription and return its id immediately.
    pub async fn submit(
        &self,
        upload: Upload,
        options: JobOptions,
        client: &str,
    ) -> Result<JobId, ServiceError> {
        let id = self.dispatcher.submit(upload, options, client).await?;
        if self.pool.is_saturated() {
            warn!(
                job_id = %id,
                queue_depth = self.broker.len(),
                workers = self.pool.size(),
                "all workers busy, job waits in queue"
            );
        }
        Ok(id)
    }

    pub async fn status(&self, id: JobId, client: &str) -> Result<StatusView, ServiceError> {
        self.admission.check_query(client)?;
        let job = self.store.get(id).await?;
        Ok(StatusView::from(&job))
    }

    /// The transcript of a succeeded job. Any other status is
    /// [`ServiceError::NotReady`].
    pub async fn result(&self, id: JobId, client: &str) -> Result<Transcript, ServiceError> {
        self.admission.check_query(client)?;
        self.cache.get(id).await
    }

    pub async fn cancel(&self, id: JobId, client: &str) -> Result<CancelOutcome, ServiceError> {
        self.admission.check_query(client)?;
        self.coordinator.cancel(id).await
    }

    /// Full job record, for operators. Not rate limited and not counted as a
    /// client access.
    pub async fn inspect(&self, id: JobId) -> Result<Job, ServiceError> {
        Ok(self.store.peek(id).await?)
    }

    /// Poll until `id` is terminal or `timeout` passes.
    pub async fn wait_for_terminal(
        &self,
        id: JobId,
        poll: Duration,
        timeout: Duration,
    ) -> Result<Job, ServiceError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.inspect(id).await?;
            if job.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(job);
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn stats(&self) -> Result<Stats, ServiceError> {
        let counts = self.store.count_by_status().await?;
        let count = |status| counts.get(&status).copied().unwrap_or(0);
        Ok(Stats {
            jobs: StatusCounts {
                queued: count(JobStatus::Queued),
                processing: count(JobStatus::Processing),
                succeeded: count(JobStatus::Succeeded),
                failed: count(JobStatus::Failed),
                cancelled: count(JobStatus::Cancelled),
            },
            queue_depth: self.broker.len(),
            workers: self.pool.size(),
            busy_workers: self.pool.busy(),
            peak_busy_workers: self.pool.peak_busy(),
            saturated: self.pool.is_saturated(),
            submitted: self.dispatcher.submitted(),
            processed: self.pool.processed(),
            rate_limited: self.admission.rejected(),
            cached_results: self.cache.len(),
        })
    }

    pub fn health(&self) -> Health {
        let readiness = self.engine.readiness();
        Health {
            healthy: readiness == Readiness::Ready,
            engine: self.engine.name().to_string(),
            readiness,
            workers: self.pool.size(),
            busy_workers: self.pool.busy(),
            queue_depth: self.broker.len(),
        }
    }

    /// Run one cleanup pass now instead of waiting for the interval.
    pub async fn sweep_now(&self) -> SweepReport {
        self.sweeper.sweep_once().await
    }

    /// Stop accepting work, let in-flight jobs finish, then release the
    /// engine. Jobs still queued stay `Queued`.
    pub async fn shutdown(&self) {
        info!(queued = self.broker.len(), "shutting down");
        self.broker.close();
        self.pool.shutdown().await;

        self.shutdown.cancel();
        let task = self
            .sweeper_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(error = %e, "sweeper ended abnormally");
        }

        self.engine.release();
        info!("transcription service stopped");
    }
}

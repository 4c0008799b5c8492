//! Bounded pool of executors draining the broker into the engine.
//!
//! Each executor takes one work item at a time, claims the job with a
//! `Queued → Processing` compare-and-set, runs the engine on a blocking
//! thread and records the terminal status. An executor never takes a new
//! item while its engine call is still running, so at most `workers` engine
//! calls are ever in flight, timed-out ones included.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifacts::ArtifactStore;
use crate::broker::Broker;
use crate::cancel::InterruptRegistry;
use crate::engine::{DecodeParams, EngineError, EngineHandle, EngineRequest};
use crate::job::{
    FailureKind, Job, JobId, JobOutcome, JobStatus, StatusPatch, Transcript, WorkItem,
};
use crate::store::{StateStore, StoreError};

/// Backoff for store writes that fail with `Unavailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 200,
        }
    }
}

impl RetryConfig {
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolConfig {
    pub workers: usize,
    /// Wall-clock limit on one engine call.
    pub hard_timeout: Duration,
    /// After this long a warning is attached to the job.
    pub soft_timeout: Option<Duration>,
    pub decode: DecodeParams,
    pub store_retry: RetryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            hard_timeout: Duration::from_secs(3600),
            soft_timeout: Some(Duration::from_secs(3300)),
            decode: DecodeParams::default(),
            store_retry: RetryConfig::default(),
        }
    }
}

/// Shared dependencies of every executor. Executor `i` runs its jobs on
/// engine slot `i`.
pub struct WorkerContext {
    pub store: Arc<dyn StateStore>,
    pub broker: Arc<dyn Broker>,
    pub artifacts: Arc<ArtifactStore>,
    pub engine: Arc<EngineHandle>,
    pub interrupts: Arc<InterruptRegistry>,
}

#[derive(Default)]
struct Gauge {
    busy: AtomicUsize,
    peak: AtomicUsize,
    processed: AtomicU64,
}

// Counts an executor as busy while alive.
struct BusyGuard<'a>(&'a Gauge);

impl<'a> BusyGuard<'a> {
    fn enter(gauge: &'a Gauge) -> (Self, usize) {
        let now = gauge.busy.fetch_add(1, Ordering::SeqCst) + 1;
        gauge.peak.fetch_max(now, Ordering::SeqCst);
        (Self(gauge), now)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.busy.fetch_sub(1, Ordering::SeqCst);
        self.0.processed.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct WorkerPool {
    config: PoolConfig,
    gauge: Arc<Gauge>,
    shutdown: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    /// Spawn `config.workers` executors draining `ctx.broker`.
    pub fn start(config: PoolConfig, ctx: Arc<WorkerContext>) -> Self {
        let gauge = Arc::new(Gauge::default());
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();

        info!(workers = config.workers, "starting worker pool");
        if ctx.engine.slots() < config.workers {
            warn!(
                workers = config.workers,
                engines = ctx.engine.slots(),
                "fewer engine instances than workers, extra workers will fail their jobs"
            );
        }
        for index in 0..config.workers {
            let executor = Executor {
                index,
                config,
                ctx: ctx.clone(),
                gauge: gauge.clone(),
            };
            tasks.spawn(executor.run(shutdown.clone()));
        }

        Self {
            config,
            gauge,
            shutdown,
            tasks: Mutex::new(Some(tasks)),
        }
    }

    pub fn size(&self) -> usize {
        self.config.workers
    }

    pub fn busy(&self) -> usize {
        self.gauge.busy.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously busy executors seen so far.
    pub fn peak_busy(&self) -> usize {
        self.gauge.peak.load(Ordering::SeqCst)
    }

    /// Jobs this pool has run to an end, whatever the outcome.
    pub fn processed(&self) -> u64 {
        self.gauge.processed.load(Ordering::Relaxed)
    }

    pub fn is_saturated(&self) -> bool {
        self.busy() >= self.config.workers
    }

    /// Stop taking new work and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut tasks) = tasks {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "executor ended abnormally");
                }
            }
        }
        info!("worker pool stopped");
    }
}

struct Executor {
    index: usize,
    config: PoolConfig,
    ctx: Arc<WorkerContext>,
    gauge: Arc<Gauge>,
}

impl Executor {
    async fn run(self, shutdown: CancellationToken) {
        debug!(worker = self.index, "executor started");
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                item = self.ctx.broker.dequeue() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            self.process(item).await;
        }
        debug!(worker = self.index, "executor stopped");
    }

    async fn process(&self, item: WorkItem) {
        let id = item.job_id;
        if !self.claim(&item).await {
            return;
        }

        let (_busy, busy) = BusyGuard::enter(&self.gauge);
        info!(job_id = %id, worker = self.index, busy, "job processing");
        if busy >= self.config.workers {
            warn!(workers = self.config.workers, "worker pool saturated");
        }

        let interrupt = self.ctx.interrupts.token(id);
        self.execute(&item, &interrupt).await;

        if let Err(e) = self.ctx.artifacts.delete_if_exists(&item.artifact).await {
            warn!(job_id = %id, error = %e, "artifact left for the sweeper");
        }
        self.ctx.interrupts.clear(id);
    }

    // Queued → Processing. False means the job is not ours to run.
    async fn claim(&self, item: &WorkItem) -> bool {
        let id = item.job_id;
        match self
            .transition(id, JobStatus::Queued, JobStatus::Processing, StatusPatch::default())
            .await
        {
            Ok(_) => true,
            Err(StoreError::Conflict { actual, .. }) => {
                debug!(job_id = %id, status = %actual, "skipping job that is no longer queued");
                false
            }
            Err(StoreError::NotFound(_)) => {
                warn!(job_id = %id, "skipping job with no record");
                false
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "could not claim job, returning it to the queue");
                if let Err(e) = self.ctx.broker.enqueue(item.clone()).await {
                    error!(job_id = %id, error = %e, "job dropped, broker refused requeue");
                }
                false
            }
        }
    }

    async fn execute(&self, item: &WorkItem, interrupt: &CancellationToken) {
        let id = item.job_id;
        let engine = match self.ctx.engine.engine(self.index) {
            Ok(engine) => engine,
            Err(e) => {
                let patch = StatusPatch::outcome(JobOutcome::Failure(FailureKind::Engine(e.to_string())));
                self.finish(id, JobStatus::Failed, patch).await;
                return;
            }
        };

        let request = EngineRequest::new(item.artifact.path().to_path_buf(), &item.options, self.config.decode);
        let token = interrupt.clone();
        let started = Instant::now();
        let mut call = tokio::task::spawn_blocking(move || engine.transcribe(&request, &token));

        let hard = tokio::time::sleep(self.config.hard_timeout);
        let soft = tokio::time::sleep(self.config.soft_timeout.unwrap_or(self.config.hard_timeout));
        tokio::pin!(hard, soft);
        let mut warned = self.config.soft_timeout.is_none();

        let returned = loop {
            tokio::select! {
                result = &mut call => break Some(result),
                _ = &mut soft, if !warned => {
                    warned = true;
                    self.mark_slow(id).await;
                }
                _ = &mut hard => break None,
            }
        };

        match returned {
            Some(result) => {
                let (status, patch) = self.settle(id, result, started.elapsed());
                self.finish(id, status, patch).await;
            }
            None => {
                let limit_secs = self.config.hard_timeout.as_secs();
                error!(job_id = %id, limit_secs, "engine call exceeded hard timeout");
                interrupt.cancel();
                let patch = StatusPatch::outcome(JobOutcome::Failure(FailureKind::Timeout { limit_secs }));
                self.finish(id, JobStatus::Failed, patch).await;

                // The slot stays taken until the blocking call really returns.
                if let Err(e) = call.await {
                    error!(job_id = %id, error = %e, "timed-out engine call panicked");
                }
                debug!(job_id = %id, "timed-out engine call drained");
            }
        }
    }

    // Terminal status for an engine call that returned.
    fn settle(
        &self,
        id: JobId,
        result: Result<Result<Transcript, EngineError>, JoinError>,
        elapsed: Duration,
    ) -> (JobStatus, StatusPatch) {
        if self.ctx.interrupts.is_signalled(id) {
            info!(job_id = %id, "cancellation acknowledged");
            return (JobStatus::Cancelled, StatusPatch::default());
        }

        match result {
            Ok(Ok(mut transcript)) => {
                transcript.processing_seconds = elapsed.as_secs_f64();
                info!(
                    job_id = %id,
                    language = %transcript.language,
                    segments = transcript.segments.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "job succeeded"
                );
                (JobStatus::Succeeded, StatusPatch::outcome(JobOutcome::Success(transcript)))
            }
            Ok(Err(e)) => {
                warn!(job_id = %id, error = %e, "engine failed");
                let kind = FailureKind::Engine(e.to_string());
                (JobStatus::Failed, StatusPatch::outcome(JobOutcome::Failure(kind)))
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "engine call panicked");
                let kind = FailureKind::Engine(format!("engine panicked: {e}"));
                (JobStatus::Failed, StatusPatch::outcome(JobOutcome::Failure(kind)))
            }
        }
    }

    async fn mark_slow(&self, id: JobId) {
        let soft = self.config.soft_timeout.unwrap_or_default().as_secs();
        let hard = self.config.hard_timeout.as_secs();
        warn!(job_id = %id, soft_secs = soft, "job passed soft timeout");
        let patch = StatusPatch::warning(format!(
            "still running after {soft}s; will be stopped at {hard}s"
        ));
        if let Err(e) = self
            .transition(id, JobStatus::Processing, JobStatus::Processing, patch)
            .await
        {
            debug!(job_id = %id, error = %e, "could not attach soft-timeout warning");
        }
    }

    async fn finish(&self, id: JobId, status: JobStatus, patch: StatusPatch) {
        match self.transition(id, JobStatus::Processing, status, patch).await {
            Ok(_) => debug!(job_id = %id, %status, "job outcome recorded"),
            Err(e) => error!(job_id = %id, %status, error = %e, "could not record job outcome"),
        }
    }

    // A compare-and-set that rides out store outages with backoff.
    async fn transition(
        &self,
        id: JobId,
        expected: JobStatus,
        next: JobStatus,
        patch: StatusPatch,
    ) -> Result<Job, StoreError> {
        let retry = self.config.store_retry;
        let mut attempt = 0;
        loop {
            match self
                .ctx
                .store
                .compare_and_set_status(id, expected, next, patch.clone())
                .await
            {
                Err(StoreError::Unavailable(msg)) if attempt < retry.max_retries => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        job_id = %id,
                        attempt,
                        max_retries = retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "store unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

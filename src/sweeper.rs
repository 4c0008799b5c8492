//! Periodic reclaimer of orphaned artifacts and expired records.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifacts::{ArtifactRef, ArtifactStore};
use crate::store::{ResultCache, StateStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    pub interval: Duration,
    /// Only files at least this old are considered.
    pub max_age: Duration,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(86_400),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    /// Old files still backing a live job.
    pub kept: usize,
    pub evicted_records: usize,
    pub purged_results: usize,
}

pub struct CleanupSweeper {
    store: Arc<dyn StateStore>,
    artifacts: Arc<ArtifactStore>,
    cache: Arc<ResultCache>,
    policy: SweepPolicy,
    cancel_token: CancellationToken,
}

impl CleanupSweeper {
    pub fn new(
        store: Arc<dyn StateStore>,
        artifacts: Arc<ArtifactStore>,
        cache: Arc<ResultCache>,
        policy: SweepPolicy,
        parent_token: &CancellationToken,
    ) -> Self {
        Self {
            store,
            artifacts,
            cache,
            policy,
            cancel_token: parent_token.child_token(),
        }
    }

    /// Spawn the periodic sweep. The first sweep runs immediately.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.policy.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(policy = ?self.policy, "cleanup sweeper started");

            loop {
                tokio::select! {
                    _ = self.cancel_token.cancelled() => break,
                    _ = interval.tick() => {
                        let report = self.sweep_once().await;
                        if report.deleted + report.evicted_records + report.purged_results > 0 {
                            info!(?report, "sweep finished");
                        } else {
                            debug!(?report, "sweep found nothing");
                        }
                    }
                }
            }

            info!("cleanup sweeper stopped");
        })
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.artifacts.scan_older_than(self.policy.max_age).await {
            Ok(stale) => {
                report.scanned = stale.len();
                for artifact in stale {
                    if self.is_live(&artifact).await {
                        report.kept += 1;
                        continue;
                    }
                    match self.artifacts.delete_if_exists(&artifact).await {
                        Ok(true) => report.deleted += 1,
                        Ok(false) => {}
                        Err(e) => warn!(path = %artifact.path().display(), error = %e, "sweep could not delete artifact"),
                    }
                }
            }
            Err(e) => error!(dir = %self.artifacts.root().display(), error = %e, "artifact scan failed"),
        }

        match self.store.evict_expired(Utc::now()).await {
            Ok(n) => report.evicted_records = n,
            Err(e) => warn!(error = %e, "record eviction failed"),
        }
        report.purged_results = self.cache.purge_expired();
        report
    }

    // Live means backed by a non-terminal, unexpired job. Unknown store state
    // counts as live.
    async fn is_live(&self, artifact: &ArtifactRef) -> bool {
        let Some(id) = artifact.job_id() else {
            return false;
        };
        match self.store.peek(id).await {
            Ok(job) => !job.status.is_terminal() && !job.is_expired(Utc::now()),
            Err(StoreError::NotFound(_)) => false,
            Err(e) => {
                warn!(job_id = %id, error = %e, "keeping artifact, job state unknown");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobId, JobOptions, JobStatus, StatusPatch};
    use crate::store::MemoryStateStore;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStateStore>,
        artifacts: Arc<ArtifactStore>,
        sweeper: CleanupSweeper,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStateStore::default());
        let artifacts = Arc::new(ArtifactStore::open(dir.path()).await.unwrap());
        let cache = Arc::new(ResultCache::new(store.clone(), Duration::from_secs(60)));
        let policy = SweepPolicy {
            interval: Duration::from_secs(3600),
            max_age: Duration::ZERO,
        };
        let sweeper = CleanupSweeper::new(
            store.clone(),
            artifacts.clone(),
            cache,
            policy,
            &CancellationToken::new(),
        );
        Fixture {
            _dir: dir,
            store,
            artifacts,
            sweeper,
        }
    }

    async fn job_with_artifact(f: &Fixture, ttl: chrono::Duration) -> Job {
        let id = JobId::new();
        let artifact = f.artifacts.put(id, "mp3", b"ID3").await.unwrap();
        let job = Job::new(id, artifact, String::new(), 3, JobOptions::default(), ttl);
        f.store.create(job.clone()).await.unwrap();
        job
    }

    #[tokio::test]
    async fn keeps_artifacts_of_live_jobs() {
        let f = fixture().await;
        let job = job_with_artifact(&f, chrono::Duration::hours(1)).await;

        let report = f.sweeper.sweep_once().await;
        assert_eq!(report.kept, 1);
        assert_eq!(report.deleted, 0);
        assert!(f.artifacts.exists(&job.artifact).await);
    }

    #[tokio::test]
    async fn deletes_artifacts_of_finished_jobs() {
        let f = fixture().await;
        let job = job_with_artifact(&f, chrono::Duration::hours(1)).await;
        f.store
            .compare_and_set_status(job.id, JobStatus::Queued, JobStatus::Cancelled, StatusPatch::default())
            .await
            .unwrap();

        let report = f.sweeper.sweep_once().await;
        assert_eq!(report.deleted, 1);
        assert!(!f.artifacts.exists(&job.artifact).await);
    }

    #[tokio::test]
    async fn deletes_orphans_and_expired_jobs() {
        let f = fixture().await;
        let orphan = f.artifacts.put(JobId::new(), "wav", b"RIFF").await.unwrap();
        let stray = ArtifactRef::new(f.artifacts.root().join("notes.txt"));
        std::fs::write(stray.path(), b"x").unwrap();
        let expired = job_with_artifact(&f, chrono::Duration::zero()).await;

        let report = f.sweeper.sweep_once().await;
        assert_eq!(report.deleted, 3);
        assert!(!f.artifacts.exists(&orphan).await);
        assert!(!f.artifacts.exists(&stray).await);
        assert!(!f.artifacts.exists(&expired.artifact).await);
        assert!(matches!(
            f.store.peek(expired.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn evicts_expired_records() {
        let f = fixture().await;
        let job = Job::new(
            JobId::new(),
            ArtifactRef::new(f.artifacts.root().join("gone.wav")),
            String::new(),
            0,
            JobOptions::default(),
            chrono::Duration::zero(),
        );
        f.store.create(job).await.unwrap();

        let report = f.sweeper.sweep_once().await;
        assert_eq!(report.evicted_records, 1);
        assert_eq!(report.scanned, 0);
    }

    #[tokio::test]
    async fn young_files_are_not_scanned() {
        let mut f = fixture().await;
        f.sweeper.policy.max_age = Duration::from_secs(3600);
        f.artifacts.put(JobId::new(), "wav", b"RIFF").await.unwrap();

        let report = f.sweeper.sweep_once().await;
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let f = fixture().await;
        f.artifacts.put(JobId::new(), "wav", b"RIFF").await.unwrap();

        assert_eq!(f.sweeper.sweep_once().await.deleted, 1);
        assert_eq!(f.sweeper.sweep_once().await.deleted, 0);
    }

    #[tokio::test]
    async fn spawned_sweeper_stops_on_shutdown() {
        let f = fixture().await;
        let orphan = f.artifacts.put(JobId::new(), "wav", b"RIFF").await.unwrap();
        let sweeper = Arc::new(f.sweeper);

        let handle = sweeper.clone().spawn();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while f.artifacts.exists(&orphan).await {
            assert!(std::time::Instant::now() < deadline, "sweep never ran");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        sweeper.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

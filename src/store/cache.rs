use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::StateStore;
use crate::error::ServiceError;
use crate::job::{JobId, JobStatus, Transcript};

struct CacheEntry {
    serialized: String,
    /// `None` when the TTL reaches past what the clock can represent.
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Read-through cache of finished transcripts.
///
/// Entries are filled lazily on the first successful fetch, never on job
/// completion, and live for their own TTL independent of the job record.
pub struct ResultCache {
    store: Arc<dyn StateStore>,
    ttl: Duration,
    entries: Mutex<HashMap<JobId, CacheEntry>>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cached(&self, id: JobId) -> Option<Transcript> {
        let now = Instant::now();
        let mut entries = self.lock();
        let entry = entries.get(&id)?;
        if entry.is_expired(now) {
            entries.remove(&id);
            return None;
        }
        match serde_json::from_str(&entry.serialized) {
            Ok(transcript) => Some(transcript),
            Err(e) => {
                warn!(job_id = %id, error = %e, "dropping undecodable cache entry");
                entries.remove(&id);
                None
            }
        }
    }

    /// Fetch the transcript of a succeeded job, via the cache when possible.
    pub async fn get(&self, id: JobId) -> Result<Transcript, ServiceError> {
        if let Some(transcript) = self.cached(id) {
            debug!(job_id = %id, "result cache hit");
            return Ok(transcript);
        }

        let job = self.store.get(id).await?;
        let transcript = match (job.status, job.result()) {
            (JobStatus::Succeeded, Some(transcript)) => transcript.clone(),
            (status, _) => return Err(ServiceError::NotReady { id, status }),
        };

        match serde_json::to_string(&transcript) {
            Ok(serialized) => {
                self.lock().insert(
                    id,
                    CacheEntry {
                        serialized,
                        expires_at: Instant::now().checked_add(self.ttl),
                    },
                );
                debug!(job_id = %id, "result cached");
            }
            Err(e) => warn!(job_id = %id, error = %e, "result not cacheable"),
        }
        Ok(transcript)
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.cached(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactRef;
    use crate::job::{Job, JobOptions, JobOutcome, Segment, StatusPatch};
    use crate::store::MemoryStateStore;

    fn transcript() -> Transcript {
        Transcript {
            text: "hello world".into(),
            segments: vec![Segment {
                start: 0.0,
                end: 1.5,
                text: "hello world".into(),
                avg_logprob: Some(-0.2),
            }],
            language: "en".into(),
            language_probability: 0.98,
            duration_seconds: 1.5,
            processing_seconds: 0.3,
        }
    }

    async fn succeeded_job(store: &MemoryStateStore) -> JobId {
        let job = Job::new(
            JobId::new(),
            ArtifactRef::new("/tmp/a.wav"),
            String::new(),
            0,
            JobOptions::default(),
            chrono::Duration::hours(24),
        );
        let id = job.id;
        store.create(job).await.unwrap();
        store
            .compare_and_set_status(id, JobStatus::Queued, JobStatus::Processing, StatusPatch::default())
            .await
            .unwrap();
        store
            .compare_and_set_status(
                id,
                JobStatus::Processing,
                JobStatus::Succeeded,
                StatusPatch::outcome(JobOutcome::Success(transcript())),
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn read_through_matches_store() {
        let store = Arc::new(MemoryStateStore::default());
        let id = succeeded_job(&store).await;
        let cache = ResultCache::new(store.clone(), Duration::from_secs(3600));

        assert!(cache.is_empty());
        let first = cache.get(id).await.unwrap();
        assert!(cache.contains(id));
        let second = cache.get(id).await.unwrap();

        let stored = store.peek(id).await.unwrap();
        assert_eq!(Some(&first), stored.result());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn pending_job_is_not_cached() {
        let store = Arc::new(MemoryStateStore::default());
        let job = Job::new(
            JobId::new(),
            ArtifactRef::new("/tmp/b.wav"),
            String::new(),
            0,
            JobOptions::default(),
            chrono::Duration::hours(24),
        );
        let id = job.id;
        store.create(job).await.unwrap();
        let cache = ResultCache::new(store, Duration::from_secs(3600));

        let err = cache.get(id).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::NotReady { status: JobStatus::Queued, .. }
        ));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let store = Arc::new(MemoryStateStore::default());
        let cache = ResultCache::new(store, Duration::from_secs(3600));
        let id = JobId::new();
        assert!(matches!(cache.get(id).await, Err(ServiceError::NotFound(got)) if got == id));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_independently_of_the_record() {
        let store = Arc::new(MemoryStateStore::default());
        let id = succeeded_job(&store).await;
        let cache = ResultCache::new(store.clone(), Duration::from_secs(60));

        cache.get(id).await.unwrap();
        assert_eq!(cache.len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(!cache.contains(id));

        // The record outlives the cache entry and refills it.
        cache.get(id).await.unwrap();
        assert!(cache.contains(id));
    }

    #[tokio::test]
    async fn unbounded_ttl_caches_without_expiry() {
        let store = Arc::new(MemoryStateStore::default());
        let id = succeeded_job(&store).await;
        let cache = ResultCache::new(store, Duration::from_secs(u64::MAX));

        assert_eq!(cache.get(id).await.unwrap(), transcript());
        assert!(cache.contains(id));
        assert_eq!(cache.purge_expired(), 0);
    }
}

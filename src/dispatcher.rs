//! Admission and validation of new transcription requests.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactRef, ArtifactStore};
use crate::broker::Broker;
use crate::error::ServiceError;
use crate::job::{Job, JobId, JobOptions, JobStatus, StatusPatch};
use crate::rate_limit::Admission;
use crate::store::StateStore;

/// An uploaded file as handed over by the request layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }

    /// Lowercased extension of `filename`, if any.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPolicy {
    pub max_bytes: u64,
    /// Lowercase, without the leading dot.
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 500 * 1024 * 1024,
            allowed_extensions: ["mp3", "wav", "m4a", "mp4", "mkv", "flac", "ogg", "webm"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl UploadPolicy {
    pub fn allows_extension(&self, ext: &str) -> bool {
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ext))
    }

    /// Every reason `upload` is unacceptable. Empty means valid.
    pub fn check(&self, upload: &Upload) -> Vec<String> {
        let mut reasons = Vec::new();
        let size = upload.bytes.len() as u64;
        if size == 0 {
            reasons.push("artifact is empty".to_string());
        } else if size > self.max_bytes {
            reasons.push(format!(
                "artifact is {size} bytes, limit is {} bytes",
                self.max_bytes
            ));
        }
        match upload.extension() {
            Some(ext) if self.allows_extension(&ext) => {}
            Some(ext) => reasons.push(format!(
                "extension `{ext}` is not allowed (allowed: {})",
                self.allowed_extensions.join(", ")
            )),
            None => reasons.push(format!("`{}` has no file extension", upload.filename)),
        }
        reasons
    }
}

pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    broker: Arc<dyn Broker>,
    artifacts: Arc<ArtifactStore>,
    admission: Arc<Admission>,
    policy: UploadPolicy,
    record_ttl: chrono::Duration,
    submitted: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        broker: Arc<dyn Broker>,
        artifacts: Arc<ArtifactStore>,
        admission: Arc<Admission>,
        policy: UploadPolicy,
        record_ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            broker,
            artifacts,
            admission,
            policy,
            record_ttl,
            submitted: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Jobs admitted since startup.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Admit `upload` as a new `Queued` job and return its id without waiting
    /// for any processing.
    ///
    /// Rate limiting is checked first and validation second; neither leaves
    /// anything behind when it rejects.
    pub async fn submit(
        &self,
        upload: Upload,
        options: JobOptions,
        client: &str,
    ) -> Result<JobId, ServiceError> {
        if let Err(e) = self.admission.check_submit(client) {
            warn!(client, "submission rate limited");
            return Err(e);
        }

        let reasons = self.policy.check(&upload);
        if !reasons.is_empty() {
            debug!(client, filename = %upload.filename, ?reasons, "submission rejected");
            return Err(ServiceError::Validation(reasons));
        }
        // check() guarantees an allowed extension
        let ext = upload.extension().unwrap_or_default();

        let id = JobId::new();
        let sha256 = format!("{:x}", Sha256::digest(&upload.bytes));
        // The record goes first: the sweeper treats a file without one as an orphan.
        let artifact = self.artifacts.locate(id, &ext);
        let job = Job::new(
            id,
            artifact.clone(),
            sha256,
            upload.bytes.len() as u64,
            options,
            self.record_ttl,
        );
        let item = job.work_item();
        self.store.create(job).await?;

        if let Err(e) = self.artifacts.write(&artifact, &upload.bytes).await {
            self.retire(id, format!("upload could not be stored: {e}")).await;
            self.discard(&artifact).await;
            return Err(e.into());
        }
        if let Err(e) = self.broker.enqueue(item).await {
            self.retire(id, format!("not accepted for processing: {e}")).await;
            self.discard(&artifact).await;
            return Err(e.into());
        }

        self.submitted.fetch_add(1, Ordering::Relaxed);
        info!(
            job_id = %id,
            client,
            filename = %upload.filename,
            bytes = upload.bytes.len(),
            queue_depth = self.broker.len(),
            "job queued"
        );
        Ok(id)
    }

    // Never runnable, so pollers must not see it sit in Queued.
    async fn retire(&self, id: JobId, reason: String) {
        if let Err(e) = self
            .store
            .compare_and_set_status(
                id,
                JobStatus::Queued,
                JobStatus::Cancelled,
                StatusPatch::warning(reason),
            )
            .await
        {
            warn!(job_id = %id, error = %e, "could not retire unqueued job");
        }
    }

    async fn discard(&self, artifact: &ArtifactRef) {
        if let Err(e) = self.artifacts.delete_if_exists(artifact).await {
            warn!(path = %artifact.path().display(), error = %e, "could not discard artifact");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::rate_limit::BucketConfig;
    use crate::store::{MemoryStateStore, StoreError};
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<MemoryStateStore>,
        broker: Arc<MemoryBroker>,
        dispatcher: Dispatcher,
    }

    async fn fixture(submit_capacity: u32, max_bytes: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStateStore::default());
        let broker = Arc::new(MemoryBroker::new());
        let artifacts = Arc::new(ArtifactStore::open(dir.path()).await.unwrap());
        let admission = Arc::new(Admission::new(
            BucketConfig {
                capacity: submit_capacity,
                refill_per_sec: 0.0,
            },
            BucketConfig {
                capacity: 100,
                refill_per_sec: 1.0,
            },
        ));
        let policy = UploadPolicy {
            max_bytes,
            ..UploadPolicy::default()
        };
        let dispatcher = Dispatcher::new(
            store.clone(),
            broker.clone(),
            artifacts,
            admission,
            policy,
            chrono::Duration::hours(24),
        );
        Fixture {
            dir,
            store,
            broker,
            dispatcher,
        }
    }

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn valid_upload_is_queued() {
        let f = fixture(10, 1024).await;
        let id = f
            .dispatcher
            .submit(Upload::new("Talk.WAV", b"RIFF".to_vec()), JobOptions::default(), "alice")
            .await
            .unwrap();

        let job = f.store.peek(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.artifact_bytes, 4);
        assert_eq!(job.artifact_sha256, format!("{:x}", Sha256::digest(b"RIFF")));
        assert_eq!(job.artifact_sha256.len(), 64);
        assert!(job.artifact.path().ends_with(format!("{id}.wav")));
        assert_eq!(f.broker.len(), 1);
        assert_eq!(f.dispatcher.submitted(), 1);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected_without_side_effects() {
        let f = fixture(10, 8).await;
        let err = f
            .dispatcher
            .submit(Upload::new("big.mp3", vec![0u8; 9]), JobOptions::default(), "alice")
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Validation(_)));
        assert!(err.to_string().contains("limit is 8 bytes"));
        assert!(f.broker.is_empty());
        assert_eq!(files_in(f.dir.path()), 0);
        assert_eq!(f.dispatcher.submitted(), 0);
    }

    #[tokio::test]
    async fn every_reason_is_reported() {
        let f = fixture(10, 8).await;
        let err = f
            .dispatcher
            .submit(Upload::new("payload.exe", Vec::new()), JobOptions::default(), "alice")
            .await
            .unwrap_err();

        match err {
            ServiceError::Validation(reasons) => {
                assert_eq!(reasons.len(), 2);
                assert_eq!(reasons[0], "artifact is empty");
                assert!(reasons[1].starts_with("extension `exe` is not allowed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_extension_is_invalid() {
        let policy = UploadPolicy::default();
        let reasons = policy.check(&Upload::new("README", b"x".to_vec()));
        assert_eq!(reasons, vec!["`README` has no file extension".to_string()]);
    }

    #[tokio::test]
    async fn rate_limit_is_checked_before_validation() {
        let f = fixture(1, 1024).await;
        f.dispatcher
            .submit(Upload::new("a.ogg", b"OggS".to_vec()), JobOptions::default(), "bob")
            .await
            .unwrap();

        // Invalid and over budget: the rate limit wins.
        let err = f
            .dispatcher
            .submit(Upload::new("b.exe", Vec::new()), JobOptions::default(), "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::RateLimited { .. }));
        assert_eq!(f.broker.len(), 1);

        // another client has its own bucket
        f.dispatcher
            .submit(Upload::new("c.flac", b"fLaC".to_vec()), JobOptions::default(), "carol")
            .await
            .unwrap();
        assert_eq!(f.broker.len(), 2);
    }

    #[tokio::test]
    async fn closed_broker_leaves_no_artifact() {
        let f = fixture(10, 1024).await;
        f.broker.close();

        let err = f
            .dispatcher
            .submit(Upload::new("a.wav", b"RIFF".to_vec()), JobOptions::default(), "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Broker(_)));
        assert_eq!(files_in(f.dir.path()), 0);
        let counts = f.store.count_by_status().await.unwrap();
        assert_eq!(counts.get(&JobStatus::Cancelled), Some(&1));
        assert_eq!(counts.get(&JobStatus::Queued), None);
    }

    // Records how many files the artifact directory held at each create.
    struct WatchingStore {
        inner: MemoryStateStore,
        dir: std::path::PathBuf,
        files_at_create: std::sync::Mutex<Vec<usize>>,
    }

    #[async_trait::async_trait]
    impl StateStore for WatchingStore {
        async fn create(&self, job: Job) -> Result<(), StoreError> {
            self.files_at_create.lock().unwrap().push(files_in(&self.dir));
            self.inner.create(job).await
        }

        async fn get(&self, id: JobId) -> Result<Job, StoreError> {
            self.inner.get(id).await
        }

        async fn peek(&self, id: JobId) -> Result<Job, StoreError> {
            self.inner.peek(id).await
        }

        async fn compare_and_set_status(
            &self,
            id: JobId,
            expected: JobStatus,
            next: JobStatus,
            patch: StatusPatch,
        ) -> Result<Job, StoreError> {
            self.inner.compare_and_set_status(id, expected, next, patch).await
        }

        async fn count_by_status(&self) -> Result<HashMap<JobStatus, usize>, StoreError> {
            self.inner.count_by_status().await
        }

        async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
            self.inner.evict_expired(now).await
        }
    }

    fn dispatcher_over(store: Arc<dyn StateStore>, artifacts: Arc<ArtifactStore>) -> Dispatcher {
        let bucket = BucketConfig {
            capacity: 10,
            refill_per_sec: 0.0,
        };
        Dispatcher::new(
            store,
            Arc::new(MemoryBroker::new()),
            artifacts,
            Arc::new(Admission::new(bucket, bucket)),
            UploadPolicy::default(),
            chrono::Duration::hours(24),
        )
    }

    #[tokio::test]
    async fn record_exists_before_artifact_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Arc::new(ArtifactStore::open(dir.path()).await.unwrap());
        let store = Arc::new(WatchingStore {
            inner: MemoryStateStore::default(),
            dir: dir.path().to_path_buf(),
            files_at_create: std::sync::Mutex::new(Vec::new()),
        });
        let dispatcher = dispatcher_over(store.clone(), artifacts.clone());

        let id = dispatcher
            .submit(Upload::new("a.wav", b"RIFF".to_vec()), JobOptions::default(), "alice")
            .await
            .unwrap();

        assert_eq!(*store.files_at_create.lock().unwrap(), vec![0]);
        let job = store.peek(id).await.unwrap();
        assert!(artifacts.exists(&job.artifact).await);
    }

    #[tokio::test]
    async fn failed_artifact_write_retires_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("uploads");
        let artifacts = Arc::new(ArtifactStore::open(&root).await.unwrap());
        std::fs::remove_dir(&root).unwrap();
        let store = Arc::new(MemoryStateStore::default());
        let dispatcher = dispatcher_over(store.clone(), artifacts);

        let err = dispatcher
            .submit(Upload::new("a.wav", b"RIFF".to_vec()), JobOptions::default(), "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Artifact(_)));
        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get(&JobStatus::Cancelled), Some(&1));
        assert_eq!(counts.get(&JobStatus::Queued), None);
        assert_eq!(dispatcher.submitted(), 0);
    }
}

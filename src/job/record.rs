use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifacts::ArtifactRef;

/// Opaque, unique identifier of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Caller-supplied transcription options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Language code (`en`, `es`, ...). Auto-detected when absent.
    #[serde(default)]
    pub language: Option<String>,
    /// Prompt used to bias the decoder towards domain vocabulary.
    #[serde(default)]
    pub initial_prompt: Option<String>,
    /// Skip non-speech regions before decoding.
    #[serde(default = "default_vad_filter")]
    pub vad_filter: bool,
}

fn default_vad_filter() -> bool {
    true
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            language: None,
            initial_prompt: None,
            vad_filter: default_vad_filter(),
        }
    }
}

/// Lifecycle status of a job.
///
/// `Queued → Processing → {Succeeded, Failed, Cancelled}`. A queued job may
/// also go straight to `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One timed span of recognised speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    /// Average log probability reported by the engine, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_logprob: Option<f64>,
}

/// A successful transcription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub segments: Vec<Segment>,
    pub language: String,
    pub language_probability: f64,
    pub duration_seconds: f64,
    /// Wall-clock time spent inside the engine call.
    #[serde(default)]
    pub processing_seconds: f64,
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureKind {
    /// The engine raised an error.
    Engine(String),
    /// The engine call exceeded the hard wall-clock limit.
    Timeout { limit_secs: u64 },
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Engine(msg) => write!(f, "engine failure: {msg}"),
            FailureKind::Timeout { limit_secs } => {
                write!(f, "timed out after {limit_secs}s")
            }
        }
    }
}

/// Terminal payload of a finished job, carried verbatim in the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Success(Transcript),
    Failure(FailureKind),
}

/// A transcription request tracked through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub options: JobOptions,
    pub artifact: ArtifactRef,
    /// Hex SHA-256 of the uploaded bytes.
    pub artifact_sha256: String,
    pub artifact_bytes: u64,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<JobOutcome>,
    /// Non-fatal notice surfaced to pollers (e.g. soft timeout passed).
    pub warning: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: JobId,
        artifact: ArtifactRef,
        artifact_sha256: String,
        artifact_bytes: u64,
        options: JobOptions,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Queued,
            options,
            artifact,
            artifact_sha256,
            artifact_bytes,
            submitted_at: now,
            started_at: None,
            finished_at: None,
            outcome: None,
            warning: None,
            expires_at: now + ttl,
        }
    }

    pub fn result(&self) -> Option<&Transcript> {
        match &self.outcome {
            Some(JobOutcome::Success(transcript)) => Some(transcript),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<String> {
        match &self.outcome {
            Some(JobOutcome::Failure(kind)) => Some(kind.to_string()),
            _ => None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Human-readable status message for pollers.
    pub fn message(&self) -> Option<String> {
        match self.status {
            JobStatus::Failed => self.error(),
            JobStatus::Cancelled => Some("cancelled by request".to_string()),
            _ => self.warning.clone(),
        }
    }

    pub fn work_item(&self) -> WorkItem {
        WorkItem {
            job_id: self.id,
            artifact: self.artifact.clone(),
            options: self.options.clone(),
        }
    }
}

/// Broker entry for a job awaiting execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub job_id: JobId,
    pub artifact: ArtifactRef,
    pub options: JobOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::new(
            JobId::new(),
            ArtifactRef::new("/tmp/a.wav"),
            "abc".into(),
            3,
            JobOptions::default(),
            Duration::hours(24),
        )
    }

    #[test]
    fn new_job_is_queued_with_ttl() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.outcome.is_none());
        assert_eq!(job.expires_at - job.submitted_at, Duration::hours(24));
        assert!(!job.is_expired(job.submitted_at));
    }

    #[test]
    fn job_id_parses_from_display() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }

    #[test]
    fn options_default_enables_vad() {
        let opts: JobOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.vad_filter);
        assert_eq!(opts, JobOptions::default());
    }

    #[test]
    fn failure_kind_display() {
        let engine = FailureKind::Engine("decoder crashed".into());
        assert_eq!(engine.to_string(), "engine failure: decoder crashed");

        let timeout = FailureKind::Timeout { limit_secs: 3600 };
        assert_eq!(timeout.to_string(), "timed out after 3600s");
    }

    #[test]
    fn outcome_accessors() {
        let mut job = sample_job();
        job.status = JobStatus::Failed;
        job.outcome = Some(JobOutcome::Failure(FailureKind::Engine("boom".into())));
        assert!(job.result().is_none());
        assert_eq!(job.error().as_deref(), Some("engine failure: boom"));
        assert_eq!(job.message().as_deref(), Some("engine failure: boom"));
    }

    #[test]
    fn work_item_mirrors_job() {
        let job = sample_job();
        let item = job.work_item();
        assert_eq!(item.job_id, job.id);
        assert_eq!(item.artifact, job.artifact);
        assert_eq!(item.options, job.options);
    }
}

use thiserror::Error;

use crate::broker::BrokerError;
use crate::engine::EngineError;
use crate::job::{JobId, JobStatus};
use crate::store::StoreError;

/// Errors returned synchronously to callers of the transcription service.
///
/// Anything that goes wrong after `submit` has returned is captured in the
/// job record instead and never surfaces here.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("rate limited for client {client}, retry after {retry_after_ms}ms")]
    RateLimited { client: String, retry_after_ms: u64 },

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {id} has no result yet, status is {status}")]
    NotReady { id: JobId, status: JobStatus },

    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("artifact storage error: {0}")]
    Artifact(#[from] std::io::Error),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("config error: {0}")]
    Config(String),
}

impl ServiceError {
    /// HTTP status a request-facing layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Validation(_) => 400,
            ServiceError::NotFound(_) | ServiceError::NotReady { .. } => 404,
            ServiceError::Conflict(_) => 409,
            ServiceError::RateLimited { .. } => 429,
            ServiceError::StoreUnavailable(_) | ServiceError::Broker(_) => 503,
            ServiceError::Artifact(_) | ServiceError::Engine(_) | ServiceError::Config(_) => 500,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            StoreError::Unavailable(msg) => ServiceError::StoreUnavailable(msg),
            other => ServiceError::Conflict(other.to_string()),
        }
    }
}

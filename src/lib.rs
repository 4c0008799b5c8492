//! whisperq: asynchronous transcription jobs on a bounded worker pool.
//!
//! Submissions are validated and admitted by the [`dispatcher`], queued in
//! the [`broker`], and executed by the [`pool`] against an opaque blocking
//! [`engine`]. Every status change goes through the compare-and-set of the
//! [`store`]; a write based on a stale status is rejected.

pub mod artifacts;
pub mod broker;
pub mod cancel;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod export;
pub mod job;
pub mod orchestrator;
pub mod pool;
pub mod rate_limit;
pub mod store;
pub mod sweeper;

pub use error::ServiceError;
pub use orchestrator::TranscriptionService;

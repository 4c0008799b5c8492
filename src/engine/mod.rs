//! The transcription engine seam.
//!
//! The engine is opaque, blocking and non-reentrant: the core hands it an
//! artifact path and options, once per job attempt, from a blocking thread
//! owned by a worker. Every worker gets its own instance, built once at
//! startup through [`EngineHandle`], whose readiness is what health checks
//! report.

mod command;
mod synthetic;

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::job::{JobOptions, Transcript};

pub use command::CommandEngine;
pub use synthetic::SyntheticEngine;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Failed(String),

    #[error("interrupted")]
    Interrupted,

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unreadable engine output: {0}")]
    Parse(String),
}

/// Everything the engine receives for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRequest {
    pub artifact: PathBuf,
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
    pub vad_filter: bool,
    pub beam_size: u32,
    pub vad_min_silence_ms: u32,
}

impl EngineRequest {
    pub fn new(artifact: PathBuf, options: &JobOptions, params: DecodeParams) -> Self {
        Self {
            artifact,
            language: options.language.clone(),
            initial_prompt: options.initial_prompt.clone(),
            vad_filter: options.vad_filter,
            beam_size: params.beam_size,
            vad_min_silence_ms: params.vad_min_silence_ms,
        }
    }
}

/// Decoder settings fixed by configuration rather than by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeParams {
    pub beam_size: u32,
    pub vad_min_silence_ms: u32,
}

impl Default for DecodeParams {
    fn default() -> Self {
        Self {
            beam_size: 5,
            vad_min_silence_ms: 500,
        }
    }
}

/// An opaque, blocking transcription engine.
///
/// An instance is never called concurrently; the pool gives each worker its
/// own. `transcribe` may poll `interrupt` and return
/// [`EngineError::Interrupted`] early; engines that cannot stop mid-call
/// simply ignore it.
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    /// Load models or check the backend. Runs once per instance, before any
    /// job.
    fn warm_up(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn transcribe(
        &self,
        request: &EngineRequest,
        interrupt: &CancellationToken,
    ) -> Result<Transcript, EngineError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum Readiness {
    Loading,
    Ready,
    Failed(String),
    Released,
}

/// One engine instance per worker slot, acquired for the lifetime of the
/// service.
pub struct EngineHandle {
    name: String,
    slots: Vec<Arc<dyn Engine>>,
    readiness: Mutex<Readiness>,
}

impl EngineHandle {
    /// Build `count` instances by calling `factory` once per slot.
    ///
    /// Fails if the factory hands out the same instance twice.
    pub fn build(
        count: usize,
        factory: impl Fn() -> Arc<dyn Engine>,
    ) -> Result<Self, EngineError> {
        let slots: Vec<Arc<dyn Engine>> = (0..count).map(|_| factory()).collect();
        for (i, engine) in slots.iter().enumerate() {
            let addr = Arc::as_ptr(engine).cast::<()>();
            if slots[..i].iter().any(|other| Arc::as_ptr(other).cast::<()>() == addr) {
                return Err(EngineError::Unavailable(
                    "engine factory returned a shared instance".into(),
                ));
            }
        }

        let name = slots
            .first()
            .map_or_else(|| "none".to_string(), |engine| engine.name().to_string());
        Ok(Self {
            name,
            slots,
            readiness: Mutex::new(Readiness::Loading),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_ready(&self) -> bool {
        self.readiness() == Readiness::Ready
    }

    fn set_readiness(&self, readiness: Readiness) {
        *self.readiness.lock().unwrap_or_else(|e| e.into_inner()) = readiness;
    }

    /// Warm every instance up on its own blocking thread. Ready only once
    /// all of them are, within `timeout` overall.
    pub async fn warm_up(&self, timeout: Duration) -> Result<(), EngineError> {
        let mut tasks = JoinSet::new();
        for engine in &self.slots {
            let engine = engine.clone();
            tasks.spawn_blocking(move || engine.warm_up());
        }

        let all_ready = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(result) => result?,
                    Err(join_err) => {
                        return Err(EngineError::Unavailable(format!(
                            "warm-up panicked: {join_err}"
                        )));
                    }
                }
            }
            Ok::<(), EngineError>(())
        };
        let result = match tokio::time::timeout(timeout, all_ready).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Unavailable(format!(
                "warm-up exceeded {}s",
                timeout.as_secs()
            ))),
        };

        match &result {
            Ok(()) => {
                info!(engine = self.name(), instances = self.slots(), "engine ready");
                self.set_readiness(Readiness::Ready);
            }
            Err(e) => {
                error!(engine = self.name(), error = %e, "engine failed to start");
                self.set_readiness(Readiness::Failed(e.to_string()));
            }
        }
        result
    }

    /// The instance owned by worker `slot`, for use from its blocking thread.
    pub fn engine(&self, slot: usize) -> Result<Arc<dyn Engine>, EngineError> {
        match self.readiness() {
            Readiness::Ready => self.slots.get(slot).cloned().ok_or_else(|| {
                EngineError::Unavailable(format!("no engine instance for worker {slot}"))
            }),
            other => Err(EngineError::Unavailable(format!("engine is {other:?}"))),
        }
    }

    pub fn release(&self) {
        self.set_readiness(Readiness::Released);
        info!(engine = self.name(), "engine released");
    }
}

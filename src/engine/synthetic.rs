use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::{Engine, EngineError, EngineRequest};
use crate::job::{Segment, Transcript};

const POLL_SLICE: Duration = Duration::from_millis(5);

/// A stand-in engine that "transcribes" by sleeping for a fixed time.
///
/// Used by the demo command and by tests that need controllable engine
/// latency, failures and interrupt behaviour.
pub struct SyntheticEngine {
    delay: Duration,
    failure: Option<String>,
    interruptible: bool,
    calls: AtomicUsize,
}

impl SyntheticEngine {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            failure: None,
            interruptible: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail every call with `message` after the delay.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Ignore interrupts until the delay has fully elapsed.
    pub fn uninterruptible(mut self) -> Self {
        self.interruptible = false;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Engine for SyntheticEngine {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn transcribe(
        &self,
        request: &EngineRequest,
        interrupt: &CancellationToken,
    ) -> Result<Transcript, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let started = Instant::now();
        while started.elapsed() < self.delay {
            if self.interruptible && interrupt.is_cancelled() {
                return Err(EngineError::Interrupted);
            }
            let remaining = self.delay.saturating_sub(started.elapsed());
            std::thread::sleep(remaining.min(POLL_SLICE));
        }

        if let Some(message) = &self.failure {
            return Err(EngineError::Failed(message.clone()));
        }

        let name = request
            .artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let text = format!("synthetic transcript of {name}");
        let duration = self.delay.as_secs_f64();

        Ok(Transcript {
            segments: vec![Segment {
                start: 0.0,
                end: duration,
                text: text.clone(),
                avg_logprob: None,
            }],
            text,
            language: request.language.clone().unwrap_or_else(|| "en".to_string()),
            language_probability: 1.0,
            duration_seconds: duration,
            processing_seconds: 0.0,
        })
    }
}

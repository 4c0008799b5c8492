//! whisperq configuration loaded from `whisperq.toml`.
//!
//! [`WhisperqConfig`] holds every tunable of the service, grouped in one
//! table per component. Missing keys fall back to defaults, so a partial
//! file (or no file at all) is valid. A few environment variables take
//! precedence over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dispatcher::UploadPolicy;
use crate::engine::DecodeParams;
use crate::error::ServiceError;
use crate::pool::{PoolConfig, RetryConfig};
use crate::rate_limit::BucketConfig;
use crate::store::TtlPolicy;
use crate::sweeper::SweepPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "whisperq.toml";

// Ten years, well inside the range chrono can add to a timestamp.
const MAX_TTL_SECS: u64 = 10 * 365 * 86_400;

// Artifacts younger than this are never swept.
const MIN_ARTIFACT_AGE_SECS: u64 = 60;

/// Top-level configuration loaded from `whisperq.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WhisperqConfig {
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub artifacts: ArtifactsSection,
    #[serde(default)]
    pub engine: EngineSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSection {
    /// Concurrent engine calls.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_hard_timeout_secs")]
    pub hard_timeout_secs: u64,

    /// Jobs running longer than this get a warning. Must be below the hard
    /// timeout.
    #[serde(default = "default_soft_timeout_secs")]
    pub soft_timeout_secs: u64,

    /// Retries for store writes that hit an outage.
    #[serde(default = "default_store_retries")]
    pub store_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_memory_url")]
    pub url: String,

    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Extend a record's life on every client read.
    #[serde(default = "default_true")]
    pub sliding_ttl: bool,

    #[serde(default = "default_result_cache_ttl_secs")]
    pub result_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSection {
    #[serde(default = "default_memory_url")]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_submit_capacity")]
    pub submit_capacity: u32,
    #[serde(default = "default_submit_refill")]
    pub submit_refill_per_sec: f64,
    #[serde(default = "default_query_capacity")]
    pub query_capacity: u32,
    #[serde(default = "default_query_refill")]
    pub query_refill_per_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactsSection {
    #[serde(default = "default_artifact_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Age after which an unreferenced artifact is reclaimed.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    /// External transcriber. Unset means the built-in synthetic engine.
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_beam_size")]
    pub beam_size: u32,

    #[serde(default = "default_vad_min_silence_ms")]
    pub vad_min_silence_ms: u32,

    #[serde(default = "default_warm_up_timeout_secs")]
    pub warm_up_timeout_secs: u64,
}

fn default_workers() -> usize {
    2
}

fn default_hard_timeout_secs() -> u64 {
    3600
}

fn default_soft_timeout_secs() -> u64 {
    3300
}

fn default_store_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_memory_url() -> String {
    "memory://".to_string()
}

fn default_ttl_secs() -> u64 {
    86_400
}

fn default_true() -> bool {
    true
}

fn default_result_cache_ttl_secs() -> u64 {
    3600
}

fn default_submit_capacity() -> u32 {
    10
}

// One submission every five seconds.
fn default_submit_refill() -> f64 {
    0.2
}

fn default_query_capacity() -> u32 {
    120
}

fn default_query_refill() -> f64 {
    2.0
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("./uploads")
}

// 500 MiB
fn default_max_bytes() -> u64 {
    500 * 1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
    UploadPolicy::default().allowed_extensions
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_max_age_secs() -> u64 {
    86_400
}

fn default_beam_size() -> u32 {
    5
}

fn default_vad_min_silence_ms() -> u32 {
    500
}

fn default_warm_up_timeout_secs() -> u64 {
    300
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            hard_timeout_secs: default_hard_timeout_secs(),
            soft_timeout_secs: default_soft_timeout_secs(),
            store_retries: default_store_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: default_memory_url(),
            ttl_secs: default_ttl_secs(),
            sliding_ttl: true,
            result_cache_ttl_secs: default_result_cache_ttl_secs(),
        }
    }
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: default_memory_url(),
        }
    }
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            submit_capacity: default_submit_capacity(),
            submit_refill_per_sec: default_submit_refill(),
            query_capacity: default_query_capacity(),
            query_refill_per_sec: default_query_refill(),
        }
    }
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        Self {
            dir: default_artifact_dir(),
            max_bytes: default_max_bytes(),
            allowed_extensions: default_allowed_extensions(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            beam_size: default_beam_size(),
            vad_min_silence_ms: default_vad_min_silence_ms(),
            warm_up_timeout_secs: default_warm_up_timeout_secs(),
        }
    }
}

impl WhisperqConfig {
    /// Load `path`, or `whisperq.toml` in the working directory when `path`
    /// is `None`. A missing default file yields the defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p, true),
            None => (Path::new(DEFAULT_CONFIG_FILE), false),
        };

        let mut config = if explicit || path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<WhisperqConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Environment variables take precedence over the file.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(workers) = lookup("WHISPERQ_WORKERS")
            && let Ok(workers) = workers.trim().parse()
        {
            self.pool.workers = workers;
        }
        if let Some(dir) = lookup("WHISPERQ_ARTIFACT_DIR")
            && !dir.is_empty()
        {
            self.artifacts.dir = PathBuf::from(dir);
        }
        if let Some(command) = lookup("WHISPERQ_ENGINE_COMMAND")
            && !command.is_empty()
        {
            self.engine.command = Some(command);
        }
    }

    /// Reject settings the service cannot run with, listing every problem.
    pub fn validate(&self) -> Result<(), ServiceError> {
        let mut problems = Vec::new();
        if self.pool.workers == 0 {
            problems.push("pool.workers must be at least 1".to_string());
        }
        if self.pool.hard_timeout_secs == 0 {
            problems.push("pool.hard_timeout_secs must be positive".to_string());
        }
        if self.pool.soft_timeout_secs >= self.pool.hard_timeout_secs {
            problems.push(format!(
                "pool.soft_timeout_secs ({}) must be below pool.hard_timeout_secs ({})",
                self.pool.soft_timeout_secs, self.pool.hard_timeout_secs
            ));
        }
        if self.store.ttl_secs == 0 {
            problems.push("store.ttl_secs must be positive".to_string());
        }
        if self.artifacts.allowed_extensions.is_empty() {
            problems.push("artifacts.allowed_extensions must not be empty".to_string());
        }
        if self.artifacts.max_bytes == 0 {
            problems.push("artifacts.max_bytes must be positive".to_string());
        }
        for (name, rate) in [
            ("limits.submit_refill_per_sec", self.limits.submit_refill_per_sec),
            ("limits.query_refill_per_sec", self.limits.query_refill_per_sec),
        ] {
            if !rate.is_finite() || rate < 0.0 {
                problems.push(format!("{name} ({rate}) must be a finite, non-negative rate"));
            }
        }
        if self.artifacts.max_age_secs < MIN_ARTIFACT_AGE_SECS {
            problems.push(format!(
                "artifacts.max_age_secs ({}) must be at least {MIN_ARTIFACT_AGE_SECS}",
                self.artifacts.max_age_secs
            ));
        }
        for (name, url) in [("store.url", &self.store.url), ("broker.url", &self.broker.url)] {
            if !url.starts_with("memory://") {
                problems.push(format!("{name} `{url}` is not supported, use memory://"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::Config(problems.join("; ")))
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.pool.workers,
            hard_timeout: Duration::from_secs(self.pool.hard_timeout_secs),
            soft_timeout: (self.pool.soft_timeout_secs > 0)
                .then(|| Duration::from_secs(self.pool.soft_timeout_secs)),
            decode: DecodeParams {
                beam_size: self.engine.beam_size,
                vad_min_silence_ms: self.engine.vad_min_silence_ms,
            },
            store_retry: RetryConfig {
                max_retries: self.pool.store_retries,
                base_delay_ms: self.pool.base_delay_ms,
            },
        }
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy {
            ttl: chrono::Duration::seconds(self.store.ttl_secs.min(MAX_TTL_SECS) as i64),
            sliding: self.store.sliding_ttl,
        }
    }

    pub fn result_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.store.result_cache_ttl_secs.min(MAX_TTL_SECS))
    }

    pub fn submit_bucket(&self) -> BucketConfig {
        BucketConfig {
            capacity: self.limits.submit_capacity,
            refill_per_sec: self.limits.submit_refill_per_sec,
        }
    }

    pub fn query_bucket(&self) -> BucketConfig {
        BucketConfig {
            capacity: self.limits.query_capacity,
            refill_per_sec: self.limits.query_refill_per_sec,
        }
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            max_bytes: self.artifacts.max_bytes,
            allowed_extensions: self
                .artifacts
                .allowed_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy {
            interval: Duration::from_secs(self.artifacts.sweep_interval_secs.max(1)),
            max_age: Duration::from_secs(self.artifacts.max_age_secs),
        }
    }

    pub fn warm_up_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.warm_up_timeout_secs)
    }
}

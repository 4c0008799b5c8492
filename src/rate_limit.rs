//! Per-client token buckets.
//!
//! Each client key owns an independent bucket that starts full and refills
//! continuously. Exhaustion is an explicit rejection carrying the time until
//! the next token; requests are never queued or silently dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::ServiceError;

// Past this many tracked keys, full buckets are dropped on the next acquire.
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Burst size, and the level a fresh bucket starts at.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, config: &BucketConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_per_sec).min(f64::from(config.capacity));
        self.last_refill = now;
    }
}

pub struct TokenBucketLimiter {
    config: BucketConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
    rejected: AtomicU64,
}

impl TokenBucketLimiter {
    pub fn new(config: BucketConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
            rejected: AtomicU64::new(0),
        }
    }

    /// Take one token from `key`'s bucket, or report how long until one is
    /// available.
    pub fn try_acquire(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        if buckets.len() >= PRUNE_THRESHOLD {
            let config = self.config;
            buckets.retain(|_, bucket| {
                bucket.refill(&config, now);
                bucket.tokens < f64::from(config.capacity)
            });
        }

        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: f64::from(self.config.capacity),
            last_refill: now,
        });
        bucket.refill(&self.config, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        self.rejected.fetch_add(1, Ordering::Relaxed);
        let missing = 1.0 - bucket.tokens;
        let retry_after = if self.config.refill_per_sec > 0.0 {
            Duration::try_from_secs_f64(missing / self.config.refill_per_sec)
                .unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        };
        debug!(client = key, ?retry_after, "token bucket exhausted");
        Err(retry_after)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Admission control with separate budgets for submissions and for
/// status/result queries.
pub struct Admission {
    submit: TokenBucketLimiter,
    query: TokenBucketLimiter,
}

impl Admission {
    pub fn new(submit: BucketConfig, query: BucketConfig) -> Self {
        Self {
            submit: TokenBucketLimiter::new(submit),
            query: TokenBucketLimiter::new(query),
        }
    }

    pub fn check_submit(&self, client: &str) -> Result<(), ServiceError> {
        self.submit
            .try_acquire(client)
            .map_err(|retry_after| rejected(client, retry_after))
    }

    pub fn check_query(&self, client: &str) -> Result<(), ServiceError> {
        self.query
            .try_acquire(client)
            .map_err(|retry_after| rejected(client, retry_after))
    }

    pub fn rejected(&self) -> u64 {
        self.submit.rejected() + self.query.rejected()
    }
}

fn rejected(client: &str, retry_after: Duration) -> ServiceError {
    ServiceError::RateLimited {
        client: client.to_string(),
        retry_after_ms: u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, refill_per_sec: f64) -> TokenBucketLimiter {
        TokenBucketLimiter::new(BucketConfig {
            capacity,
            refill_per_sec,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_reject() {
        let limiter = limiter(3, 1.0);
        for _ in 0..3 {
            assert!(limiter.try_acquire("alice").is_ok());
        }
        let retry_after = limiter.try_acquire("alice").unwrap_err();
        assert_eq!(retry_after, Duration::from_secs(1));
        assert_eq!(limiter.rejected(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn excess_over_burst_plus_refill_is_rejected() {
        // burst 5 plus 2 tokens/s over a 3s window
        let limiter = limiter(5, 2.0);
        let mut admitted = 0;
        let mut rejected = 0;
        for _ in 0..30 {
            for _ in 0..2 {
                match limiter.try_acquire("bob") {
                    Ok(()) => admitted += 1,
                    Err(_) => rejected += 1,
                }
            }
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert_eq!(admitted + rejected, 60);
        assert!(admitted <= 5 + 2 * 3, "admitted {admitted}");
        assert!(admitted >= 9, "admitted {admitted}");
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let limiter = limiter(2, 0.5);
        limiter.try_acquire("a").unwrap();
        limiter.try_acquire("a").unwrap();
        assert!(limiter.try_acquire("a").is_err());

        assert!(limiter.try_acquire("b").is_ok());
        assert!(limiter.try_acquire("b").is_ok());
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_capacity() {
        let limiter = limiter(2, 10.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.try_acquire("c").is_ok());
        assert!(limiter.try_acquire("c").is_ok());
        assert!(limiter.try_acquire("c").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_refill_never_recovers() {
        let limiter = limiter(1, 0.0);
        limiter.try_acquire("d").unwrap();
        assert_eq!(limiter.try_acquire("d").unwrap_err(), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_and_query_budgets_are_separate() {
        let admission = Admission::new(
            BucketConfig {
                capacity: 1,
                refill_per_sec: 0.1,
            },
            BucketConfig {
                capacity: 5,
                refill_per_sec: 1.0,
            },
        );
        admission.check_submit("k").unwrap();
        let err = admission.check_submit("k").unwrap_err();
        assert!(matches!(
            err,
            ServiceError::RateLimited { retry_after_ms: 10_000, .. }
        ));
        assert!(admission.check_query("k").is_ok());
        assert_eq!(admission.rejected(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn vanishing_refill_rate_saturates_retry_after() {
        let slow = limiter(0, 1e-30);
        assert_eq!(slow.try_acquire("k").unwrap_err(), Duration::MAX);

        let broken = limiter(0, f64::NAN);
        assert_eq!(broken.try_acquire("k").unwrap_err(), Duration::MAX);
        assert_eq!(broken.rejected(), 1);
    }
}

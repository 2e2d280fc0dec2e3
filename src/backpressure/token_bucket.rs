//! Two-level token bucket rate limiter
//!
//! Token consumption is a single atomic check-and-decrement under the bucket
//! lock, the in-process analog of a server-side script against the shared
//! fast-store: no read-modify-write race between the refill computation and
//! the take.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Instant;

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    capacity: f64,
    rate_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, rate_per_sec: f64) -> Self {
        Self {
            capacity,
            rate_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token. Refill and consumption happen atomically.
    pub fn try_take(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        state.last_refill = Instant::now();

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until the next token becomes available (Retry-After hint)
    pub fn next_token_secs(&self) -> f64 {
        let state = self.state.lock().unwrap();
        if state.tokens >= 1.0 || self.rate_per_sec <= 0.0 {
            0.0
        } else {
            (1.0 - state.tokens) / self.rate_per_sec
        }
    }

    pub fn available(&self) -> f64 {
        let state = self.state.lock().unwrap();
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        (state.tokens + elapsed * self.rate_per_sec).min(self.capacity)
    }
}

/// Admission decision for one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Admitted,
    DeniedGlobal,
    DeniedPartition,
}

impl RateDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, RateDecision::Admitted)
    }
}

/// Diagnostics snapshot for one partition bucket
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub partition_key: String,
    pub available: f64,
    pub burst: f64,
    pub rate_per_sec: f64,
}

pub struct RateLimiter {
    global: TokenBucket,
    partitions: DashMap<String, TokenBucket>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            global: TokenBucket::new(config.global_burst, config.global_rate_per_sec),
            partitions: DashMap::new(),
            config,
        }
    }

    /// Check the global bucket then the per-partition bucket. A denial takes
    /// no tokens from the partition bucket; the global token is consumed
    /// first by design so a hot partition still counts against the instance.
    pub fn try_admit(&self, partition_key: &str) -> RateDecision {
        if !self.global.try_take() {
            return RateDecision::DeniedGlobal;
        }
        let bucket = self.partitions.entry(partition_key.to_string()).or_insert_with(|| {
            TokenBucket::new(
                self.config.partition_burst,
                self.config.partition_rate_per_sec,
            )
        });
        if bucket.try_take() {
            RateDecision::Admitted
        } else {
            RateDecision::DeniedPartition
        }
    }

    /// Retry-After hint in whole seconds, at least 1
    pub fn retry_after_secs(&self, partition_key: &str) -> u64 {
        let partition_wait = self
            .partitions
            .get(partition_key)
            .map(|b| b.next_token_secs())
            .unwrap_or(0.0);
        partition_wait.max(self.global.next_token_secs()).ceil().max(1.0) as u64
    }

    pub fn status(&self, partition_key: &str) -> RateLimitStatus {
        let available = self
            .partitions
            .get(partition_key)
            .map(|b| b.available())
            .unwrap_or(self.config.partition_burst);
        RateLimitStatus {
            partition_key: partition_key.to_string(),
            available,
            burst: self.config.partition_burst,
            rate_per_sec: self.config.partition_rate_per_sec,
        }
    }

    pub fn global_available(&self) -> f64 {
        self.global.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_of_21_admits_exactly_20() {
        let limiter = RateLimiter::new(RateLimitConfig {
            global_rate_per_sec: 1000.0,
            global_burst: 1000.0,
            partition_rate_per_sec: 0.0,
            partition_burst: 20.0,
        });

        let admitted = (0..21)
            .filter(|_| limiter.try_admit("A_B_SEC").is_admitted())
            .count();
        assert_eq!(admitted, 20);
        assert_eq!(limiter.try_admit("A_B_SEC"), RateDecision::DeniedPartition);
    }

    #[test]
    fn test_global_bucket_denies_across_partitions() {
        let limiter = RateLimiter::new(RateLimitConfig {
            global_rate_per_sec: 0.0,
            global_burst: 3.0,
            partition_rate_per_sec: 0.0,
            partition_burst: 100.0,
        });

        for i in 0..3 {
            assert!(limiter.try_admit(&format!("P{}", i)).is_admitted());
        }
        assert_eq!(limiter.try_admit("P9"), RateDecision::DeniedGlobal);
    }

    #[test]
    fn test_partitions_have_independent_buckets() {
        let limiter = RateLimiter::new(RateLimitConfig {
            global_rate_per_sec: 1000.0,
            global_burst: 1000.0,
            partition_rate_per_sec: 0.0,
            partition_burst: 1.0,
        });

        assert!(limiter.try_admit("P1").is_admitted());
        assert_eq!(limiter.try_admit("P1"), RateDecision::DeniedPartition);
        assert!(limiter.try_admit("P2").is_admitted());
    }

    #[test]
    fn test_retry_after_is_at_least_one_second() {
        let limiter = RateLimiter::new(RateLimitConfig {
            global_rate_per_sec: 1000.0,
            global_burst: 1000.0,
            partition_rate_per_sec: 10.0,
            partition_burst: 1.0,
        });
        limiter.try_admit("P1");
        assert!(limiter.retry_after_secs("P1") >= 1);
    }

    #[test]
    fn test_refill_restores_tokens() {
        let bucket = TokenBucket::new(2.0, 1000.0);
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(bucket.try_take());
    }

    #[test]
    fn test_admissions_bounded_by_burst_plus_rate() {
        // B + R*T bound: burst 5, 100/s over ~50ms admits at most 5 + 100*0.05 + 1
        let bucket = TokenBucket::new(5.0, 100.0);
        let start = Instant::now();
        let mut admitted = 0;
        while start.elapsed() < std::time::Duration::from_millis(50) {
            if bucket.try_take() {
                admitted += 1;
            }
        }
        let elapsed = start.elapsed().as_secs_f64();
        assert!(admitted as f64 <= 5.0 + 100.0 * elapsed + 1.0);
    }
}

//! Retry supervision
//!
//! Two distinct policies live here:
//!
//! - **Deadlock-aware database retry**: a deadlock victim marks the caller's
//!   transaction rollback-only, so in-place retry cannot commit. Every write
//!   closure passed to the supervisor opens its own fresh transaction, and
//!   the supervisor re-invokes it with exponential backoff. Pipeline write
//!   steps are composed as small single-transaction operations to keep this
//!   granularity fine.
//! - **Adaptive external-call retry**: per-category attempt budgets for
//!   network errors, server 5xx, and rate limiting, each with its own
//!   exponential backoff. Client 4xx never retries.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::DeadlockRetryConfig;
use crate::error::CaptureError;

// ============================================================
// DEADLOCK-AWARE DATABASE RETRY
// ============================================================

pub struct RetrySupervisor {
    config: DeadlockRetryConfig,
}

impl RetrySupervisor {
    pub fn new(config: DeadlockRetryConfig) -> Self {
        Self { config }
    }

    /// Run a database write operation, retrying deadlock victims in a fresh
    /// transaction. Non-deadlock errors propagate immediately.
    pub async fn run_write<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T, CaptureError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CaptureError>>,
    {
        let mut delay = Duration::from_millis(self.config.initial_ms);
        let cap = Duration::from_millis(self.config.max_ms);
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op, attempt, "Write succeeded after deadlock retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_deadlock() && attempt < max_attempts => {
                    warn!(op, attempt, backoff_ms = delay.as_millis() as u64,
                        "Deadlock victim, retrying in fresh transaction");
                    tokio::time::sleep(delay).await;
                    delay = delay.mul_f64(self.config.multiplier).min(cap);
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop always returns within max_attempts")
    }
}

// ============================================================
// ADAPTIVE EXTERNAL-CALL RETRY
// ============================================================

/// Classified failure of an external call
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Connect/read failures, resets, timeouts
    Network(String),
    /// HTTP 5xx
    Server(String),
    /// HTTP 429
    RateLimited(String),
    /// HTTP 4xx other than 429; never retried
    Client(String),
    /// Circuit breaker open; never retried here
    CircuitOpen,
}

impl ExternalError {
    /// Attempt budget per category: network 5, server 3, rate-limit 5
    pub fn max_attempts(&self) -> u32 {
        match self {
            ExternalError::Network(_) => 5,
            ExternalError::Server(_) => 3,
            ExternalError::RateLimited(_) => 5,
            ExternalError::Client(_) | ExternalError::CircuitOpen => 1,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExternalError::Client(_) | ExternalError::CircuitOpen)
    }

    pub fn describe(&self) -> String {
        match self {
            ExternalError::Network(m) => format!("network error: {}", m),
            ExternalError::Server(m) => format!("server error: {}", m),
            ExternalError::RateLimited(m) => format!("rate limited: {}", m),
            ExternalError::Client(m) => format!("client error: {}", m),
            ExternalError::CircuitOpen => "circuit open".into(),
        }
    }
}

/// Invoke an external call under the adaptive policy. The first failure's
/// category fixes the attempt budget; backoff doubles from `base_delay`.
pub async fn call_adaptive<T, F, Fut>(
    op: &str,
    base_delay: Duration,
    mut f: F,
) -> Result<T, ExternalError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExternalError>>,
{
    let mut delay = base_delay;
    let mut attempt = 1u32;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !e.is_retryable() || attempt >= e.max_attempts() {
                    return Err(e);
                }
                debug!(op, attempt, category = ?e, "External call failed, backing off");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_supervisor(max_attempts: u32) -> RetrySupervisor {
        RetrySupervisor::new(DeadlockRetryConfig {
            max_attempts,
            initial_ms: 1,
            max_ms: 4,
            multiplier: 1.5,
        })
    }

    #[tokio::test]
    async fn test_deadlock_retried_until_success() {
        let supervisor = fast_supervisor(5);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = Arc::clone(&calls);

        let result = supervisor
            .run_write("insert", move || {
                let calls = Arc::clone(&calls_ref);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(CaptureError::DeadlockVictim)
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deadlock_budget_exhaustion_propagates() {
        let supervisor = fast_supervisor(3);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = Arc::clone(&calls);

        let result: Result<(), _> = supervisor
            .run_write("insert", move || {
                let calls = Arc::clone(&calls_ref);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(CaptureError::DeadlockVictim)
                }
            })
            .await;

        assert!(matches!(result, Err(CaptureError::DeadlockVictim)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_deadlock_error_propagates_immediately() {
        let supervisor = fast_supervisor(5);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = Arc::clone(&calls);

        let result: Result<(), _> = supervisor
            .run_write("insert", move || {
                let calls = Arc::clone(&calls_ref);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(CaptureError::Validation("bad".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(CaptureError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_adaptive_network_retries_five_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = Arc::clone(&calls);

        let result: Result<(), _> = call_adaptive("lookup", Duration::from_millis(1), move || {
            let calls = Arc::clone(&calls_ref);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExternalError::Network("reset".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(ExternalError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_adaptive_server_errors_capped_at_three() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = Arc::clone(&calls);

        let result: Result<(), _> = call_adaptive("lookup", Duration::from_millis(1), move || {
            let calls = Arc::clone(&calls_ref);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExternalError::Server("502".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_adaptive_client_error_never_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = Arc::clone(&calls);

        let result: Result<(), _> = call_adaptive("lookup", Duration::from_millis(1), move || {
            let calls = Arc::clone(&calls_ref);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExternalError::Client("404".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

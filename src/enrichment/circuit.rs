//! Per-dependency circuit breaker
//!
//! Closed until `failure_threshold` consecutive failures, then open for the
//! cooldown. After the cooldown one probe call is let through (half-open);
//! its outcome closes or re-opens the circuit.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    probing: bool,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            cooldown,
            inner: Mutex::new(BreakerInner {
                consecutive_failures: 0,
                open_until: None,
                probing: false,
            }),
        }
    }

    /// Ask permission to call the dependency.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                // Cooldown elapsed: admit a single half-open probe
                if inner.probing {
                    false
                } else {
                    inner.probing = true;
                    true
                }
            }
            None => true,
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.open_until.is_some() {
            info!(breaker = %self.name, "Circuit closed after successful probe");
        }
        inner.consecutive_failures = 0;
        inner.open_until = None;
        inner.probing = false;
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        inner.probing = false;
        if inner.consecutive_failures >= self.failure_threshold {
            warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit opened"
            );
            inner.open_until = Some(Instant::now() + self.cooldown);
        }
    }

    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock().unwrap();
        match inner.open_until {
            Some(until) if Instant::now() < until => BreakerState::Open,
            Some(_) => BreakerState::HalfOpen,
            None => BreakerState::Closed,
        }
    }
}

//! Partition lock service
//!
//! At-most-one in-flight processing task per partition key. Leases carry a
//! fencing token; release and renew are honored only when the token matches,
//! so a worker resuming after its lease expired cannot stomp a newer holder.
//!
//! The lock is advisory for state-mutation correctness. The position store's
//! optimistic version check is the ultimate guard; the lease exists to keep
//! contention (and deadlock pressure) off the durable store.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::PartitionLockConfig;
use crate::core_types::FencingToken;
use crate::error::CaptureError;

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: FencingToken,
    expires_at: Instant,
}

/// Handle returned by a successful acquire. Pass it back to renew/release.
#[derive(Debug)]
pub struct LockHandle {
    pub partition_key: String,
    pub token: FencingToken,
}

pub struct PartitionLockService {
    leases: DashMap<String, Lease>,
    token_gen: AtomicU64,
    config: PartitionLockConfig,
}

impl PartitionLockService {
    pub fn new(config: PartitionLockConfig) -> Self {
        Self {
            leases: DashMap::new(),
            token_gen: AtomicU64::new(1),
            config,
        }
    }

    /// Attempt to install a lease on the key.
    ///
    /// On contention, retries with exponential backoff (50ms doubling to a
    /// 500ms cap by default) until the wait timeout elapses.
    pub async fn acquire(&self, partition_key: &str) -> Result<LockHandle, CaptureError> {
        let deadline = Instant::now() + self.config.wait_timeout();
        let mut delay = Duration::from_millis(self.config.backoff_initial_ms);
        let backoff_cap = Duration::from_millis(self.config.backoff_max_ms);

        loop {
            if let Some(token) = self.try_install(partition_key) {
                debug!(partition = %partition_key, token, "Partition lock acquired");
                return Ok(LockHandle {
                    partition_key: partition_key.to_string(),
                    token,
                });
            }

            if Instant::now() + delay > deadline {
                warn!(partition = %partition_key, "Partition lock wait timed out");
                return Err(CaptureError::LockTimeout(partition_key.to_string()));
            }

            // Small jitter so contending workers do not retry in lockstep
            let jitter = Duration::from_millis(rand::random::<u64>() % 10);
            tokio::time::sleep(delay + jitter).await;
            delay = (delay * 2).min(backoff_cap);
        }
    }

    /// One install attempt. Succeeds when the slot is vacant or the previous
    /// holder's lease has expired.
    fn try_install(&self, partition_key: &str) -> Option<FencingToken> {
        use dashmap::mapref::entry::Entry;

        let now = Instant::now();
        let token = self.token_gen.fetch_add(1, Ordering::Relaxed);
        let lease = Lease {
            token,
            expires_at: now + self.config.hold_ttl(),
        };

        match self.leases.entry(partition_key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(lease);
                Some(token)
            }
            Entry::Occupied(mut slot) => {
                if slot.get().expires_at <= now {
                    warn!(
                        partition = %partition_key,
                        stale_token = slot.get().token,
                        "Expired lease reclaimed"
                    );
                    slot.insert(lease);
                    Some(token)
                } else {
                    None
                }
            }
        }
    }

    /// Extend the hold TTL. Required for operations longer than the TTL.
    pub fn renew(&self, handle: &LockHandle) -> Result<(), CaptureError> {
        let now = Instant::now();
        match self.leases.get_mut(&handle.partition_key) {
            Some(mut lease) if lease.token == handle.token => {
                lease.expires_at = now + self.config.hold_ttl();
                Ok(())
            }
            _ => Err(CaptureError::LockTimeout(handle.partition_key.clone())),
        }
    }

    /// Delete the lease only if the fencing token matches. Double-release is
    /// idempotent.
    pub fn release(&self, handle: &LockHandle) {
        self.leases
            .remove_if(&handle.partition_key, |_, lease| lease.token == handle.token);
    }

    /// Number of live leases (diagnostics)
    pub fn held(&self) -> usize {
        let now = Instant::now();
        self.leases
            .iter()
            .filter(|entry| entry.value().expires_at > now)
            .count()
    }
}

/// Scope guard releasing the lease on every exit path, including unwinding.
pub struct LockGuard<'a> {
    service: &'a PartitionLockService,
    handle: Option<LockHandle>,
}

impl<'a> LockGuard<'a> {
    pub fn new(service: &'a PartitionLockService, handle: LockHandle) -> Self {
        Self {
            service,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> &LockHandle {
        self.handle.as_ref().unwrap()
    }

    /// Release before scope end (step 15 of the pipeline wants explicit
    /// ordering against the async publish).
    pub fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            self.service.release(&handle);
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.service.release(&handle);
        }
    }
}

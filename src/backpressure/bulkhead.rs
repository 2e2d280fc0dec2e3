//! Bulkhead pools
//!
//! Partitions hash into G groups, each with its own bounded pool, so a stall
//! in one class of work cannot starve the rest. External-service calls get a
//! separate, isolated pool. When a pool and its queue are saturated the
//! submitter runs the task itself (caller-runs), which back-pressures the
//! producer instead of dropping work.

use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::BackpressureConfig;

struct Pool {
    permits: Arc<Semaphore>,
    queue_cap: usize,
    queued: AtomicUsize,
    caller_runs: AtomicU64,
}

impl Pool {
    fn new(size: usize, queue_cap: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            queue_cap,
            queued: AtomicUsize::new(0),
            caller_runs: AtomicU64::new(0),
        }
    }

    async fn run<T, Fut>(&self, fut: Fut) -> T
    where
        Fut: std::future::Future<Output = T>,
    {
        if let Ok(_permit) = self.permits.try_acquire() {
            return fut.await;
        }

        // Pool busy: queue if there is room, else caller-runs
        let queued = self.queued.fetch_add(1, Ordering::AcqRel);
        if queued < self.queue_cap {
            let permit = self.permits.acquire().await;
            self.queued.fetch_sub(1, Ordering::AcqRel);
            let _permit = permit.expect("bulkhead semaphore never closed");
            fut.await
        } else {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            self.caller_runs.fetch_add(1, Ordering::Relaxed);
            debug!("Bulkhead saturated, running on submitter");
            fut.await
        }
    }
}

pub struct Bulkhead {
    groups: Vec<Pool>,
    external: Pool,
}

impl Bulkhead {
    pub fn new(config: &BackpressureConfig) -> Self {
        let groups = (0..config.bulkhead_groups.max(1))
            .map(|_| Pool::new(config.bulkhead_pool_size, config.bulkhead_queue_size))
            .collect();
        Self {
            groups,
            external: Pool::new(config.external_pool_size, config.external_queue_size),
        }
    }

    fn group_of(&self, partition_key: &str) -> usize {
        let mut hasher = FxHasher::default();
        partition_key.hash(&mut hasher);
        (hasher.finish() as usize) % self.groups.len()
    }

    /// Run partition work on its hashed group pool.
    pub async fn run_partition<T, Fut>(&self, partition_key: &str, fut: Fut) -> T
    where
        Fut: std::future::Future<Output = T>,
    {
        self.groups[self.group_of(partition_key)].run(fut).await
    }

    /// Run an external-service call on the isolated pool.
    pub async fn run_external<T, Fut>(&self, fut: Fut) -> T
    where
        Fut: std::future::Future<Output = T>,
    {
        self.external.run(fut).await
    }

    /// Times a saturated pool pushed work back onto the submitter
    pub fn caller_runs_total(&self) -> u64 {
        self.groups
            .iter()
            .map(|p| p.caller_runs.load(Ordering::Relaxed))
            .sum::<u64>()
            + self.external.caller_runs.load(Ordering::Relaxed)
    }
}

//! Per-partition CDM position store
//!
//! Reads are cache-hinted and may be stale; every transition re-checks the
//! version inside its own fresh transaction, so the cache can never corrupt
//! state. The cache entry is invalidated on commit.

mod repository;
mod state;

pub use repository::{
    InMemoryPositionRepository, PartitionStateRecord, PgPositionRepository, PositionRepository,
};
pub use state::PositionState;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::core_types::{SeqNum, Version};
use crate::error::CaptureError;

struct CachedState {
    record: PartitionStateRecord,
    cached_at: Instant,
}

pub struct PositionStore {
    repo: Arc<dyn PositionRepository>,
    cache: DashMap<String, CachedState>,
    cache_ttl: Duration,
}

impl PositionStore {
    pub fn new(repo: Arc<dyn PositionRepository>) -> Self {
        Self {
            repo,
            cache: DashMap::new(),
            cache_ttl: Duration::from_secs(60),
        }
    }

    /// Cache-hint read; loads from the durable store on miss.
    pub async fn read(
        &self,
        partition_key: &str,
    ) -> Result<Option<PartitionStateRecord>, CaptureError> {
        if let Some(cached) = self.cache.get(partition_key) {
            if cached.cached_at.elapsed() < self.cache_ttl {
                return Ok(Some(cached.record.clone()));
            }
        }

        let record = self.repo.get(partition_key).await?;
        if let Some(ref rec) = record {
            self.cache.insert(
                partition_key.to_string(),
                CachedState {
                    record: rec.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
        Ok(record)
    }

    /// Validate against the DAG and commit under the optimistic version
    /// guard. Returns the new version.
    ///
    /// IllegalTransition is terminal; VersionConflict is transient and the
    /// caller retries its whole step against a fresh read.
    pub async fn transition(
        &self,
        partition_key: &str,
        from: Option<PositionState>,
        to: PositionState,
        state_blob: &[u8],
        expected_version: Option<Version>,
        last_sequence: Option<SeqNum>,
    ) -> Result<Version, CaptureError> {
        if !PositionState::can_transition(from, to) {
            return Err(CaptureError::IllegalTransition {
                from: from.map(|s| s.as_str().to_string()).unwrap_or_else(|| "NONE".into()),
                to: to.as_str().to_string(),
            });
        }

        let new_version = match (from, expected_version) {
            (None, _) => {
                self.repo
                    .insert_new(&PartitionStateRecord {
                        partition_key: partition_key.to_string(),
                        state: to,
                        state_blob: state_blob.to_vec(),
                        last_sequence,
                        version: 1,
                    })
                    .await?;
                1
            }
            (Some(_), Some(expected)) => {
                let updated = self
                    .repo
                    .update_if_version(partition_key, expected, to, state_blob, last_sequence)
                    .await?;
                if !updated {
                    self.invalidate(partition_key);
                    return Err(CaptureError::VersionConflict);
                }
                expected + 1
            }
            (Some(_), None) => {
                return Err(CaptureError::VersionConflict);
            }
        };

        debug!(
            partition = %partition_key,
            to = %to,
            version = new_version,
            "Position transition committed"
        );
        self.invalidate(partition_key);
        Ok(new_version)
    }

    pub fn invalidate(&self, partition_key: &str) {
        self.cache.remove(partition_key);
    }
}

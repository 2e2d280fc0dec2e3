//! Two-tier idempotency store
//!
//! Fast path is an in-process cache of terminal records; the durable
//! repository is authoritative. Only terminal (COMPLETED/FAILED) records are
//! cached, so staleness can only say "NEW" for a key that is actually
//! PROCESSING elsewhere — the unique-key claim makes that race harmless, and
//! the cache can never report COMPLETED for a key that is not durably
//! COMPLETED.

mod repository;
mod types;

pub use repository::{
    IdempotencyRepository, InMemoryIdempotencyRepository, PgIdempotencyRepository,
};
pub use types::{ClaimOutcome, IdemStatus, IdempotencyRecord, ProbeResult};

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::config::IdempotencyConfig;
use crate::error::CaptureError;

struct CachedRecord {
    record: IdempotencyRecord,
    cached_at: Instant,
}

pub struct IdempotencyService {
    repo: Arc<dyn IdempotencyRepository>,
    cache: DashMap<String, CachedRecord>,
    config: IdempotencyConfig,
}

impl IdempotencyService {
    pub fn new(repo: Arc<dyn IdempotencyRepository>, config: IdempotencyConfig) -> Self {
        Self {
            repo,
            cache: DashMap::new(),
            config,
        }
    }

    /// Probe the two-tier store for a key.
    pub async fn probe(&self, key: &str) -> Result<ProbeResult, CaptureError> {
        let now = Utc::now();

        if let Some(cached) = self.cache.get(key) {
            let fresh = cached.cached_at.elapsed() < self.config.cache_ttl();
            if fresh && !cached.record.is_expired(now) {
                debug!(key = %key, status = %cached.record.status, "Idempotency cache hit");
                return Ok(Self::to_probe(&cached.record));
            }
            drop(cached);
            self.cache.remove(key);
        }

        match self.repo.get(key).await? {
            Some(record) if !record.is_expired(now) => {
                if record.status.is_terminal() {
                    self.promote(record.clone());
                }
                Ok(Self::to_probe(&record))
            }
            _ => Ok(ProbeResult::New),
        }
    }

    /// Payload fingerprint recorded by the winning claim, if any.
    pub async fn recorded_digest(&self, key: &str) -> Result<Option<String>, CaptureError> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(Some(cached.record.payload_digest.clone()));
        }
        Ok(self.repo.get(key).await?.map(|r| r.payload_digest))
    }

    /// Insert a PROCESSING record; a collision means another worker claimed it.
    pub async fn claim(
        &self,
        key: &str,
        partition_key: &str,
        payload_digest: &str,
    ) -> Result<ClaimOutcome, CaptureError> {
        let record = IdempotencyRecord::processing(
            key,
            partition_key,
            payload_digest,
            chrono::Duration::hours(self.config.window_hours as i64),
        );
        self.repo.insert_processing(&record).await
    }

    /// Idempotent COMPLETED write in its own transaction.
    pub async fn mark_completed(&self, key: &str, result_ref: &str) -> Result<(), CaptureError> {
        self.repo
            .mark(key, IdemStatus::Completed, Some(result_ref), None)
            .await?;
        if let Some(record) = self.repo.get(key).await? {
            self.promote(record);
        }
        Ok(())
    }

    /// Idempotent FAILED write in its own transaction. A later client retry
    /// of the same key is permitted once the record is FAILED.
    pub async fn mark_failed(&self, key: &str, reason: &str) -> Result<(), CaptureError> {
        self.repo
            .mark(key, IdemStatus::Failed, None, Some(reason))
            .await?;
        if let Some(record) = self.repo.get(key).await? {
            self.promote(record);
        }
        Ok(())
    }

    /// Take back ownership of a FAILED record for a flagged client retry.
    /// The digest may legitimately differ on an amended resubmission, so it
    /// is not re-checked here.
    pub async fn reopen_failed(&self, key: &str) -> Result<(), CaptureError> {
        self.cache.remove(key);
        self.repo
            .mark(key, IdemStatus::Processing, None, None)
            .await
    }

    pub async fn purge_expired(&self) -> Result<u64, CaptureError> {
        let now = Utc::now();
        self.cache.retain(|_, c| !c.record.is_expired(now));
        self.repo.purge_expired().await
    }

    fn promote(&self, record: IdempotencyRecord) {
        if record.status.is_terminal() {
            self.cache.insert(
                record.key.clone(),
                CachedRecord {
                    record,
                    cached_at: Instant::now(),
                },
            );
        }
    }

    fn to_probe(record: &IdempotencyRecord) -> ProbeResult {
        match record.status {
            IdemStatus::Processing => ProbeResult::Processing,
            IdemStatus::Completed => ProbeResult::Completed {
                result_ref: record.result_ref.clone().unwrap_or_default(),
            },
            IdemStatus::Failed => ProbeResult::Failed {
                reason: record.failure_reason.clone(),
            },
        }
    }
}

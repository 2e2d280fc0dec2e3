//! Reference-data enrichment
//!
//! Fans out the two lookups concurrently. Each side runs through a
//! read-through TTL cache, a per-dependency circuit breaker, and the
//! adaptive retry policy. One side failing yields PARTIAL with the
//! successful side populated; both failing yields FAILED. The pipeline is
//! never blocked past the per-call timeout times the retry bound.

mod circuit;
mod source;

pub use circuit::{BreakerState, CircuitBreaker};
pub use source::{
    AccountRef, HttpReferenceDataSource, ReferenceDataSource, SecurityRef,
    StaticReferenceDataSource,
};

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::config::EnrichmentConfig;
use crate::models::EnrichmentStatus;
use crate::retry::{ExternalError, call_adaptive};

#[derive(Debug, Clone)]
pub struct EnrichmentResult {
    pub status: EnrichmentStatus,
    pub security: Option<SecurityRef>,
    pub account: Option<AccountRef>,
    pub sources: Vec<String>,
    pub failure: Option<String>,
}

struct TtlCache<T: Clone> {
    entries: DashMap<String, (T, Instant)>,
    ttl: Duration,
}

impl<T: Clone> TtlCache<T> {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn get(&self, key: &str) -> Option<T> {
        let entry = self.entries.get(key)?;
        if entry.1.elapsed() < self.ttl {
            Some(entry.0.clone())
        } else {
            drop(entry);
            self.entries.remove(key);
            None
        }
    }

    fn put(&self, key: String, value: T) {
        self.entries.insert(key, (value, Instant::now()));
    }
}

pub struct EnrichmentService {
    source: Arc<dyn ReferenceDataSource>,
    security_breaker: CircuitBreaker,
    account_breaker: CircuitBreaker,
    security_cache: TtlCache<SecurityRef>,
    account_cache: TtlCache<AccountRef>,
    retry_base: Duration,
}

impl EnrichmentService {
    pub fn new(source: Arc<dyn ReferenceDataSource>, config: &EnrichmentConfig) -> Self {
        let cooldown = Duration::from_secs(config.breaker_cooldown_secs);
        Self {
            source,
            security_breaker: CircuitBreaker::new(
                "security-refdata",
                config.breaker_failure_threshold,
                cooldown,
            ),
            account_breaker: CircuitBreaker::new(
                "account-refdata",
                config.breaker_failure_threshold,
                cooldown,
            ),
            security_cache: TtlCache::new(Duration::from_secs(config.cache_ttl_secs)),
            account_cache: TtlCache::new(Duration::from_secs(config.cache_ttl_secs)),
            retry_base: Duration::from_millis(200),
        }
    }

    /// Test constructor with a tight retry backoff
    pub fn for_tests(source: Arc<dyn ReferenceDataSource>) -> Self {
        let mut svc = Self::new(source, &EnrichmentConfig::default());
        svc.retry_base = Duration::from_millis(1);
        svc
    }

    pub async fn enrich(
        &self,
        security_id: &str,
        account_id: &str,
        book_id: &str,
    ) -> EnrichmentResult {
        let (security, account) = tokio::join!(
            self.lookup_security(security_id),
            self.lookup_account(account_id, book_id)
        );

        let mut failure = None;
        let status = match (&security, &account) {
            (Ok(_), Ok(_)) => EnrichmentStatus::Complete,
            (Err(e), Err(e2)) => {
                failure = Some(format!("{}; {}", e.describe(), e2.describe()));
                EnrichmentStatus::Failed
            }
            (Err(e), _) | (_, Err(e)) => {
                failure = Some(e.describe());
                EnrichmentStatus::Partial
            }
        };

        if status != EnrichmentStatus::Complete {
            warn!(
                security_id,
                account_id,
                status = status.as_str(),
                failure = failure.as_deref().unwrap_or("-"),
                "Enrichment degraded"
            );
        }

        EnrichmentResult {
            status,
            security: security.ok(),
            account: account.ok(),
            sources: vec![self.source.name().to_string()],
            failure,
        }
    }

    async fn lookup_security(&self, security_id: &str) -> Result<SecurityRef, ExternalError> {
        if let Some(hit) = self.security_cache.get(security_id) {
            return Ok(hit);
        }
        if !self.security_breaker.allow() {
            return Err(ExternalError::CircuitOpen);
        }

        let result = call_adaptive("security-by-id", self.retry_base, || {
            self.source.security_by_id(security_id)
        })
        .await;

        match &result {
            Ok(sec) => {
                self.security_breaker.on_success();
                self.security_cache.put(security_id.to_string(), sec.clone());
            }
            Err(_) => self.security_breaker.on_failure(),
        }
        result
    }

    async fn lookup_account(
        &self,
        account_id: &str,
        book_id: &str,
    ) -> Result<AccountRef, ExternalError> {
        let cache_key = format!("{}_{}", account_id, book_id);
        if let Some(hit) = self.account_cache.get(&cache_key) {
            return Ok(hit);
        }
        if !self.account_breaker.allow() {
            return Err(ExternalError::CircuitOpen);
        }

        let result = call_adaptive("account-by-ids", self.retry_base, || {
            self.source.account_by_ids(account_id, book_id)
        })
        .await;

        match &result {
            Ok(acc) => {
                self.account_breaker.on_success();
                self.account_cache.put(cache_key, acc.clone());
            }
            Err(_) => self.account_breaker.on_failure(),
        }
        result
    }

    pub fn breaker_states(&self) -> (BreakerState, BreakerState) {
        (self.security_breaker.state(), self.account_breaker.state())
    }
}

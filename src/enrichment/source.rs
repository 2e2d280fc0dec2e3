//! Reference-data sources
//!
//! Two lookups back the enricher: security-by-id and account-by-ids. The
//! HTTP source talks to the reference-data services with bounded timeouts;
//! the static source backs tests and standalone runs.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::EnrichmentConfig;
use crate::retry::ExternalError;

/// Security master record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityRef {
    pub security_id: String,
    #[serde(default)]
    pub isin: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Product taxonomy, e.g. "EquitySwap:PriceReturnBasicPerformance"
    #[serde(default)]
    pub taxonomy: Option<String>,
}

/// Account/book reference record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRef {
    pub account_id: String,
    pub book_id: String,
    pub account_open: bool,
    pub credit_approved: bool,
}

#[async_trait]
pub trait ReferenceDataSource: Send + Sync {
    fn name(&self) -> &str;

    async fn security_by_id(&self, security_id: &str) -> Result<SecurityRef, ExternalError>;

    async fn account_by_ids(
        &self,
        account_id: &str,
        book_id: &str,
    ) -> Result<AccountRef, ExternalError>;
}

// ============================================================
// HTTP SOURCE
// ============================================================

pub struct HttpReferenceDataSource {
    client: reqwest::Client,
    security_base_url: String,
    account_base_url: String,
}

impl HttpReferenceDataSource {
    pub fn new(config: &EnrichmentConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.read_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            security_base_url: config.security_base_url.clone(),
            account_base_url: config.account_base_url.clone(),
        })
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, ExternalError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ExternalError::Network(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ExternalError::RateLimited(format!("429 from {}", url)));
        }
        if status.is_server_error() {
            return Err(ExternalError::Server(format!("{} from {}", status, url)));
        }
        if !status.is_success() {
            return Err(ExternalError::Client(format!("{} from {}", status, url)));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ExternalError::Network(e.to_string()))
    }
}

#[async_trait]
impl ReferenceDataSource for HttpReferenceDataSource {
    fn name(&self) -> &str {
        "refdata-http"
    }

    async fn security_by_id(&self, security_id: &str) -> Result<SecurityRef, ExternalError> {
        let url = format!("{}/{}", self.security_base_url, security_id);
        self.fetch(&url).await
    }

    async fn account_by_ids(
        &self,
        account_id: &str,
        book_id: &str,
    ) -> Result<AccountRef, ExternalError> {
        let url = format!("{}/{}/{}", self.account_base_url, account_id, book_id);
        self.fetch(&url).await
    }
}

// ============================================================
// STATIC SOURCE (tests + standalone runs)
// ============================================================

/// In-memory source with optional failure injection per lookup side.
#[derive(Default)]
pub struct StaticReferenceDataSource {
    securities: DashMap<String, SecurityRef>,
    accounts: DashMap<String, AccountRef>,
    security_failures: AtomicU32,
    account_failures: AtomicU32,
}

impl StaticReferenceDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_security(self, security: SecurityRef) -> Self {
        self.securities.insert(security.security_id.clone(), security);
        self
    }

    pub fn with_account(self, account: AccountRef) -> Self {
        self.accounts
            .insert(format!("{}_{}", account.account_id, account.book_id), account);
        self
    }

    /// Auto-derive sensible records for any id (happy-path harnesses)
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Fail the next `n` security lookups with a network error
    pub fn fail_security_lookups(&self, n: u32) {
        self.security_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` account lookups with a network error
    pub fn fail_account_lookups(&self, n: u32) {
        self.account_failures.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ReferenceDataSource for StaticReferenceDataSource {
    fn name(&self) -> &str {
        "refdata-static"
    }

    async fn security_by_id(&self, security_id: &str) -> Result<SecurityRef, ExternalError> {
        if Self::take_failure(&self.security_failures) {
            return Err(ExternalError::Network("injected security failure".into()));
        }
        if let Some(sec) = self.securities.get(security_id) {
            return Ok(sec.clone());
        }
        Ok(SecurityRef {
            security_id: security_id.to_string(),
            isin: (security_id.len() == 12).then(|| security_id.to_string()),
            description: None,
            taxonomy: Some("EquitySwap:PriceReturnBasicPerformance".into()),
        })
    }

    async fn account_by_ids(
        &self,
        account_id: &str,
        book_id: &str,
    ) -> Result<AccountRef, ExternalError> {
        if Self::take_failure(&self.account_failures) {
            return Err(ExternalError::Network("injected account failure".into()));
        }
        if let Some(acc) = self.accounts.get(&format!("{}_{}", account_id, book_id)) {
            return Ok(acc.clone());
        }
        Ok(AccountRef {
            account_id: account_id.to_string(),
            book_id: book_id.to_string(),
            account_open: true,
            credit_approved: true,
        })
    }
}

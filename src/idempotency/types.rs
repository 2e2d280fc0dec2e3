//! Idempotency record model
//!
//! Status ids are designed for SMALLINT storage. Status progresses
//! monotonically: PROCESSING -> {COMPLETED, FAILED}.

use chrono::{DateTime, Utc};
use std::fmt;

/// Idempotency record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum IdemStatus {
    Processing = 0,
    Completed = 10,
    Failed = -10,
}

impl IdemStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, IdemStatus::Completed | IdemStatus::Failed)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(IdemStatus::Processing),
            10 => Some(IdemStatus::Completed),
            -10 => Some(IdemStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IdemStatus::Processing => "PROCESSING",
            IdemStatus::Completed => "COMPLETED",
            IdemStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for IdemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable idempotency record
///
/// Exactly one record per key within the TTL window; the unique constraint
/// on `key` is what serializes racing claims.
#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub key: String,
    pub partition_key: String,
    pub status: IdemStatus,
    /// SwapBlotter reference once COMPLETED
    pub result_ref: Option<String>,
    /// Failure reason once FAILED
    pub failure_reason: Option<String>,
    /// Content fingerprint of the claiming payload
    pub payload_digest: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn processing(
        key: &str,
        partition_key: &str,
        payload_digest: &str,
        window: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            partition_key: partition_key.to_string(),
            status: IdemStatus::Processing,
            result_ref: None,
            failure_reason: None,
            payload_digest: payload_digest.to_string(),
            created_at: now,
            updated_at: now,
            expires_at: now + window,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of a probe against the two-tier store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// No live record for the key
    New,
    /// Another worker holds the claim
    Processing,
    /// Memoized result available
    Completed { result_ref: String },
    /// Prior attempt failed within the window
    Failed { reason: Option<String> },
}

/// Result of a claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyExists,
}

//! Engine error types
//!
//! One error enum for the capture path. Wire codes match the downstream
//! contract so gateway responses and DLQ envelopes stay consistent.

use thiserror::Error;

/// Capture pipeline error kinds
///
/// `code()` is the stable wire identifier; `http_status()` is the gateway
/// mapping; `is_retryable()` drives local retry policy.
#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    // === Validation ===
    #[error("Validation failed: {0}")]
    Validation(String),

    // === Enrichment ===
    #[error("Enrichment failed: {0}")]
    EnrichmentFailed(String),

    // === Position state ===
    #[error("Illegal position transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Position state version conflict")]
    VersionConflict,

    // === Rules ===
    #[error("Rule evaluation failed: {0}")]
    RulesEval(String),

    // === Database / transactions ===
    #[error("Transaction chosen as deadlock victim")]
    DeadlockVictim,

    #[error("Database error: {0}")]
    Database(String),

    // === Idempotency ===
    #[error("Duplicate trade id: {0}")]
    DuplicateTradeId(String),

    #[error("Duplicate trade id with different payload: {0}")]
    DuplicateDifferentPayload(String),

    // === Admission / locking ===
    #[error("Rate limit exceeded for partition {0}")]
    RateLimitExceeded(String),

    #[error("Partition lock acquisition timed out: {0}")]
    LockTimeout(String),

    #[error("Lock backend unavailable")]
    LockBackendUnavailable,

    // === Sequence gate ===
    #[error("Buffered pending earlier sequence")]
    BufferedPendingSequence,

    #[error("Sequence gap larger than buffer window")]
    GapTooLarge,

    #[error("Buffered sequence timed out")]
    SequenceTimeout,

    #[error("Sequence at or below last delivered")]
    OutOfOrderTooOld,

    // === External dependencies ===
    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Publish failure: {0}")]
    PublishFailure(String),

    // === Async jobs ===
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job is not cancellable in state {0}")]
    JobNotCancellable(String),
}

impl CaptureError {
    /// Stable wire code for API responses and DLQ envelopes
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::Validation(_) => "VALIDATION_ERROR",
            CaptureError::EnrichmentFailed(_) => "ENRICHMENT_ERROR",
            CaptureError::IllegalTransition { .. } => "STATE_ILLEGAL_TRANSITION",
            CaptureError::VersionConflict => "STATE_VERSION_CONFLICT",
            CaptureError::RulesEval(_) => "RULES_EVAL_ERROR",
            CaptureError::DeadlockVictim => "DEADLOCK_VICTIM",
            CaptureError::Database(_) => "DATABASE_ERROR",
            CaptureError::DuplicateTradeId(_) => "DUPLICATE_TRADE_ID",
            CaptureError::DuplicateDifferentPayload(_) => "DUPLICATE_DIFFERENT_PAYLOAD",
            CaptureError::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            CaptureError::LockTimeout(_) => "LOCK_TIMEOUT",
            CaptureError::LockBackendUnavailable => "DEPENDENCY_UNAVAILABLE",
            CaptureError::BufferedPendingSequence => "BUFFERED_PENDING_SEQUENCE",
            CaptureError::GapTooLarge => "GAP_TOO_LARGE",
            CaptureError::SequenceTimeout => "SEQUENCE_TIMEOUT",
            CaptureError::OutOfOrderTooOld => "OUT_OF_ORDER_TOO_OLD",
            CaptureError::DependencyUnavailable(_) => "DEPENDENCY_UNAVAILABLE",
            CaptureError::Serialization(_) => "SERIALIZATION_ERROR",
            CaptureError::PublishFailure(_) => "PUBLISH_FAILURE",
            CaptureError::JobNotFound(_) => "JOB_NOT_FOUND",
            CaptureError::JobNotCancellable(_) => "JOB_NOT_CANCELLABLE",
        }
    }

    /// HTTP status code suggestion for the gateway
    pub fn http_status(&self) -> u16 {
        match self {
            CaptureError::Validation(_) | CaptureError::RulesEval(_) => 400,
            CaptureError::DuplicateTradeId(_) | CaptureError::DuplicateDifferentPayload(_) => 409,
            CaptureError::JobNotFound(_) => 404,
            CaptureError::JobNotCancellable(_) => 409,
            CaptureError::RateLimitExceeded(_) => 429,
            CaptureError::LockTimeout(_)
            | CaptureError::LockBackendUnavailable
            | CaptureError::DependencyUnavailable(_) => 503,
            CaptureError::IllegalTransition { .. }
            | CaptureError::GapTooLarge
            | CaptureError::SequenceTimeout
            | CaptureError::OutOfOrderTooOld => 422,
            CaptureError::BufferedPendingSequence => 202,
            CaptureError::VersionConflict
            | CaptureError::DeadlockVictim
            | CaptureError::Database(_)
            | CaptureError::EnrichmentFailed(_)
            | CaptureError::Serialization(_)
            | CaptureError::PublishFailure(_) => 500,
        }
    }

    /// Retryable kinds are retried locally up to configured bounds;
    /// after exhaustion they become terminal FAILED with the cause chained.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureError::DeadlockVictim
                | CaptureError::VersionConflict
                | CaptureError::LockTimeout(_)
                | CaptureError::LockBackendUnavailable
                | CaptureError::DependencyUnavailable(_)
        )
    }

    /// True for the deadlock-victim signal (drives fresh-transaction retry)
    pub fn is_deadlock(&self) -> bool {
        matches!(self, CaptureError::DeadlockVictim)
    }
}

impl From<sqlx::Error> for CaptureError {
    fn from(e: sqlx::Error) -> Self {
        // Dialect deadlock-victim signals: 40P01 (deadlock detected) and
        // 40001 (serialization failure). Both mark the transaction
        // rollback-only; only a fresh transaction can recover.
        if let sqlx::Error::Database(db) = &e {
            if let Some(code) = db.code() {
                if code == "40P01" || code == "40001" {
                    return CaptureError::DeadlockVictim;
                }
            }
        }
        CaptureError::Database(e.to_string())
    }
}

impl From<anyhow::Error> for CaptureError {
    fn from(e: anyhow::Error) -> Self {
        CaptureError::Database(e.to_string())
    }
}

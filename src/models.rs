//! Domain model: capture requests, trade lots, and the SwapBlotter
//!
//! `TradeCaptureRequest` is the immutable input; `SwapBlotter` is the
//! canonical, fully-enriched downstream contract record. Both serialize with
//! serde so the same types ride the bus (bincode frames) and the REST
//! surface (JSON).

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::core_types::SeqNum;

// ============================================================
// INPUT SIDE
// ============================================================

/// Origin of a trade lot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSource {
    Automated,
    Manual,
}

impl TradeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSource::Automated => "AUTOMATED",
            TradeSource::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for TradeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One lot within a capture request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLot {
    #[serde(default)]
    pub lot_id: Option<String>,
    pub qty: Decimal,
    pub price: Decimal,
    /// Lot-level sequence within the payload (must be monotone when present)
    #[serde(default)]
    pub sequence: Option<SeqNum>,
}

/// Manual-entry provenance attached by the upstream capture UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualEntry {
    pub user: String,
    pub timestamp: DateTime<Utc>,
}

/// Immutable trade-capture input
///
/// `booking_timestamp` is the authoritative ordering time assigned upstream;
/// `sequence_number` is the authoritative per-partition sequence. The engine
/// never synthesizes sequence numbers from timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeCaptureRequest {
    pub trade_id: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub account_id: String,
    pub book_id: String,
    pub security_id: String,
    pub source: TradeSource,
    pub trade_date: NaiveDate,
    pub booking_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sequence_number: Option<SeqNum>,
    pub trade_lots: Vec<TradeLot>,
    pub counterparty_ids: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub manual_entry: Option<ManualEntry>,
}

impl TradeCaptureRequest {
    /// Sharding unit preserving per-instrument ordering.
    ///
    /// Stable across retries of the same trade id.
    pub fn partition_key(&self) -> String {
        format!("{}_{}_{}", self.account_id, self.book_id, self.security_id)
    }

    /// Deduplication key: explicit idempotency key when present, else trade id
    pub fn dedup_key(&self) -> &str {
        self.idempotency_key.as_deref().unwrap_or(&self.trade_id)
    }

    /// Content fingerprint used to tell a retry apart from a different
    /// payload reusing the same trade id.
    pub fn payload_digest(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", md5::compute(canonical))
    }
}

// ============================================================
// OUTPUT SIDE
// ============================================================

/// Reference-data completeness of the blotter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrichmentStatus {
    Complete,
    Partial,
    Failed,
    Pending,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Complete => "COMPLETE",
            EnrichmentStatus::Partial => "PARTIAL",
            EnrichmentStatus::Failed => "FAILED",
            EnrichmentStatus::Pending => "PENDING",
        }
    }
}

/// Workflow decision carried on the blotter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Approved,
    PendingApproval,
    Rejected,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Approved => "APPROVED",
            WorkflowStatus::PendingApproval => "PENDING_APPROVAL",
            WorkflowStatus::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payout legs on the contract's economic terms
///
/// Externally tagged so the same shape serializes through both JSON and the
/// binary bus frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payout {
    Performance(PerformancePayout),
    Interest(InterestPayout),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformancePayout {
    pub underlier: String,
    pub quantity: Decimal,
    pub initial_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterestPayout {
    pub notional: Decimal,
    pub rate_index: String,
    pub spread_bps: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EconomicTerms {
    pub effective_date: NaiveDate,
    #[serde(default)]
    pub termination_date: Option<NaiveDate>,
    pub payouts: Vec<Payout>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub identifiers: Vec<String>,
    #[serde(default)]
    pub taxonomy: Option<String>,
    pub economic_terms: EconomicTerms,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetadata {
    pub processed_at: DateTime<Utc>,
    pub elapsed_millis: u64,
    /// Rule ids in application order
    pub rules_applied: Vec<String>,
    pub enrichment_sources: Vec<String>,
}

/// The canonical downstream contract record.
///
/// Written once, never mutated. `workflow_status == APPROVED` implies the
/// position transition was committed; `REJECTED` implies no state write and
/// the idempotency record in FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapBlotter {
    pub trade_id: String,
    pub partition_key: String,
    pub trade_lots: Vec<TradeLot>,
    pub contract: Contract,
    /// CDM position state name after the committed transition
    pub state: String,
    pub enrichment_status: EnrichmentStatus,
    pub workflow_status: WorkflowStatus,
    pub processing_metadata: ProcessingMetadata,
}

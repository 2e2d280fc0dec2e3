//! Approval service seam
//!
//! The approval workflow lives outside the engine; the pipeline only needs a
//! decision for blotters a workflow rule parked in PENDING_APPROVAL.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::models::{SwapBlotter, TradeCaptureRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected(String),
    /// Still awaiting a human; the pipeline parks the request
    Pending,
}

#[async_trait]
pub trait ApprovalService: Send + Sync {
    async fn decide(
        &self,
        request: &TradeCaptureRequest,
        blotter: &SwapBlotter,
    ) -> ApprovalDecision;
}

/// Default provider: nothing to ask, everything flows.
pub struct AutoApprovalService;

#[async_trait]
impl ApprovalService for AutoApprovalService {
    async fn decide(&self, _: &TradeCaptureRequest, _: &SwapBlotter) -> ApprovalDecision {
        ApprovalDecision::Approved
    }
}

/// Scriptable provider for tests: per-trade decisions with a default.
#[derive(Default)]
pub struct StaticApprovalService {
    decisions: DashMap<String, ApprovalDecision>,
}

impl StaticApprovalService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, trade_id: &str, decision: ApprovalDecision) {
        self.decisions.insert(trade_id.to_string(), decision);
    }
}

#[async_trait]
impl ApprovalService for StaticApprovalService {
    async fn decide(
        &self,
        request: &TradeCaptureRequest,
        _: &SwapBlotter,
    ) -> ApprovalDecision {
        self.decisions
            .get(&request.trade_id)
            .map(|d| d.clone())
            .unwrap_or(ApprovalDecision::Pending)
    }
}

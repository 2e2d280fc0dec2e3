//! Working blotter assembly
//!
//! The working SwapBlotter is a single owned value threaded through rule
//! application; rules get a read-view of the request and a write-view of
//! this value.

use chrono::Utc;

use crate::enrichment::EnrichmentResult;
use crate::models::{
    Contract, EconomicTerms, Payout, PerformancePayout, ProcessingMetadata, SwapBlotter,
    TradeCaptureRequest, WorkflowStatus,
};
use crate::position::PositionState;

/// Build the initial blotter from the request and the enrichment result.
/// Workflow status starts APPROVED; workflow rules may park it.
pub fn build_working_blotter(
    request: &TradeCaptureRequest,
    enrichment: &EnrichmentResult,
) -> SwapBlotter {
    let mut identifiers = vec![request.trade_id.clone()];
    if let Some(isin) = enrichment.security.as_ref().and_then(|s| s.isin.clone()) {
        if !identifiers.contains(&isin) {
            identifiers.push(isin);
        }
    }

    let payouts = request
        .trade_lots
        .iter()
        .map(|lot| {
            Payout::Performance(PerformancePayout {
                underlier: request.security_id.clone(),
                quantity: lot.qty,
                initial_price: lot.price,
            })
        })
        .collect();

    SwapBlotter {
        trade_id: request.trade_id.clone(),
        partition_key: request.partition_key(),
        trade_lots: request.trade_lots.clone(),
        contract: Contract {
            identifiers,
            taxonomy: enrichment.security.as_ref().and_then(|s| s.taxonomy.clone()),
            economic_terms: EconomicTerms {
                effective_date: request.trade_date,
                termination_date: None,
                payouts,
            },
        },
        state: PositionState::Executed.as_str().to_string(),
        enrichment_status: enrichment.status,
        workflow_status: WorkflowStatus::Approved,
        processing_metadata: ProcessingMetadata {
            processed_at: Utc::now(),
            elapsed_millis: 0,
            rules_applied: Vec::new(),
            enrichment_sources: enrichment.sources.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::SecurityRef;
    use crate::models::{EnrichmentStatus, TradeLot, TradeSource};
    use rust_decimal::Decimal;
    use std::collections::{BTreeMap, BTreeSet};

    #[test]
    fn test_blotter_carries_lots_isin_and_taxonomy() {
        let request = TradeCaptureRequest {
            trade_id: "T-1".into(),
            idempotency_key: None,
            account_id: "A".into(),
            book_id: "B".into(),
            security_id: "US0378331005".into(),
            source: TradeSource::Automated,
            trade_date: chrono::NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            booking_timestamp: Utc::now(),
            sequence_number: Some(1),
            trade_lots: vec![TradeLot {
                lot_id: None,
                qty: Decimal::from(100),
                price: Decimal::from(150),
                sequence: None,
            }],
            counterparty_ids: BTreeSet::from(["CP1".to_string()]),
            metadata: BTreeMap::new(),
            manual_entry: None,
        };
        let enrichment = EnrichmentResult {
            status: EnrichmentStatus::Complete,
            security: Some(SecurityRef {
                security_id: "US0378331005".into(),
                isin: Some("US0378331005".into()),
                description: None,
                taxonomy: Some("EquitySwap".into()),
            }),
            account: None,
            sources: vec!["refdata-static".into()],
            failure: None,
        };

        let blotter = build_working_blotter(&request, &enrichment);
        assert_eq!(blotter.partition_key, "A_B_US0378331005");
        assert_eq!(blotter.contract.identifiers, vec!["T-1", "US0378331005"]);
        assert_eq!(blotter.contract.taxonomy.as_deref(), Some("EquitySwap"));
        assert_eq!(blotter.contract.economic_terms.payouts.len(), 1);
        assert_eq!(blotter.workflow_status, WorkflowStatus::Approved);
        assert_eq!(blotter.processing_metadata.enrichment_sources, vec!["refdata-static"]);
    }
}

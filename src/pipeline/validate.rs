//! Capture validation
//!
//! Checked after enrichment and rules, before any state write. Failures are
//! terminal: the idempotency record goes FAILED and the client may resubmit.

use chrono::Utc;

use crate::enrichment::EnrichmentResult;
use crate::error::CaptureError;
use crate::models::TradeCaptureRequest;

/// 12 characters, two leading letters, alphanumeric body, numeric check
/// digit.
pub fn is_plausible_isin(candidate: &str) -> bool {
    let bytes = candidate.as_bytes();
    bytes.len() == 12
        && bytes[..2].iter().all(u8::is_ascii_uppercase)
        && bytes[2..11].iter().all(u8::is_ascii_alphanumeric)
        && bytes[11].is_ascii_digit()
}

pub fn validate(
    request: &TradeCaptureRequest,
    enrichment: &EnrichmentResult,
) -> Result<(), CaptureError> {
    if request.security_id.is_empty() {
        return Err(CaptureError::Validation("securityId must not be empty".into()));
    }
    // A 12-character id claims ISIN shape and must hold it
    if request.security_id.len() == 12 && !is_plausible_isin(&request.security_id) {
        return Err(CaptureError::Validation(format!(
            "securityId {} is not a plausible ISIN",
            request.security_id
        )));
    }
    if request.account_id.is_empty() || request.book_id.is_empty() {
        return Err(CaptureError::Validation(
            "accountId and bookId must be present".into(),
        ));
    }
    if request.counterparty_ids.is_empty() {
        return Err(CaptureError::Validation(
            "at least one counterparty is required".into(),
        ));
    }
    if request.trade_lots.is_empty() {
        return Err(CaptureError::Validation("tradeLots must not be empty".into()));
    }

    // Lot-level sequences must be strictly increasing when present
    let mut last_lot_seq = None;
    for lot in &request.trade_lots {
        if let Some(seq) = lot.sequence {
            if last_lot_seq.is_some_and(|prev| seq <= prev) {
                return Err(CaptureError::Validation(format!(
                    "lot sequence {} out of order within payload",
                    seq
                )));
            }
            last_lot_seq = Some(seq);
        }
    }

    if request.trade_date > Utc::now().date_naive() {
        return Err(CaptureError::Validation(format!(
            "tradeDate {} is in the future",
            request.trade_date
        )));
    }

    if let Some(account) = &enrichment.account {
        if !account.account_open {
            return Err(CaptureError::Validation(format!(
                "account {} is closed",
                account.account_id
            )));
        }
        if !account.credit_approved {
            return Err(CaptureError::Validation(format!(
                "account {} lacks credit approval",
                account.account_id
            )));
        }
    }

    Ok(())
}

//! Rule evaluation
//!
//! Rules read a combined view of the request and the working blotter, and
//! mutate the blotter through a fixed set of targets. Workflow rules may
//! inspect fields produced by earlier sets; economic rules must not depend
//! on workflow outcomes, which the fixed set order enforces structurally.

use serde_json::Value;
use tracing::debug;

use super::types::{Criterion, Operator, Rule, RuleSet};
use crate::error::CaptureError;
use crate::models::{SwapBlotter, TradeCaptureRequest, WorkflowStatus};

/// Apply all rule sets in order. Returns applied rule ids in order.
pub fn evaluate(
    rules: &RuleSet,
    request: &TradeCaptureRequest,
    blotter: &mut SwapBlotter,
) -> Result<Vec<String>, CaptureError> {
    let mut applied = Vec::new();
    for bucket in [&rules.economic, &rules.non_economic, &rules.workflow] {
        for rule in bucket {
            if matches(rule, request, blotter)? {
                for action in &rule.actions {
                    apply_action(blotter, &action.target, &action.value)?;
                }
                debug!(rule_id = %rule.id, rule_type = %rule.rule_type, "Rule applied");
                applied.push(rule.id.clone());
            }
        }
    }
    Ok(applied)
}

fn matches(
    rule: &Rule,
    request: &TradeCaptureRequest,
    blotter: &SwapBlotter,
) -> Result<bool, CaptureError> {
    for criterion in &rule.criteria {
        let Some(actual) = field_value(request, blotter, &criterion.field) else {
            return Ok(false);
        };
        if !compare(&actual, criterion)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Read-view over the request and the blotter being assembled.
///
/// Supported fields: tradeId, accountId, bookId, securityId, partitionKey,
/// source, tradeDate, lotCount, counterpartyCount, notional,
/// enrichmentStatus, workflowStatus, taxonomy, metadata.<key>.
fn field_value(
    request: &TradeCaptureRequest,
    blotter: &SwapBlotter,
    field: &str,
) -> Option<Value> {
    if let Some(key) = field.strip_prefix("metadata.") {
        return request.metadata.get(key).map(|v| Value::String(v.clone()));
    }
    match field {
        "tradeId" => Some(Value::String(request.trade_id.clone())),
        "accountId" => Some(Value::String(request.account_id.clone())),
        "bookId" => Some(Value::String(request.book_id.clone())),
        "securityId" => Some(Value::String(request.security_id.clone())),
        "partitionKey" => Some(Value::String(request.partition_key())),
        "source" => Some(Value::String(request.source.as_str().to_string())),
        "tradeDate" => Some(Value::String(request.trade_date.to_string())),
        "lotCount" => Some(Value::from(request.trade_lots.len() as u64)),
        "counterpartyCount" => Some(Value::from(request.counterparty_ids.len() as u64)),
        "notional" => {
            let notional: rust_decimal::Decimal =
                request.trade_lots.iter().map(|l| l.qty * l.price).sum();
            notional.to_string().parse::<f64>().ok().map(Value::from)
        }
        "enrichmentStatus" => Some(Value::String(blotter.enrichment_status.as_str().to_string())),
        "workflowStatus" => Some(Value::String(blotter.workflow_status.as_str().to_string())),
        "taxonomy" => blotter
            .contract
            .taxonomy
            .as_ref()
            .map(|t| Value::String(t.clone())),
        _ => None,
    }
}

fn compare(actual: &Value, criterion: &Criterion) -> Result<bool, CaptureError> {
    let expected = &criterion.value;
    let result = match criterion.operator {
        Operator::Eq => actual == expected,
        Operator::Ne => actual != expected,
        Operator::Gt => ordering(actual, expected)? == std::cmp::Ordering::Greater,
        Operator::Gte => ordering(actual, expected)? != std::cmp::Ordering::Less,
        Operator::Lt => ordering(actual, expected)? == std::cmp::Ordering::Less,
        Operator::Lte => ordering(actual, expected)? != std::cmp::Ordering::Greater,
        Operator::In => expected
            .as_array()
            .map(|arr| arr.contains(actual))
            .unwrap_or(false),
        Operator::Contains => match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(arr), needle) => arr.contains(needle),
            _ => false,
        },
    };
    Ok(result)
}

fn ordering(actual: &Value, expected: &Value) -> Result<std::cmp::Ordering, CaptureError> {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            a.partial_cmp(&b).ok_or_else(|| {
                CaptureError::RulesEval("non-comparable numeric criterion".into())
            })
        }
        // ISO dates and plain strings order lexically
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(CaptureError::RulesEval(format!(
            "ordering comparison between {:?} and {:?}",
            actual, expected
        ))),
    }
}

/// Write-view: the fixed set of mutable targets on the working blotter.
fn apply_action(blotter: &mut SwapBlotter, target: &str, value: &Value) -> Result<(), CaptureError> {
    match target {
        "workflowStatus" => {
            let status = match value.as_str() {
                Some("APPROVED") => WorkflowStatus::Approved,
                Some("PENDING_APPROVAL") => WorkflowStatus::PendingApproval,
                Some("REJECTED") => WorkflowStatus::Rejected,
                other => {
                    return Err(CaptureError::RulesEval(format!(
                        "invalid workflowStatus action value {:?}",
                        other
                    )));
                }
            };
            blotter.workflow_status = status;
        }
        "taxonomy" => {
            blotter.contract.taxonomy = value.as_str().map(str::to_string);
        }
        "terminationDate" => {
            let date = value
                .as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    CaptureError::RulesEval(format!(
                        "invalid terminationDate action value {:?}",
                        value
                    ))
                })?;
            blotter.contract.economic_terms.termination_date = Some(date);
        }
        "identifiers.add" => {
            if let Some(id) = value.as_str() {
                let id = id.to_string();
                if !blotter.contract.identifiers.contains(&id) {
                    blotter.contract.identifiers.push(id);
                }
            }
        }
        other => {
            return Err(CaptureError::RulesEval(format!(
                "unknown action target {:?}",
                other
            )));
        }
    }
    Ok(())
}

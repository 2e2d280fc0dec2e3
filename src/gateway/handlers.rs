//! REST handlers
//!
//! The capture contract: 201 with the blotter on sync completion, 200 for an
//! equivalent duplicate, 202 with a job reference in async mode, 409 on
//! conflicting idempotency, 503 with Retry-After under admission control.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::state::AppState;
use super::types::*;
use crate::error::CaptureError;
use crate::models::TradeCaptureRequest;
use crate::pipeline::{CaptureOutcome, ExecuteOptions};
use crate::rules::{Rule, RuleType};

#[derive(Debug, Default, Deserialize)]
pub struct CaptureParams {
    /// "sync" (default) or "async"
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub retry_failed: Option<bool>,
}

pub async fn capture(
    State(state): State<AppState>,
    Query(params): Query<CaptureParams>,
    headers: HeaderMap,
    Json(mut request): Json<TradeCaptureRequest>,
) -> Response {
    // Admission control fronts everything else
    let Some(_ticket) = state.admission.try_enter() else {
        return unavailable_with_retry(state.retry_after_secs, "ADMISSION_QUEUE_FULL");
    };

    if request.idempotency_key.is_none() {
        if let Some(key) = header_string(&headers, "Idempotency-Key") {
            request.idempotency_key = Some(key);
        }
    }
    let callback_url = header_string(&headers, "X-Callback-Url");
    let retry_failed = params.retry_failed.unwrap_or(false);

    if params.mode.as_deref() == Some("async") {
        return capture_async(state, request, callback_url, retry_failed)
            .await
            .into_response();
    }
    capture_sync(state, request, retry_failed).await.into_response()
}

async fn capture_sync(
    state: AppState,
    request: TradeCaptureRequest,
    retry_failed: bool,
) -> Response {
    let opts = ExecuteOptions {
        retry_failed,
        ..Default::default()
    };
    match state.pipeline.execute(request, opts).await {
        Ok(CaptureOutcome::Completed(blotter)) => created(CaptureAccepted {
            status: "COMPLETED",
            blotter: Some(blotter),
            result_ref: None,
        })
        .into_response(),
        Ok(CaptureOutcome::Duplicate { result_ref, blotter }) => {
            // Same payload resubmitted: 200 with the memoized result
            ok(CaptureAccepted {
                status: "DUPLICATE",
                blotter,
                result_ref: Some(result_ref),
            })
            .into_response()
        }
        Ok(CaptureOutcome::Pending) => accepted(CaptureAccepted {
            status: "PENDING",
            blotter: None,
            result_ref: None,
        })
        .into_response(),
        Ok(CaptureOutcome::PendingApproval) => accepted(CaptureAccepted {
            status: "PENDING_APPROVAL",
            blotter: None,
            result_ref: None,
        })
        .into_response(),
        Ok(CaptureOutcome::Buffered) => accepted(CaptureAccepted {
            status: "BUFFERED",
            blotter: None,
            result_ref: None,
        })
        .into_response(),
        Ok(CaptureOutcome::PreviouslyFailed { reason }) => {
            let msg = reason.unwrap_or_else(|| "DUPLICATE_TRADE_ID".into());
            (
                axum::http::StatusCode::CONFLICT,
                Json(ApiResponse::<()>::error(409, msg)),
            )
                .into_response()
        }
        Err(CaptureError::RateLimitExceeded(partition)) => {
            let retry_after = state.limiter.retry_after_secs(&partition);
            unavailable_with_retry(retry_after, "RATE_LIMIT_EXCEEDED")
        }
        Err(e) => capture_error::<()>(&e).into_response(),
    }
}

async fn capture_async(
    state: AppState,
    request: TradeCaptureRequest,
    callback_url: Option<String>,
    retry_failed: bool,
) -> Response {
    let job = match state.jobs.create(&request.trade_id, callback_url).await {
        Ok(job) => job,
        Err(e) => return capture_error::<()>(&e).into_response(),
    };

    let pipeline = Arc::clone(&state.pipeline);
    let jobs = Arc::clone(&state.jobs);
    let job_id = job.job_id;
    tokio::spawn(async move {
        // Cancellation may have landed first; only PENDING jobs start
        match jobs.mark_processing(job_id).await {
            Ok(true) => {
                let opts = ExecuteOptions {
                    retry_failed,
                    job_id: Some(job_id),
                    ..Default::default()
                };
                let _ = pipeline.execute(request, opts).await;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Job start failed");
            }
        }
    });

    accepted(AsyncAccepted {
        job_id: job.job_id,
        status_url: format!("/trades/jobs/{}/status", job.job_id),
    })
    .into_response()
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ============================================================
// JOBS
// ============================================================

pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<JobStatusData> {
    match state.jobs.get(job_id).await {
        Ok(Some(record)) => ok(JobStatusData::from(&record)),
        Ok(None) => capture_error(&CaptureError::JobNotFound(job_id.to_string())),
        Err(e) => capture_error(&e),
    }
}

pub async fn job_cancel(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<JobStatusData> {
    match state.jobs.cancel(job_id).await {
        Ok(record) => ok(JobStatusData::from(&record)),
        Err(e) => capture_error(&e),
    }
}

// ============================================================
// DIAGNOSTICS
// ============================================================

pub async fn health() -> ApiResult<serde_json::Value> {
    ok(json!({
        "status": "ok",
        "build": env!("GIT_HASH"),
    }))
}

pub async fn backpressure_status(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    ok(json!({
        "admission": state.admission.status(),
        "globalTokensAvailable": state.limiter.global_available(),
        "bulkheadCallerRuns": state.bulkhead.caller_runs_total(),
        "sequenceBufferTotal": state.gate.buffered_total(),
        "publisher": state.publisher.status(),
    }))
}

pub async fn rate_limit_status(
    State(state): State<AppState>,
    Path(partition_key): Path<String>,
) -> ApiResult<crate::backpressure::RateLimitStatus> {
    ok(state.limiter.status(&partition_key))
}

pub async fn consumer_groups_status(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    match &state.consumer {
        Some(consumer) => ok(serde_json::to_value(consumer.status()).unwrap_or_default()),
        None => ok(json!({ "attached": false })),
    }
}

pub async fn sequence_buffer_status(
    State(state): State<AppState>,
) -> ApiResult<Vec<crate::seqgate::PartitionBufferStatus>> {
    ok(state.gate.status())
}

// ============================================================
// RULES ADMIN
// ============================================================

pub async fn rule_upsert(
    State(state): State<AppState>,
    Path(rule_type): Path<String>,
    Json(mut rule): Json<Rule>,
) -> ApiResult<serde_json::Value> {
    let Some(parsed) = RuleType::parse(&rule_type) else {
        return capture_error(&CaptureError::Validation(format!(
            "unknown rule type {}",
            rule_type
        )));
    };
    rule.rule_type = parsed;
    match state.rules.upsert(rule) {
        Ok(version) => ok(json!({ "version": version })),
        Err(e) => capture_error(&e),
    }
}

pub async fn rule_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    match state.rules.delete(&id) {
        Ok(()) => ok(json!({ "deleted": id })),
        Err(e) => capture_error(&e),
    }
}

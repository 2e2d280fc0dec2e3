//! API response types and error mapping
//!
//! Every response is the unified `{code, msg, data}` envelope: code 0 on
//! success, the stable wire code string carried in `msg` on error.

use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use uuid::Uuid;

use crate::error::CaptureError;
use crate::jobs::JobRecord;
use crate::models::SwapBlotter;

/// Unified API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// 0 for success, non-zero for errors
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

/// Handler return alias
pub type ApiResult<T> =
    Result<(StatusCode, Json<ApiResponse<T>>), (StatusCode, Json<ApiResponse<()>>)>;

#[inline]
pub fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::success(data))))
}

#[inline]
pub fn created<T: Serialize>(data: T) -> ApiResult<T> {
    Ok((StatusCode::CREATED, Json(ApiResponse::success(data))))
}

#[inline]
pub fn accepted<T: Serialize>(data: T) -> ApiResult<T> {
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(data))))
}

/// Map an engine error onto the envelope with its HTTP status.
pub fn capture_error<T>(err: &CaptureError) -> ApiResult<T> {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Err((
        status,
        Json(ApiResponse::<()>::error(status.as_u16() as i32, err.code())),
    ))
}

/// 503 with Retry-After, for admission and rate-limit denials.
pub fn unavailable_with_retry(retry_after_secs: u64, msg: &str) -> axum::response::Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [("Retry-After", retry_after_secs.to_string())],
        Json(ApiResponse::<()>::error(503, msg)),
    )
        .into_response()
}

// ============================================================
// Response DTOs
// ============================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureAccepted {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blotter: Option<SwapBlotter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncAccepted {
    pub job_id: Uuid,
    pub status_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusData {
    pub job_id: Uuid,
    pub trade_id: String,
    pub status: String,
    pub progress: i16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&JobRecord> for JobStatusData {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id,
            trade_id: record.trade_id.clone(),
            status: record.state.as_str().to_string(),
            progress: record.progress,
            result_ref: record.result_ref.clone(),
            error_code: record.error_code.clone(),
            error_message: record.error_message.clone(),
        }
    }
}

//! REST façade
//!
//! Thin axum layer over the engine: capture submission (sync/async), job
//! lifecycle, rule administration, and read-only diagnostics.

mod handlers;
mod state;
mod types;

pub use state::AppState;
pub use types::{ApiResponse, ApiResult};

use axum::Router;
use axum::routing::{delete, get, post};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/trades/capture", post(handlers::capture))
        .route("/trades/jobs/{job_id}/status", get(handlers::job_status))
        .route("/trades/jobs/{job_id}", delete(handlers::job_cancel))
        .route("/health", get(handlers::health))
        .route("/backpressure/status", get(handlers::backpressure_status))
        .route(
            "/rate-limit/status/{partition_key}",
            get(handlers::rate_limit_status),
        )
        .route(
            "/consumer-groups/status",
            get(handlers::consumer_groups_status),
        )
        .route(
            "/sequence-buffer/status",
            get(handlers::sequence_buffer_status),
        )
        .route(
            "/rules/{rule_type_or_id}",
            post(handlers::rule_upsert).delete(handlers::rule_delete),
        )
        .with_state(state)
}

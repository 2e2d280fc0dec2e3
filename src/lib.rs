//! tradecapture - Trade-Capture Ingestion Engine
//!
//! A partition-sharded ingestion pipeline that accepts trade lots, enriches
//! them with reference data, runs the rules engine, maintains per-instrument
//! CDM position state, and publishes SwapBlotters downstream.
//!
//! # Modules
//!
//! - [`models`] - Capture requests, trade lots, SwapBlotter
//! - [`bus`] - Topic bus capability with per-partition sub-topics
//! - [`router`] - Ingress routing onto sanitized sub-topics
//! - [`consumer`] - Wildcard consumption, sticky workers, lag control
//! - [`pipeline`] - The capture pipeline (locks, idempotency, gate, rules,
//!   state, publish)
//! - [`locks`] - Cluster-style partition lock leases
//! - [`idempotency`] - Two-tier duplicate detection and memoization
//! - [`seqgate`] - Per-partition re-sequencing with timeout sweep
//! - [`position`] - CDM position state machine with optimistic versioning
//! - [`rules`] - Economic / non-economic / workflow rule evaluation
//! - [`enrichment`] - Parallel reference-data fan-out with circuit breakers
//! - [`backpressure`] - Token buckets, bulkheads, API admission
//! - [`retry`] - Deadlock-aware and adaptive retry policies
//! - [`publisher`] - Multi-subscriber blotter fan-out
//! - [`dlq`] - Dead-letter emission
//! - [`jobs`] - Async job lifecycle with webhook callbacks
//! - [`gateway`] - REST façade

// Core types - must be first!
pub mod core_types;

// Configuration & ambient stack
pub mod config;
pub mod error;
pub mod logging;

// Domain model & wire format
pub mod frame;
pub mod models;
pub mod schema;

// Engine components
pub mod backpressure;
pub mod blotters;
pub mod bus;
pub mod consumer;
pub mod dlq;
pub mod enrichment;
pub mod gateway;
pub mod idempotency;
pub mod jobs;
pub mod locks;
pub mod pipeline;
pub mod position;
pub mod publisher;
pub mod retry;
pub mod router;
pub mod rules;
pub mod seqgate;

#[cfg(test)]
pub mod test_support;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use error::CaptureError;
pub use models::{SwapBlotter, TradeCaptureRequest, TradeLot, TradeSource};
pub use pipeline::{CaptureOutcome, ExecuteOptions, TradePipeline};
pub use position::PositionState;

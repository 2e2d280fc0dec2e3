//! Test harness helpers
//!
//! Builds a fully wired pipeline over in-memory repositories and a given
//! in-process bus. Compiled for tests only.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::backpressure::{Bulkhead, RateLimiter};
use crate::blotters::{BlotterRepository, InMemoryBlotterRepository};
use crate::bus::{InProcessBus, MessageBus};
use crate::config::{
    BackpressureConfig, DeadlockRetryConfig, IdempotencyConfig, PartitionLockConfig,
    PublisherConfig, RateLimitConfig, SequenceGateConfig,
};
use crate::core_types::SeqNum;
use crate::dlq::DlqEmitter;
use crate::enrichment::{EnrichmentService, StaticReferenceDataSource};
use crate::idempotency::{IdempotencyService, InMemoryIdempotencyRepository};
use crate::locks::PartitionLockService;
use crate::models::{TradeCaptureRequest, TradeLot, TradeSource};
use crate::pipeline::{ApprovalService, AutoApprovalService, TradePipeline};
use crate::position::{InMemoryPositionRepository, PositionRepository, PositionStore};
use crate::publisher::Publisher;
use crate::retry::RetrySupervisor;
use crate::rules::{RuleStore, default_seed};
use crate::seqgate::SequenceGate;
use crate::jobs::{InMemoryJobRepository, JobStore};

/// Pipeline with permissive limits, auto-approval, and default seed rules,
/// publishing on the given bus.
pub fn pipeline_on_bus(bus: Arc<InProcessBus>) -> Arc<TradePipeline> {
    let dlq = Arc::new(DlqEmitter::new(
        bus.clone() as Arc<dyn MessageBus>,
        "trade/capture/dlq",
    ));
    Arc::new(TradePipeline::new(
        Arc::new(RateLimiter::new(RateLimitConfig {
            global_rate_per_sec: 100_000.0,
            global_burst: 100_000.0,
            partition_rate_per_sec: 10_000.0,
            partition_burst: 10_000.0,
        })),
        Arc::new(PartitionLockService::new(PartitionLockConfig {
            wait_timeout_ms: 2_000,
            hold_ttl_ms: 60_000,
            backoff_initial_ms: 5,
            backoff_max_ms: 20,
        })),
        Arc::new(IdempotencyService::new(
            Arc::new(InMemoryIdempotencyRepository::new()),
            IdempotencyConfig::default(),
        )),
        Arc::new(SequenceGate::new(SequenceGateConfig::default())),
        Arc::new(EnrichmentService::for_tests(Arc::new(
            StaticReferenceDataSource::permissive(),
        ))),
        Arc::new(RuleStore::new(default_seed())),
        Arc::new(PositionStore::new(
            Arc::new(InMemoryPositionRepository::new()) as Arc<dyn PositionRepository>,
        )),
        Arc::new(InMemoryBlotterRepository::new()) as Arc<dyn BlotterRepository>,
        Arc::new(RetrySupervisor::new(DeadlockRetryConfig {
            max_attempts: 5,
            initial_ms: 1,
            max_ms: 4,
            multiplier: 1.5,
        })),
        Arc::new(Publisher::new(
            bus as Arc<dyn MessageBus>,
            Arc::clone(&dlq),
            &PublisherConfig::default(),
            "trade/capture/blotter",
        )),
        dlq,
        Arc::new(JobStore::new(Arc::new(InMemoryJobRepository::new()))),
        Arc::new(Bulkhead::new(&BackpressureConfig::default())),
        Arc::new(AutoApprovalService) as Arc<dyn ApprovalService>,
    ))
}

/// Minimal valid automated capture request on partition A_B_US0378331005.
pub fn request(trade_id: &str, seq: Option<SeqNum>) -> TradeCaptureRequest {
    TradeCaptureRequest {
        trade_id: trade_id.into(),
        idempotency_key: None,
        account_id: "A".into(),
        book_id: "B".into(),
        security_id: "US0378331005".into(),
        source: TradeSource::Automated,
        trade_date: Utc::now().date_naive(),
        booking_timestamp: Utc::now(),
        sequence_number: seq,
        trade_lots: vec![TradeLot {
            lot_id: None,
            qty: Decimal::from(100),
            price: Decimal::from(150),
            sequence: None,
        }],
        counterparty_ids: BTreeSet::from(["CP1".to_string(), "CP2".to_string()]),
        metadata: BTreeMap::new(),
        manual_entry: None,
    }
}

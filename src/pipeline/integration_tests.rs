//! Pipeline integration tests
//!
//! End-to-end scenarios over in-memory repositories, the in-process bus, and
//! the static reference-data source.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use super::*;
use crate::backpressure::{Bulkhead, RateLimiter};
use crate::blotters::InMemoryBlotterRepository;
use crate::bus::{BusConsumer, InProcessBus, MessageBus};
use crate::config::{
    BackpressureConfig, IdempotencyConfig, PartitionLockConfig, PublisherConfig, RateLimitConfig,
    SequenceGateConfig,
};
use crate::dlq::{DeadLetter, DlqEmitter};
use crate::enrichment::{EnrichmentService, StaticReferenceDataSource};
use crate::idempotency::{
    ClaimOutcome, IdemStatus, IdempotencyRecord, IdempotencyRepository,
    InMemoryIdempotencyRepository,
};
use crate::locks::PartitionLockService;
use crate::models::{TradeCaptureRequest, TradeLot, TradeSource};
use crate::position::{InMemoryPositionRepository, PartitionStateRecord, PositionRepository};
use crate::publisher::Publisher;
use crate::retry::RetrySupervisor;
use crate::rules::{RuleStore, default_seed};
use crate::seqgate::SequenceGate;
use crate::jobs::{InMemoryJobRepository, JobStore};

/// Idempotency repository that loses `failures` claims to deadlocks first.
struct DeadlockingIdempotencyRepository {
    inner: InMemoryIdempotencyRepository,
    failures: AtomicU32,
}

impl DeadlockingIdempotencyRepository {
    fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryIdempotencyRepository::new(),
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl IdempotencyRepository for DeadlockingIdempotencyRepository {
    async fn insert_processing(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<ClaimOutcome, CaptureError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CaptureError::DeadlockVictim);
        }
        self.inner.insert_processing(record).await
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, CaptureError> {
        self.inner.get(key).await
    }

    async fn mark(
        &self,
        key: &str,
        status: IdemStatus,
        result_ref: Option<&str>,
        failure_reason: Option<&str>,
    ) -> Result<(), CaptureError> {
        self.inner.mark(key, status, result_ref, failure_reason).await
    }

    async fn purge_expired(&self) -> Result<u64, CaptureError> {
        self.inner.purge_expired().await
    }
}

struct Harness {
    pipeline: TradePipeline,
    bus: Arc<InProcessBus>,
    blotters: Arc<InMemoryBlotterRepository>,
    idempotency: Arc<IdempotencyService>,
    positions: Arc<InMemoryPositionRepository>,
    approval: Arc<StaticApprovalService>,
    output: Arc<dyn BusConsumer>,
    dlq_output: Arc<dyn BusConsumer>,
}

fn harness() -> Harness {
    harness_with(
        Arc::new(InMemoryIdempotencyRepository::new()),
        SequenceGateConfig {
            buffer_window: 100,
            timeout_secs: 300,
            time_window_days: 7,
            sweep_interval_secs: 1,
        },
        RateLimitConfig {
            global_rate_per_sec: 10_000.0,
            global_burst: 10_000.0,
            partition_rate_per_sec: 1_000.0,
            partition_burst: 1_000.0,
        },
    )
}

fn harness_with(
    idem_repo: Arc<dyn IdempotencyRepository>,
    gate_config: SequenceGateConfig,
    rate_config: RateLimitConfig,
) -> Harness {
    let bus = Arc::new(InProcessBus::new(1024));
    let output = bus.subscribe("trade/capture/blotter/>", "test-output");
    let dlq_output = bus.subscribe("trade/capture/dlq", "test-dlq");
    let dlq = Arc::new(DlqEmitter::new(
        bus.clone() as Arc<dyn MessageBus>,
        "trade/capture/dlq",
    ));

    let blotters = Arc::new(InMemoryBlotterRepository::new());
    let positions = Arc::new(InMemoryPositionRepository::new());
    let approval = Arc::new(StaticApprovalService::new());
    let idempotency = Arc::new(IdempotencyService::new(idem_repo, IdempotencyConfig::default()));

    let retry = Arc::new(RetrySupervisor::new(crate::config::DeadlockRetryConfig {
        max_attempts: 5,
        initial_ms: 1,
        max_ms: 4,
        multiplier: 1.5,
    }));

    let pipeline = TradePipeline::new(
        Arc::new(RateLimiter::new(rate_config)),
        Arc::new(PartitionLockService::new(PartitionLockConfig {
            wait_timeout_ms: 2_000,
            hold_ttl_ms: 60_000,
            backoff_initial_ms: 5,
            backoff_max_ms: 20,
        })),
        Arc::clone(&idempotency),
        Arc::new(SequenceGate::new(gate_config)),
        Arc::new(EnrichmentService::for_tests(Arc::new(
            StaticReferenceDataSource::permissive(),
        ))),
        Arc::new(RuleStore::new(default_seed())),
        Arc::new(crate::position::PositionStore::new(
            Arc::clone(&positions) as Arc<dyn PositionRepository>
        )),
        Arc::clone(&blotters) as Arc<dyn crate::blotters::BlotterRepository>,
        retry,
        Arc::new(Publisher::new(
            bus.clone() as Arc<dyn MessageBus>,
            Arc::clone(&dlq),
            &PublisherConfig::default(),
            "trade/capture/blotter",
        )),
        dlq,
        Arc::new(JobStore::new(Arc::new(InMemoryJobRepository::new()))),
        Arc::new(Bulkhead::new(&BackpressureConfig::default())),
        Arc::clone(&approval) as Arc<dyn ApprovalService>,
    );

    Harness {
        pipeline,
        bus,
        blotters,
        idempotency,
        positions,
        approval,
        output,
        dlq_output,
    }
}

fn request(trade_id: &str, seq: Option<i64>) -> TradeCaptureRequest {
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

async fn expect_publish(consumer: &Arc<dyn BusConsumer>) -> crate::bus::BusMessage {
    tokio::time::timeout(Duration::from_secs(2), consumer.next())
        .await
        .expect("publish within deadline")
        .expect("bus open")
}

#[tokio::test]
async fn test_happy_path_automated_trade() {
    let h = harness();
    let outcome = h
        .pipeline
        .execute(request("T-1", Some(1)), ExecuteOptions::default())
        .await
        .unwrap();

    let blotter = match outcome {
        CaptureOutcome::Completed(b) => b,
        other => panic!("expected Completed, got {:?}", other),
    };
    assert_eq!(blotter.workflow_status, crate::models::WorkflowStatus::Approved);
    assert_eq!(blotter.state, "FORMED");
    assert_eq!(blotter.partition_key, "A_B_US0378331005");

    // Position ran none -> Executed -> Formed, version 2
    let position = h.positions.get("A_B_US0378331005").await.unwrap().unwrap();
    assert_eq!(position.state, PositionState::Formed);
    assert_eq!(position.version, 2);

    // Blotter persisted, idempotency COMPLETED
    assert!(h.blotters.get_by_trade_id("T-1").await.unwrap().is_some());
    assert_eq!(
        h.idempotency.probe("T-1").await.unwrap(),
        crate::idempotency::ProbeResult::Completed {
            result_ref: "T-1".into()
        }
    );

    // One publish on the partition output topic
    let msg = expect_publish(&h.output).await;
    assert_eq!(msg.topic, "trade/capture/blotter/A_B_US0378331005");
}

#[tokio::test]
async fn test_duplicate_submission_returns_same_reference() {
    let h = harness();
    h.pipeline
        .execute(request("T-1", Some(1)), ExecuteOptions::default())
        .await
        .unwrap();
    expect_publish(&h.output).await;

    let outcome = h
        .pipeline
        .execute(request("T-1", Some(1)), ExecuteOptions::default())
        .await
        .unwrap();
    match outcome {
        CaptureOutcome::Duplicate { result_ref, blotter } => {
            assert_eq!(result_ref, "T-1");
            assert_eq!(blotter.unwrap().trade_id, "T-1");
        }
        other => panic!("expected Duplicate, got {:?}", other),
    }

    // Exactly one publish observed
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.output.lag(), 0);
    assert_eq!(h.blotters.count(), 1);
}

#[tokio::test]
async fn test_duplicate_with_different_payload_rejected() {
    let h = harness();
    h.pipeline
        .execute(request("T-1", Some(1)), ExecuteOptions::default())
        .await
        .unwrap();

    let mut altered = request("T-1", Some(1));
    altered.trade_lots[0].qty = Decimal::from(999);
    let err = h
        .pipeline
        .execute(altered, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CaptureError::DuplicateDifferentPayload(_)));
}

#[tokio::test]
async fn test_out_of_order_then_fill_processes_both_in_order() {
    let h = harness();

    let outcome = h
        .pipeline
        .execute(request("T-2", Some(2)), ExecuteOptions::default())
        .await
        .unwrap();
    assert!(matches!(outcome, CaptureOutcome::Buffered));
    assert_eq!(h.blotters.count(), 0);

    let outcome = h
        .pipeline
        .execute(request("T-1", Some(1)), ExecuteOptions::default())
        .await
        .unwrap();
    assert!(matches!(outcome, CaptureOutcome::Completed(_)));

    // The drained seq=2 processed under the same lock hold
    assert_eq!(h.blotters.count(), 2);
    assert!(h.blotters.get_by_trade_id("T-2").await.unwrap().is_some());

    // Position saw both writes in sequence order
    let position = h.positions.get("A_B_US0378331005").await.unwrap().unwrap();
    assert_eq!(position.last_sequence, Some(2));

    // Two publishes, seq 1 first
    let first = expect_publish(&h.output).await;
    let (_, blotter): (_, crate::models::SwapBlotter) =
        crate::frame::decode_frame(crate::frame::FrameType::SwapBlotter, &first.payload).unwrap();
    assert_eq!(blotter.trade_id, "T-1");
    expect_publish(&h.output).await;
}

#[tokio::test]
async fn test_gap_too_large_dead_letters() {
    let h = harness_with(
        Arc::new(InMemoryIdempotencyRepository::new()),
        SequenceGateConfig {
            buffer_window: 2,
            timeout_secs: 300,
            time_window_days: 7,
            sweep_interval_secs: 1,
        },
        RateLimitConfig {
            global_rate_per_sec: 10_000.0,
            global_burst: 10_000.0,
            partition_rate_per_sec: 1_000.0,
            partition_burst: 1_000.0,
        },
    );

    for (trade, seq) in [("T-5", 5), ("T-6", 6)] {
        let outcome = h
            .pipeline
            .execute(request(trade, Some(seq)), ExecuteOptions::default())
            .await
            .unwrap();
        assert!(matches!(outcome, CaptureOutcome::Buffered));
    }

    let err = h
        .pipeline
        .execute(request("T-7", Some(7)), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CaptureError::GapTooLarge));

    let letter: DeadLetter =
        serde_json::from_slice(&expect_publish(&h.dlq_output).await.payload).unwrap();
    assert_eq!(letter.error_code, "GAP_TOO_LARGE");
    assert_eq!(letter.trade_id.as_deref(), Some("T-7"));
}

#[tokio::test]
async fn test_manual_trade_parks_then_approval_completes() {
    let h = harness();

    let mut manual = request("T-M", None);
    manual.source = TradeSource::Manual;

    // Approval service has no decision yet: parked
    let outcome = h
        .pipeline
        .execute(manual.clone(), ExecuteOptions::default())
        .await
        .unwrap();
    assert!(matches!(outcome, CaptureOutcome::PendingApproval));
    assert_eq!(
        h.idempotency.probe("T-M").await.unwrap(),
        crate::idempotency::ProbeResult::Processing
    );
    assert!(h.positions.get("A_B_US0378331005").await.unwrap().is_none());

    // Approval callback re-enters the pipeline
    h.approval.set("T-M", ApprovalDecision::Approved);
    let outcome = h
        .pipeline
        .execute(
            manual,
            ExecuteOptions {
                resume_pending: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    match outcome {
        CaptureOutcome::Completed(blotter) => {
            assert_eq!(blotter.workflow_status, crate::models::WorkflowStatus::Approved);
        }
        other => panic!("expected Completed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_manual_trade_rejection_marks_failed() {
    let h = harness();
    let mut manual = request("T-R", None);
    manual.source = TradeSource::Manual;
    h.approval.set("T-R", ApprovalDecision::Rejected("fat finger".into()));

    let err = h
        .pipeline
        .execute(manual, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CaptureError::Validation(_)));

    assert!(matches!(
        h.idempotency.probe("T-R").await.unwrap(),
        crate::idempotency::ProbeResult::Failed { .. }
    ));
    // Rejected blotters never reach the store or the bus
    assert_eq!(h.blotters.count(), 0);
    assert!(h.positions.get("A_B_US0378331005").await.unwrap().is_none());
}

#[tokio::test]
async fn test_induced_deadlocks_recover_within_budget() {
    let h = harness_with(
        Arc::new(DeadlockingIdempotencyRepository::new(2)),
        SequenceGateConfig::default(),
        RateLimitConfig {
            global_rate_per_sec: 10_000.0,
            global_burst: 10_000.0,
            partition_rate_per_sec: 1_000.0,
            partition_burst: 1_000.0,
        },
    );

    let outcome = h
        .pipeline
        .execute(request("T-D", Some(1)), ExecuteOptions::default())
        .await
        .unwrap();
    assert!(matches!(outcome, CaptureOutcome::Completed(_)));
}

#[tokio::test]
async fn test_rate_limit_denies_past_burst() {
    let h = harness_with(
        Arc::new(InMemoryIdempotencyRepository::new()),
        SequenceGateConfig::default(),
        RateLimitConfig {
            global_rate_per_sec: 10_000.0,
            global_burst: 10_000.0,
            partition_rate_per_sec: 0.0,
            partition_burst: 1.0,
        },
    );

    h.pipeline
        .execute(request("T-1", Some(1)), ExecuteOptions::default())
        .await
        .unwrap();
    let err = h
        .pipeline
        .execute(request("T-2", Some(2)), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CaptureError::RateLimitExceeded(_)));
}

#[tokio::test]
async fn test_closed_partition_rejects_new_trades() {
    let h = harness();
    h.positions
        .insert_new(&PartitionStateRecord {
            partition_key: "A_B_US0378331005".into(),
            state: PositionState::Closed,
            state_blob: Vec::new(),
            last_sequence: None,
            version: 1,
        })
        .await
        .unwrap();

    let err = h
        .pipeline
        .execute(request("T-1", Some(1)), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CaptureError::IllegalTransition { .. }));
    assert!(matches!(
        h.idempotency.probe("T-1").await.unwrap(),
        crate::idempotency::ProbeResult::Failed { .. }
    ));
}

#[tokio::test]
async fn test_failed_then_flagged_retry_completes() {
    let h = harness();

    // First attempt fails validation (no counterparties)
    let mut bad = request("T-F", None);
    bad.counterparty_ids.clear();
    let err = h
        .pipeline
        .execute(bad, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CaptureError::Validation(_)));

    // Unflagged resubmission reports the prior failure
    let outcome = h
        .pipeline
        .execute(request("T-F", None), ExecuteOptions::default())
        .await
        .unwrap();
    assert!(matches!(outcome, CaptureOutcome::PreviouslyFailed { .. }));

    // Flagged retry with the corrected payload completes
    let outcome = h
        .pipeline
        .execute(
            request("T-F", None),
            ExecuteOptions {
                retry_failed: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, CaptureOutcome::Completed(_)));
}

#[tokio::test]
async fn test_redelivery_of_processed_message_changes_nothing() {
    let h = harness();
    let req = request("T-1", Some(1));
    h.pipeline
        .execute(req.clone(), ExecuteOptions::default())
        .await
        .unwrap();
    expect_publish(&h.output).await;

    let position_before = h.positions.get("A_B_US0378331005").await.unwrap().unwrap();

    // At-least-once redelivery from the bus
    let outcome = h.pipeline.execute(req, ExecuteOptions::default()).await.unwrap();
    assert!(matches!(outcome, CaptureOutcome::Duplicate { .. }));

    let position_after = h.positions.get("A_B_US0378331005").await.unwrap().unwrap();
    assert_eq!(position_before.version, position_after.version);
    assert_eq!(h.blotters.count(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.output.lag(), 0);
}

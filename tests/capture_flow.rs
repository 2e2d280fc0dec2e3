//! End-to-end capture flow over the full messaging plane:
//! ingress topic -> router -> per-partition sub-topics -> consumer workers
//! -> pipeline -> blotter output topic, with the DLQ observing rejections.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;

use tradecapture::backpressure::{Bulkhead, RateLimiter};
use tradecapture::blotters::{BlotterRepository, InMemoryBlotterRepository};
use tradecapture::bus::{BusConsumer, InProcessBus, MessageBus};
use tradecapture::config::{
    BackpressureConfig, BusConfig, DeadlockRetryConfig, IdempotencyConfig, PartitionLockConfig,
    PublisherConfig, RateLimitConfig, SequenceGateConfig,
};
use tradecapture::consumer::{ConsumerManager, LagMonitor};
use tradecapture::dlq::{DeadLetter, DlqEmitter};
use tradecapture::enrichment::{EnrichmentService, StaticReferenceDataSource};
use tradecapture::frame::{FrameType, decode_frame, encode_frame};
use tradecapture::idempotency::{IdempotencyService, InMemoryIdempotencyRepository};
use tradecapture::jobs::{InMemoryJobRepository, JobStore};
use tradecapture::locks::PartitionLockService;
use tradecapture::models::{SwapBlotter, TradeCaptureRequest, TradeLot, TradeSource};
use tradecapture::pipeline::{ApprovalService, AutoApprovalService, ExecuteOptions, TradePipeline};
use tradecapture::position::{InMemoryPositionRepository, PositionRepository, PositionStore};
use tradecapture::publisher::Publisher;
use tradecapture::retry::RetrySupervisor;
use tradecapture::router::IngressRouter;
use tradecapture::rules::{RuleStore, default_seed};
use tradecapture::seqgate::{SequenceGate, SequenceSweeper};

struct Engine {
    bus: Arc<InProcessBus>,
    pipeline: Arc<TradePipeline>,
    gate: Arc<SequenceGate>,
    dlq: Arc<DlqEmitter>,
    blotters: Arc<InMemoryBlotterRepository>,
    bus_config: BusConfig,
}

fn engine(gate_config: SequenceGateConfig) -> Engine {
    let bus = Arc::new(InProcessBus::new(4096));
    let bus_config = BusConfig::default();
    let dlq = Arc::new(DlqEmitter::new(
        bus.clone() as Arc<dyn MessageBus>,
        bus_config.dlq_topic.clone(),
    ));
    let blotters = Arc::new(InMemoryBlotterRepository::new());
    let gate = Arc::new(SequenceGate::new(gate_config));

    let pipeline = Arc::new(TradePipeline::new(
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
        Arc::clone(&gate),
        Arc::new(EnrichmentService::for_tests(Arc::new(
            StaticReferenceDataSource::permissive(),
        ))),
        Arc::new(RuleStore::new(default_seed())),
        Arc::new(PositionStore::new(
            Arc::new(InMemoryPositionRepository::new()) as Arc<dyn PositionRepository>,
        )),
        Arc::clone(&blotters) as Arc<dyn BlotterRepository>,
        Arc::new(RetrySupervisor::new(DeadlockRetryConfig {
            max_attempts: 5,
            initial_ms: 1,
            max_ms: 4,
            multiplier: 1.5,
        })),
        Arc::new(Publisher::new(
            bus.clone() as Arc<dyn MessageBus>,
            Arc::clone(&dlq),
            &PublisherConfig::default(),
            &bus_config.output_prefix,
        )),
        Arc::clone(&dlq),
        Arc::new(JobStore::new(Arc::new(InMemoryJobRepository::new()))),
        Arc::new(Bulkhead::new(&BackpressureConfig::default())),
        Arc::new(AutoApprovalService) as Arc<dyn ApprovalService>,
    ));

    Engine {
        bus,
        pipeline,
        gate,
        dlq,
        blotters,
        bus_config,
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

async fn recv(consumer: &Arc<dyn BusConsumer>) -> tradecapture::bus::BusMessage {
    tokio::time::timeout(Duration::from_secs(3), consumer.next())
        .await
        .expect("message within deadline")
        .expect("bus open")
}

#[tokio::test]
async fn test_ingress_to_blotter_through_the_full_plane() {
    let e = engine(SequenceGateConfig::default());
    let output = e.bus.subscribe("trade/capture/blotter/>", "downstream");

    // Router + consumers run as they do in production
    let router = Arc::new(IngressRouter::new(
        e.bus.clone() as Arc<dyn MessageBus>,
        Arc::clone(&e.dlq),
        e.bus_config.clone(),
    ));
    let consumer_mgr = Arc::new(ConsumerManager::new(
        e.bus.clone() as Arc<dyn MessageBus>,
        Arc::clone(&e.pipeline),
        Arc::clone(&e.dlq),
        &e.bus_config,
        &BackpressureConfig::default(),
    ));
    let lag_monitor = LagMonitor::new(consumer_mgr.consumer(), &BackpressureConfig::default());
    tokio::spawn({
        let router = Arc::clone(&router);
        async move { router.run().await }
    });
    tokio::spawn(Arc::clone(&consumer_mgr).run());

    // Three trades on one partition, published out of order
    for (trade, seq) in [("T-2", 2), ("T-1", 1), ("T-3", 3)] {
        let payload = encode_frame(FrameType::CaptureRequest, seq as u64, &request(trade, Some(seq)))
            .unwrap();
        e.bus
            .publish(&e.bus_config.input_topic, None, payload)
            .await
            .unwrap();
    }

    // All three blotters arrive, re-sequenced into 1, 2, 3
    let mut seen = Vec::new();
    for _ in 0..3 {
        let msg = recv(&output).await;
        assert_eq!(msg.topic, "trade/capture/blotter/A_B_US0378331005");
        let (_, blotter): (_, SwapBlotter) =
            decode_frame(FrameType::SwapBlotter, &msg.payload).unwrap();
        seen.push(blotter.trade_id);
    }
    assert_eq!(seen, vec!["T-1", "T-2", "T-3"]);
    assert_eq!(e.blotters.count(), 3);

    lag_monitor.sample_once();
    assert!(!consumer_mgr.status().paused);
}

#[tokio::test]
async fn test_buffer_timeout_dead_letters_and_unblocks_partition() {
    let e = engine(SequenceGateConfig {
        buffer_window: 100,
        timeout_secs: 0,
        time_window_days: 7,
        sweep_interval_secs: 1,
    });
    let dlq_output = e.bus.subscribe("trade/capture/dlq", "dlq-reader");

    // seq 2 and 3 park awaiting seq 1, which never arrives
    for (trade, seq) in [("T-2", 2), ("T-3", 3)] {
        let outcome = e
            .pipeline
            .execute(request(trade, Some(seq)), ExecuteOptions::default())
            .await
            .unwrap();
        assert!(matches!(outcome, tradecapture::CaptureOutcome::Buffered));
    }

    let sweeper = SequenceSweeper::new(
        Arc::clone(&e.gate),
        Arc::clone(&e.dlq),
        Duration::from_secs(1),
    );
    let evicted = sweeper.sweep_once(Instant::now() + Duration::from_secs(1)).await;
    assert_eq!(evicted, 2);

    for _ in 0..2 {
        let letter: DeadLetter = serde_json::from_slice(&recv(&dlq_output).await.payload).unwrap();
        assert_eq!(letter.error_code, "SEQUENCE_TIMEOUT");
    }

    // The watermark advanced past the dead run: seq 4 flows immediately
    let outcome = e
        .pipeline
        .execute(request("T-4", Some(4)), ExecuteOptions::default())
        .await
        .unwrap();
    assert!(matches!(outcome, tradecapture::CaptureOutcome::Completed(_)));
}

#[tokio::test]
async fn test_replayed_history_bypasses_sequencing() {
    let e = engine(SequenceGateConfig::default());

    // A 30-day-old booking timestamp with a wildly future sequence
    let mut replay = request("T-OLD", Some(9_999));
    replay.booking_timestamp = Utc::now() - chrono::Duration::days(30);

    let outcome = e
        .pipeline
        .execute(replay, ExecuteOptions::default())
        .await
        .unwrap();
    assert!(matches!(outcome, tradecapture::CaptureOutcome::Completed(_)));

    // Live traffic still sequences from the start
    let outcome = e
        .pipeline
        .execute(request("T-1", Some(1)), ExecuteOptions::default())
        .await
        .unwrap();
    assert!(matches!(outcome, tradecapture::CaptureOutcome::Completed(_)));
}

//! Consumer manager
//!
//! One wildcard subscription covers every routed per-partition sub-topic. A
//! dispatcher hands each decoded request to one of K workers; assignment is
//! sticky per partition, so cache locality and lock affinity survive
//! rebalances. Ordering does not depend on stickiness — the partition lock
//! fences any accidental overlap.
//!
//! Backpressure: bounded per-worker channels cap in-flight work (the
//! dispatcher parks when a worker is full, which is the in-process analog of
//! NACK-and-redeliver), and the lag monitor pauses the whole subscription
//! when total lag crosses the high-water mark.

use dashmap::DashMap;
use rustc_hash::FxHasher;
use serde::Serialize;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bus::{BusConsumer, MessageBus};
use crate::config::{BackpressureConfig, BusConfig};
use crate::core_types::WorkerId;
use crate::dlq::{DlqEmitter, DlqStage};
use crate::error::CaptureError;
use crate::frame::{FrameType, decode_frame};
use crate::models::TradeCaptureRequest;
use crate::pipeline::{ExecuteOptions, TradePipeline};

pub struct ConsumerManager {
    pipeline: Arc<TradePipeline>,
    consumer: Arc<dyn BusConsumer>,
    dlq: Arc<DlqEmitter>,
    assignment: DashMap<String, WorkerId>,
    workers: usize,
    max_inflight: usize,
}

/// Diagnostics for the consumer-groups status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStatus {
    pub paused: bool,
    pub lag: u64,
    pub workers: usize,
    pub assigned_partitions: usize,
}

impl ConsumerManager {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        pipeline: Arc<TradePipeline>,
        dlq: Arc<DlqEmitter>,
        bus_config: &BusConfig,
        backpressure: &BackpressureConfig,
    ) -> Self {
        let pattern = format!("{}/>", bus_config.input_prefix);
        let consumer = bus.subscribe(&pattern, "capture-workers");
        Self {
            pipeline,
            consumer,
            dlq,
            assignment: DashMap::new(),
            workers: backpressure.consumer_workers.max(1),
            max_inflight: backpressure.max_inflight.max(1),
        }
    }

    /// Shared handle for the lag monitor and diagnostics.
    pub fn consumer(&self) -> Arc<dyn BusConsumer> {
        Arc::clone(&self.consumer)
    }

    /// Sticky partition assignment: keep the previous owner when it is still
    /// a live worker, otherwise hash.
    pub fn sticky_worker(&self, partition_key: &str) -> WorkerId {
        if let Some(existing) = self.assignment.get(partition_key) {
            if *existing < self.workers {
                return *existing;
            }
        }
        let mut hasher = FxHasher::default();
        partition_key.hash(&mut hasher);
        let worker = (hasher.finish() as usize) % self.workers;
        self.assignment.insert(partition_key.to_string(), worker);
        worker
    }

    /// Rebalance bookkeeping: drop assignments to departed workers, keep the
    /// rest (the sticky preference).
    pub fn rebalance(&self, workers: usize) {
        let workers = workers.max(1);
        self.assignment.retain(|_, w| *w < workers);
        info!(workers, retained = self.assignment.len(), "Consumer rebalance");
    }

    pub fn status(&self) -> ConsumerStatus {
        ConsumerStatus {
            paused: self.consumer.is_paused(),
            lag: self.consumer.lag(),
            workers: self.workers,
            assigned_partitions: self.assignment.len(),
        }
    }

    /// Dispatcher + worker loops. Runs until the bus closes.
    pub async fn run(self: Arc<Self>) {
        let mut senders: Vec<mpsc::Sender<TradeCaptureRequest>> = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let (tx, rx) = mpsc::channel::<TradeCaptureRequest>(self.max_inflight);
            senders.push(tx);
            let pipeline = Arc::clone(&self.pipeline);
            tokio::spawn(async move {
                Self::worker_loop(worker_id, pipeline, rx).await;
            });
        }
        info!(workers = self.workers, "Consumer workers started");

        while let Some(msg) = self.consumer.next().await {
            let request: TradeCaptureRequest =
                match decode_frame(FrameType::CaptureRequest, &msg.payload) {
                    Ok((_, request)) => request,
                    Err(e) => {
                        self.dlq
                            .emit(
                                DlqStage::Consumer,
                                &e,
                                msg.key.as_deref(),
                                None,
                                DlqEmitter::render_payload(&msg.payload),
                            )
                            .await;
                        self.consumer.ack(&msg);
                        continue;
                    }
                };

            let worker = self.sticky_worker(&request.partition_key());
            // Parks here when the worker is at its in-flight cap
            if senders[worker].send(request).await.is_err() {
                error!(worker, "Consumer worker channel closed");
                break;
            }
            self.consumer.ack(&msg);
        }
    }

    /// Sequential per-worker processing. Rate-limit denials back off and
    /// retry in place, preserving sub-topic order.
    async fn worker_loop(
        worker_id: WorkerId,
        pipeline: Arc<TradePipeline>,
        mut rx: mpsc::Receiver<TradeCaptureRequest>,
    ) {
        while let Some(request) = rx.recv().await {
            loop {
                match pipeline.execute(request.clone(), ExecuteOptions::default()).await {
                    Ok(outcome) => {
                        debug!(worker = worker_id, trade_id = %request.trade_id, ?outcome,
                            "Consumed");
                        break;
                    }
                    Err(CaptureError::RateLimitExceeded(_)) => {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(worker = worker_id, trade_id = %request.trade_id, error = %e,
                            "Transient capture failure, redelivering");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Err(e) => {
                        // Terminal: already recorded FAILED / dead-lettered
                        warn!(worker = worker_id, trade_id = %request.trade_id, error = %e,
                            "Capture failed");
                        break;
                    }
                }
            }
        }
    }
}

// ============================================================
// LAG MONITOR
// ============================================================

/// Samples total consumer lag on a fixed cadence; pauses the subscription
/// past `max_lag`, resumes below `resume_lag`.
pub struct LagMonitor {
    consumer: Arc<dyn BusConsumer>,
    max_lag: u64,
    resume_lag: u64,
    interval: Duration,
}

impl LagMonitor {
    pub fn new(consumer: Arc<dyn BusConsumer>, config: &BackpressureConfig) -> Self {
        Self {
            consumer,
            max_lag: config.max_lag,
            resume_lag: config.resume_lag,
            interval: Duration::from_secs(config.lag_interval_secs),
        }
    }

    pub async fn run(&self) -> ! {
        info!(
            max_lag = self.max_lag,
            resume_lag = self.resume_lag,
            interval_secs = self.interval.as_secs(),
            "Starting lag monitor"
        );
        loop {
            tokio::time::sleep(self.interval).await;
            self.sample_once();
        }
    }

    /// One sampling cycle.
    pub fn sample_once(&self) {
        let lag = self.consumer.lag();
        if lag > self.max_lag && !self.consumer.is_paused() {
            warn!(lag, max_lag = self.max_lag, "Lag over limit, pausing consumer");
            self.consumer.pause();
        } else if lag < self.resume_lag && self.consumer.is_paused() {
            info!(lag, resume_lag = self.resume_lag, "Lag recovered, resuming consumer");
            self.consumer.resume();
        }
    }
}

//! Sequence gate
//!
//! Delivers capture requests to the pipeline in monotonically increasing
//! sequence order within a partition, while tolerating reordering of
//! arrivals. Out-of-order arrivals park in a bounded per-partition buffer
//! until the contiguous predecessor lands or the timeout sweeper evicts the
//! run.
//!
//! Requests with no sequence number pass through unchanged; the upstream
//! partition-routing substrate owns ordering for those. Booking timestamps
//! older than the configured time window also bypass the gate (history
//! replay).

mod sweeper;

pub use sweeper::SequenceSweeper;

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::SequenceGateConfig;
use crate::core_types::SeqNum;
use crate::models::TradeCaptureRequest;

/// A parked out-of-order arrival
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub partition_key: String,
    pub sequence: SeqNum,
    pub request: TradeCaptureRequest,
    pub arrival: Instant,
}

/// Gate verdict for one arrival
#[derive(Debug)]
pub enum GateDecision {
    /// In order: the offered request plus any contiguous drained successors,
    /// in delivery order.
    Deliver(Vec<TradeCaptureRequest>),
    /// No sequence number, or booking timestamp outside the replay window.
    Bypass,
    /// Parked awaiting the gap to fill.
    Buffered,
    /// Terminal rejection; route to the DLQ.
    Reject(GateReject),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReject {
    /// Sequence at or below the last delivered for the partition
    OutOfOrderTooOld,
    /// Buffer window exhausted
    GapTooLarge,
}

#[derive(Debug, Default)]
struct PartitionWindow {
    last_delivered: SeqNum,
    buffer: BTreeMap<SeqNum, BufferedMessage>,
}

/// Per-partition buffer depth snapshot for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct PartitionBufferStatus {
    pub partition_key: String,
    pub last_delivered: SeqNum,
    pub buffered: usize,
    pub oldest_age_secs: u64,
}

pub struct SequenceGate {
    partitions: DashMap<String, PartitionWindow>,
    config: SequenceGateConfig,
}

impl SequenceGate {
    pub fn new(config: SequenceGateConfig) -> Self {
        Self {
            partitions: DashMap::new(),
            config,
        }
    }

    /// Run one arrival through the decision procedure.
    pub fn offer(&self, request: TradeCaptureRequest) -> GateDecision {
        let Some(seq) = request.sequence_number else {
            return GateDecision::Bypass;
        };

        let replay_cutoff =
            chrono::Utc::now() - chrono::Duration::days(self.config.time_window_days);
        if request.booking_timestamp < replay_cutoff {
            debug!(
                trade_id = %request.trade_id,
                "Booking timestamp outside replay window, bypassing gate"
            );
            return GateDecision::Bypass;
        }

        let partition_key = request.partition_key();
        let mut window = self.partitions.entry(partition_key.clone()).or_default();

        if seq == window.last_delivered + 1 {
            let mut last_delivered = seq;
            let mut batch = vec![request];
            // Drain while the head of the buffer stays contiguous
            while let Some(entry) = window.buffer.first_entry() {
                if *entry.key() != last_delivered + 1 {
                    break;
                }
                let buffered = entry.remove();
                last_delivered = buffered.sequence;
                batch.push(buffered.request);
            }
            window.last_delivered = last_delivered;
            if batch.len() > 1 {
                debug!(
                    partition = %partition_key,
                    drained = batch.len() - 1,
                    "Gap filled, draining buffered run"
                );
            }
            GateDecision::Deliver(batch)
        } else if seq <= window.last_delivered {
            warn!(
                partition = %partition_key,
                seq,
                last_delivered = window.last_delivered,
                "Rejecting sequence at or below last delivered"
            );
            GateDecision::Reject(GateReject::OutOfOrderTooOld)
        } else if window.buffer.len() < self.config.buffer_window {
            window.buffer.insert(
                seq,
                BufferedMessage {
                    partition_key: partition_key.clone(),
                    sequence: seq,
                    request,
                    arrival: Instant::now(),
                },
            );
            GateDecision::Buffered
        } else {
            warn!(
                partition = %partition_key,
                seq,
                window = self.config.buffer_window,
                "Buffer window exhausted"
            );
            GateDecision::Reject(GateReject::GapTooLarge)
        }
    }

    /// Evict every buffered run whose oldest arrival is older than the
    /// timeout. The partition's watermark advances past the evicted run so
    /// future traffic flows.
    pub fn sweep_expired(&self, now: Instant) -> Vec<BufferedMessage> {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let mut evicted = Vec::new();

        for mut entry in self.partitions.iter_mut() {
            let partition_key = entry.key().clone();
            let window = entry.value_mut();
            let oldest = window.buffer.values().map(|m| m.arrival).min();
            let Some(oldest) = oldest else { continue };
            if now.duration_since(oldest) < timeout {
                continue;
            }

            let max_seq = window.buffer.keys().next_back().copied().unwrap_or(0);
            warn!(
                partition = %partition_key,
                evicted = window.buffer.len(),
                new_watermark = max_seq,
                "Sequence buffer timed out, evicting run"
            );
            window.last_delivered = window.last_delivered.max(max_seq);
            let drained: Vec<BufferedMessage> =
                std::mem::take(&mut window.buffer).into_values().collect();
            evicted.extend(drained);
        }
        evicted
    }

    /// Diagnostics for the sequence-buffer status endpoint
    pub fn status(&self) -> Vec<PartitionBufferStatus> {
        let now = Instant::now();
        self.partitions
            .iter()
            .filter(|e| !e.value().buffer.is_empty())
            .map(|e| {
                let oldest = e
                    .value()
                    .buffer
                    .values()
                    .map(|m| now.duration_since(m.arrival).as_secs())
                    .max()
                    .unwrap_or(0);
                PartitionBufferStatus {
                    partition_key: e.key().clone(),
                    last_delivered: e.value().last_delivered,
                    buffered: e.value().buffer.len(),
                    oldest_age_secs: oldest,
                }
            })
            .collect()
    }

    pub fn buffered_total(&self) -> usize {
        self.partitions.iter().map(|e| e.value().buffer.len()).sum()
    }
}

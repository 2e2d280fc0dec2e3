//! Sequence buffer timeout sweeper
//!
//! Background worker that evicts buffered runs whose gap never filled and
//! dead-letters them with SEQUENCE_TIMEOUT.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::SequenceGate;
use crate::dlq::{DlqEmitter, DlqStage};
use crate::error::CaptureError;

pub struct SequenceSweeper {
    gate: Arc<SequenceGate>,
    dlq: Arc<DlqEmitter>,
    interval: Duration,
}

impl SequenceSweeper {
    pub fn new(gate: Arc<SequenceGate>, dlq: Arc<DlqEmitter>, interval: Duration) -> Self {
        Self { gate, dlq, interval }
    }

    /// Run the sweep loop forever.
    pub async fn run(&self) -> ! {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting sequence sweeper"
        );
        loop {
            tokio::time::sleep(self.interval).await;
            self.sweep_once(Instant::now()).await;
        }
    }

    /// One sweep cycle. Returns the number of dead-lettered messages.
    pub async fn sweep_once(&self, now: Instant) -> usize {
        let expired = self.gate.sweep_expired(now);
        if expired.is_empty() {
            debug!("No expired sequence buffers");
            return 0;
        }

        let count = expired.len();
        for message in expired {
            let payload = serde_json::to_value(&message.request).ok();
            self.dlq
                .emit(
                    DlqStage::SequenceGate,
                    &CaptureError::SequenceTimeout,
                    Some(&message.partition_key),
                    Some(&message.request.trade_id),
                    payload,
                )
                .await;
        }
        info!(count, "Dead-lettered timed-out sequence buffers");
        count
    }
}

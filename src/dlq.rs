//! Dead-letter emission
//!
//! Single logical sink per flow (router, consumer/pipeline, publisher). An
//! emission never blocks the producer path beyond a short bounded timeout,
//! and never propagates failure; losing a dead letter is logged, not thrown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::bus::MessageBus;
use crate::error::CaptureError;

/// Where in the flow the message died
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DlqStage {
    Router,
    SequenceGate,
    Consumer,
    Pipeline,
    Publisher,
}

impl DlqStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqStage::Router => "ROUTER",
            DlqStage::SequenceGate => "SEQUENCE_GATE",
            DlqStage::Consumer => "CONSUMER",
            DlqStage::Pipeline => "PIPELINE",
            DlqStage::Publisher => "PUBLISHER",
        }
    }
}

/// Dead-letter envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub stage: DlqStage,
    pub error_code: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub trade_id: Option<String>,
    /// Original payload when it decodes as JSON, else a lossy text rendering
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

pub struct DlqEmitter {
    bus: Arc<dyn MessageBus>,
    topic: String,
    emit_timeout: Duration,
}

impl DlqEmitter {
    pub fn new(bus: Arc<dyn MessageBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            emit_timeout: Duration::from_secs(2),
        }
    }

    /// Emit a dead letter. Failure to emit is terminal for the letter, not
    /// for the caller.
    pub async fn emit(
        &self,
        stage: DlqStage,
        error: &CaptureError,
        partition_key: Option<&str>,
        trade_id: Option<&str>,
        payload: Option<serde_json::Value>,
    ) {
        let letter = DeadLetter {
            stage,
            error_code: error.code().to_string(),
            error_message: error.to_string(),
            timestamp: Utc::now(),
            partition_key: partition_key.map(str::to_string),
            trade_id: trade_id.map(str::to_string),
            payload,
        };

        warn!(
            stage = stage.as_str(),
            code = %letter.error_code,
            partition = partition_key.unwrap_or("-"),
            trade_id = trade_id.unwrap_or("-"),
            "Dead-lettering message"
        );

        let bytes = match serde_json::to_vec(&letter) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "Dead letter serialization failed");
                return;
            }
        };

        let publish = self.bus.publish(&self.topic, partition_key, bytes);
        match tokio::time::timeout(self.emit_timeout, publish).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, topic = %self.topic, "Dead letter publish failed"),
            Err(_) => error!(topic = %self.topic, "Dead letter publish timed out"),
        }
    }

    /// Render raw bytes for the envelope payload field.
    pub fn render_payload(bytes: &[u8]) -> Option<serde_json::Value> {
        match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(v) => Some(v),
            Err(_) => Some(serde_json::Value::String(
                String::from_utf8_lossy(bytes).into_owned(),
            )),
        }
    }
}

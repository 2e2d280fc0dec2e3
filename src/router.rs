//! Ingress router
//!
//! Consumes the single upstream capture topic and republishes each message
//! onto its per-partition sub-topic, keyed and sanitized, so one logical
//! consumer group downstream sees strictly per-partition streams.
//! Undecodable frames and keyless requests go to the router DLQ with error
//! metadata. Delivery is at-least-once; downstream idempotency absorbs the
//! replays.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::bus::{BusConsumer, BusMessage, MessageBus, sanitize_partition_key};
use crate::config::BusConfig;
use crate::dlq::{DlqEmitter, DlqStage};
use crate::error::CaptureError;
use crate::frame::{FrameType, decode_frame};
use crate::models::TradeCaptureRequest;

pub struct IngressRouter {
    bus: Arc<dyn MessageBus>,
    dlq: Arc<DlqEmitter>,
    config: BusConfig,
}

impl IngressRouter {
    pub fn new(bus: Arc<dyn MessageBus>, dlq: Arc<DlqEmitter>, config: BusConfig) -> Self {
        Self { bus, dlq, config }
    }

    /// Consume the upstream topic forever.
    pub async fn run(&self) {
        let consumer = self.bus.subscribe(&self.config.input_topic, "ingress-router");
        info!(topic = %self.config.input_topic, "Ingress router consuming");
        while let Some(msg) = consumer.next().await {
            self.route_one(&msg).await;
            consumer.ack(&msg);
        }
    }

    /// Route a single upstream message. Returns the sub-topic on success.
    pub async fn route_one(&self, msg: &BusMessage) -> Option<String> {
        let request: TradeCaptureRequest =
            match decode_frame(FrameType::CaptureRequest, &msg.payload) {
                Ok((_, request)) => request,
                Err(e) => {
                    self.dlq
                        .emit(
                            DlqStage::Router,
                            &e,
                            msg.key.as_deref(),
                            None,
                            DlqEmitter::render_payload(&msg.payload),
                        )
                        .await;
                    return None;
                }
            };

        let partition_key = request.partition_key();
        if request.account_id.is_empty()
            || request.book_id.is_empty()
            || request.security_id.is_empty()
        {
            self.dlq
                .emit(
                    DlqStage::Router,
                    &CaptureError::Validation("missing partition key component".into()),
                    Some(&partition_key),
                    Some(&request.trade_id),
                    serde_json::to_value(&request).ok(),
                )
                .await;
            return None;
        }

        let sub_topic = format!(
            "{}/{}",
            self.config.input_prefix,
            sanitize_partition_key(&partition_key)
        );

        // Republish the frame bytes untouched; the router adds routing, not
        // re-encoding.
        let mut delay = Duration::from_millis(50);
        for attempt in 1..=3u32 {
            match self
                .bus
                .publish(&sub_topic, Some(&partition_key), msg.payload.clone())
                .await
            {
                Ok(()) => {
                    debug!(
                        trade_id = %request.trade_id,
                        sub_topic = %sub_topic,
                        "Routed to partition sub-topic"
                    );
                    return Some(sub_topic);
                }
                Err(e) if attempt == 3 => {
                    error!(trade_id = %request.trade_id, error = %e, "Routing publish exhausted");
                    self.dlq
                        .emit(
                            DlqStage::Router,
                            &e,
                            Some(&partition_key),
                            Some(&request.trade_id),
                            serde_json::to_value(&request).ok(),
                        )
                        .await;
                }
                Err(_) => {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use crate::dlq::DeadLetter;
    use crate::frame::encode_frame;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::collections::{BTreeMap, BTreeSet};

    fn request(account: &str) -> TradeCaptureRequest {
        TradeCaptureRequest {
            trade_id: "T-1".into(),
            idempotency_key: None,
            account_id: account.into(),
            book_id: "B".into(),
            security_id: "SEC#1".into(),
            source: crate::models::TradeSource::Automated,
            trade_date: Utc::now().date_naive(),
            booking_timestamp: Utc::now(),
            sequence_number: Some(1),
            trade_lots: vec![crate::models::TradeLot {
                lot_id: None,
                qty: Decimal::ONE,
                price: Decimal::ONE,
                sequence: None,
            }],
            counterparty_ids: BTreeSet::from(["CP1".to_string()]),
            metadata: BTreeMap::new(),
            manual_entry: None,
        }
    }

    fn setup() -> (Arc<InProcessBus>, IngressRouter) {
        let bus = Arc::new(InProcessBus::new(64));
        let dlq = Arc::new(DlqEmitter::new(bus.clone(), "trade/capture/router/dlq"));
        let router = IngressRouter::new(bus.clone(), dlq, BusConfig::default());
        (bus, router)
    }

    #[tokio::test]
    async fn test_routes_to_sanitized_sub_topic() {
        let (bus, router) = setup();
        let sub_consumer = bus.subscribe("trade/capture/input/>", "worker");

        let payload = encode_frame(FrameType::CaptureRequest, 1, &request("A")).unwrap();
        let msg = BusMessage {
            topic: "trade/capture/input".into(),
            key: None,
            payload,
        };

        let topic = router.route_one(&msg).await.unwrap();
        assert_eq!(topic, "trade/capture/input/A_B_SEC_1");

        let routed = sub_consumer.next().await.unwrap();
        assert_eq!(routed.key.as_deref(), Some("A_B_SEC#1"));
        let (_, decoded): (_, TradeCaptureRequest) =
            decode_frame(FrameType::CaptureRequest, &routed.payload).unwrap();
        assert_eq!(decoded.trade_id, "T-1");
    }

    #[tokio::test]
    async fn test_undecodable_frame_goes_to_router_dlq() {
        let (bus, router) = setup();
        let dlq_consumer = bus.subscribe("trade/capture/router/dlq", "dlq-reader");

        let msg = BusMessage {
            topic: "trade/capture/input".into(),
            key: None,
            payload: vec![1, 2, 3],
        };
        assert!(router.route_one(&msg).await.is_none());

        let letter: DeadLetter =
            serde_json::from_slice(&dlq_consumer.next().await.unwrap().payload).unwrap();
        assert_eq!(letter.stage, DlqStage::Router);
        assert_eq!(letter.error_code, "SERIALIZATION_ERROR");
    }

    #[tokio::test]
    async fn test_missing_key_component_goes_to_router_dlq() {
        let (bus, router) = setup();
        let dlq_consumer = bus.subscribe("trade/capture/router/dlq", "dlq-reader");

        let payload = encode_frame(FrameType::CaptureRequest, 1, &request("")).unwrap();
        let msg = BusMessage {
            topic: "trade/capture/input".into(),
            key: None,
            payload,
        };
        assert!(router.route_one(&msg).await.is_none());

        let letter: DeadLetter =
            serde_json::from_slice(&dlq_consumer.next().await.unwrap().payload).unwrap();
        assert_eq!(letter.error_code, "VALIDATION_ERROR");
        assert_eq!(letter.trade_id.as_deref(), Some("T-1"));
    }
}

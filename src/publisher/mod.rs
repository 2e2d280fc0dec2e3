//! Blotter publisher
//!
//! Fans a finished SwapBlotter out to every enabled subscriber concurrently.
//! Subscribers fail independently; delivery status never feeds back into the
//! pipeline's success/failure decision. Bus subscribers get framed binary on
//! the per-partition output topic (at-least-once, bounded retry, then DLQ);
//! webhook subscribers get a JSON POST with the fixed 3-attempt policy.

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::bus::{MessageBus, sanitize_partition_key};
use crate::config::{PublisherConfig, SubscriberConfig};
use crate::dlq::{DlqEmitter, DlqStage};
use crate::error::CaptureError;
use crate::frame::{FrameType, encode_frame};
use crate::models::SwapBlotter;

/// Delivery target variants
#[derive(Debug, Clone)]
pub enum SubscriberSpec {
    /// Framed publish to `<prefix>/<sanitizedPartitionKey>`
    Bus { topic_prefix: String },
    /// JSON POST; 5xx and network errors retry, 4xx does not
    Webhook { url: String },
}

#[derive(Debug, Default)]
pub struct SubscriberMetrics {
    pub attempted: AtomicU64,
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub retries: AtomicU64,
}

pub struct Subscriber {
    pub name: String,
    pub spec: SubscriberSpec,
    pub enabled: bool,
    pub metrics: SubscriberMetrics,
}

/// Per-subscriber delivery counters for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStatus {
    pub name: String,
    pub enabled: bool,
    pub attempted: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retries: u64,
}

pub struct Publisher {
    bus: Arc<dyn MessageBus>,
    http: reqwest::Client,
    subscribers: Vec<Arc<Subscriber>>,
    dlq: Arc<DlqEmitter>,
    frame_seq: AtomicU64,
    bus_retry_attempts: u32,
    webhook_attempts: u32,
}

impl Publisher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        dlq: Arc<DlqEmitter>,
        config: &PublisherConfig,
        output_prefix: &str,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.webhook_timeout_secs))
            .build()
            .unwrap_or_default();

        let subscribers = config
            .subscribers
            .iter()
            .map(|sub| Arc::new(Self::build_subscriber(sub, output_prefix)))
            .collect();

        Self {
            bus,
            http,
            subscribers,
            dlq,
            frame_seq: AtomicU64::new(0),
            bus_retry_attempts: config.bus_retry_attempts.max(1),
            webhook_attempts: config.webhook_attempts.max(1),
        }
    }

    fn build_subscriber(config: &SubscriberConfig, output_prefix: &str) -> Subscriber {
        let spec = match config.kind.as_str() {
            "webhook" => SubscriberSpec::Webhook {
                url: config.url.clone(),
            },
            _ => SubscriberSpec::Bus {
                topic_prefix: output_prefix.to_string(),
            },
        };
        Subscriber {
            name: config.name.clone(),
            spec,
            enabled: config.enabled,
            metrics: SubscriberMetrics::default(),
        }
    }

    /// Deliver to all enabled subscribers concurrently.
    pub async fn publish(&self, blotter: &SwapBlotter) {
        let deliveries = self
            .subscribers
            .iter()
            .filter(|s| s.enabled)
            .map(|subscriber| self.deliver(Arc::clone(subscriber), blotter));
        join_all(deliveries).await;
    }

    async fn deliver(&self, subscriber: Arc<Subscriber>, blotter: &SwapBlotter) {
        subscriber.metrics.attempted.fetch_add(1, Ordering::Relaxed);
        let result = match &subscriber.spec {
            SubscriberSpec::Bus { topic_prefix } => {
                self.deliver_bus(&subscriber, topic_prefix, blotter).await
            }
            SubscriberSpec::Webhook { url } => self.deliver_webhook(&subscriber, url, blotter).await,
        };

        match result {
            Ok(()) => {
                subscriber.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    subscriber = %subscriber.name,
                    trade_id = %blotter.trade_id,
                    "Blotter delivered"
                );
            }
            Err(e) => {
                subscriber.metrics.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    subscriber = %subscriber.name,
                    trade_id = %blotter.trade_id,
                    error = %e,
                    "Blotter delivery exhausted retries"
                );
                self.dlq
                    .emit(
                        DlqStage::Publisher,
                        &e,
                        Some(&blotter.partition_key),
                        Some(&blotter.trade_id),
                        serde_json::to_value(blotter).ok(),
                    )
                    .await;
            }
        }
    }

    async fn deliver_bus(
        &self,
        subscriber: &Subscriber,
        topic_prefix: &str,
        blotter: &SwapBlotter,
    ) -> Result<(), CaptureError> {
        let topic = format!(
            "{}/{}",
            topic_prefix,
            sanitize_partition_key(&blotter.partition_key)
        );
        let seq = self.frame_seq.fetch_add(1, Ordering::Relaxed);
        let payload = encode_frame(FrameType::SwapBlotter, seq, blotter)?;

        let mut delay = Duration::from_millis(100);
        let mut last_err = None;
        for attempt in 1..=self.bus_retry_attempts {
            match self
                .bus
                .publish(&topic, Some(&blotter.partition_key), payload.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < self.bus_retry_attempts {
                        subscriber.metrics.retries.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CaptureError::PublishFailure("bus publish failed".into())))
    }

    async fn deliver_webhook(
        &self,
        subscriber: &Subscriber,
        url: &str,
        blotter: &SwapBlotter,
    ) -> Result<(), CaptureError> {
        post_json_with_retry(
            &self.http,
            url,
            blotter,
            self.webhook_attempts,
            &subscriber.metrics.retries,
        )
        .await
    }

    pub fn status(&self) -> Vec<SubscriberStatus> {
        self.subscribers
            .iter()
            .map(|s| SubscriberStatus {
                name: s.name.clone(),
                enabled: s.enabled,
                attempted: s.metrics.attempted.load(Ordering::Relaxed),
                delivered: s.metrics.delivered.load(Ordering::Relaxed),
                failed: s.metrics.failed.load(Ordering::Relaxed),
                retries: s.metrics.retries.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// POST a JSON body with the webhook retry policy: backoff 1s then 2s
/// between attempts; 5xx and network errors retry, 4xx is terminal.
pub async fn post_json_with_retry<T: Serialize>(
    client: &reqwest::Client,
    url: &str,
    body: &T,
    max_attempts: u32,
    retry_counter: &AtomicU64,
) -> Result<(), CaptureError> {
    let mut delay = Duration::from_secs(1);
    let mut last_err = String::new();

    for attempt in 1..=max_attempts.max(1) {
        match client.post(url).json(body).send().await {
            Ok(response) if response.status().is_success() => {
                if attempt > 1 {
                    info!(url, attempt, "Webhook delivered after retry");
                }
                return Ok(());
            }
            Ok(response) if response.status().is_client_error() => {
                return Err(CaptureError::PublishFailure(format!(
                    "webhook {} answered {}",
                    url,
                    response.status()
                )));
            }
            Ok(response) => last_err = format!("status {}", response.status()),
            Err(e) => last_err = e.to_string(),
        }

        if attempt < max_attempts {
            retry_counter.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
    Err(CaptureError::PublishFailure(format!(
        "webhook {} failed after {} attempts: {}",
        url, max_attempts, last_err
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConsumer, InProcessBus};
    use crate::frame::decode_frame;
    use crate::models::{
        Contract, EconomicTerms, EnrichmentStatus, ProcessingMetadata, WorkflowStatus,
    };

    fn blotter() -> SwapBlotter {
        SwapBlotter {
            trade_id: "T-1".into(),
            partition_key: "A_B_US0378331005".into(),
            trade_lots: Vec::new(),
            contract: Contract {
                identifiers: vec!["T-1".into()],
                taxonomy: None,
                economic_terms: EconomicTerms {
                    effective_date: chrono::NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
                    termination_date: None,
                    payouts: Vec::new(),
                },
            },
            state: "FORMED".into(),
            enrichment_status: EnrichmentStatus::Complete,
            workflow_status: WorkflowStatus::Approved,
            processing_metadata: ProcessingMetadata {
                processed_at: chrono::Utc::now(),
                elapsed_millis: 1,
                rules_applied: Vec::new(),
                enrichment_sources: Vec::new(),
            },
        }
    }

    fn publisher_config() -> PublisherConfig {
        PublisherConfig::default()
    }

    #[tokio::test]
    async fn test_bus_publish_lands_on_partition_topic() {
        let bus: Arc<InProcessBus> = Arc::new(InProcessBus::new(64));
        let consumer = bus.subscribe("trade/capture/blotter/>", "downstream");
        let dlq = Arc::new(DlqEmitter::new(bus.clone(), "trade/capture/dlq"));
        let publisher = Publisher::new(bus, dlq, &publisher_config(), "trade/capture/blotter");

        publisher.publish(&blotter()).await;

        let msg = consumer.next().await.unwrap();
        assert_eq!(msg.topic, "trade/capture/blotter/A_B_US0378331005");
        assert_eq!(msg.key.as_deref(), Some("A_B_US0378331005"));
        let (_, decoded): (_, SwapBlotter) =
            decode_frame(FrameType::SwapBlotter, &msg.payload).unwrap();
        assert_eq!(decoded.trade_id, "T-1");

        let status = publisher.status();
        assert_eq!(status[0].delivered, 1);
        assert_eq!(status[0].failed, 0);
    }

    #[tokio::test]
    async fn test_disabled_subscriber_is_skipped() {
        let bus: Arc<InProcessBus> = Arc::new(InProcessBus::new(64));
        let consumer = bus.subscribe("trade/capture/blotter/>", "downstream");
        let dlq = Arc::new(DlqEmitter::new(bus.clone(), "trade/capture/dlq"));
        let mut config = publisher_config();
        config.subscribers[0].enabled = false;
        let publisher = Publisher::new(bus, dlq, &config, "trade/capture/blotter");

        publisher.publish(&blotter()).await;
        assert_eq!(consumer.lag(), 0);
        assert_eq!(publisher.status()[0].attempted, 0);
    }

    #[tokio::test]
    async fn test_exhausted_bus_delivery_dead_letters() {
        // No room on any subscription queue: publish fails every attempt
        let bus: Arc<InProcessBus> = Arc::new(InProcessBus::new(0));
        let _blocked = bus.subscribe("trade/capture/blotter/>", "downstream");
        let dlq_consumer = bus.subscribe("trade/capture/dlq", "dlq-reader");
        let dlq = Arc::new(DlqEmitter::new(bus.clone(), "trade/capture/dlq"));
        let mut config = publisher_config();
        config.bus_retry_attempts = 2;
        let publisher = Publisher::new(bus, dlq, &config, "trade/capture/blotter");

        publisher.publish(&blotter()).await;

        assert_eq!(publisher.status()[0].failed, 1);
        assert_eq!(publisher.status()[0].retries, 1);
        // The dead letter itself rides a different topic with spare capacity...
        // except capacity is zero here, so the DLQ emit also fails silently.
        // Metrics are the observable contract in that degenerate setup.
        drop(dlq_consumer);
    }

    #[tokio::test]
    async fn test_one_failing_subscriber_does_not_block_others() {
        let bus: Arc<InProcessBus> = Arc::new(InProcessBus::new(64));
        let consumer = bus.subscribe("trade/capture/blotter/>", "downstream");
        let dlq = Arc::new(DlqEmitter::new(bus.clone(), "trade/capture/dlq"));
        let mut config = publisher_config();
        config.webhook_attempts = 1;
        config.subscribers.push(SubscriberConfig {
            name: "dead-webhook".into(),
            kind: "webhook".into(),
            // Nothing listens on port 1; connect is refused immediately
            url: "http://127.0.0.1:1/hook".into(),
            enabled: true,
        });
        let publisher = Publisher::new(bus, dlq, &config, "trade/capture/blotter");

        publisher.publish(&blotter()).await;

        assert!(consumer.next().await.is_some());
        let status = publisher.status();
        assert_eq!(status[0].delivered, 1);
        assert_eq!(status[1].failed, 1);
    }
}

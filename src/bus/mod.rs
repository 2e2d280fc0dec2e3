//! Messaging plane
//!
//! A narrow publish/consume capability over a topic bus with Solace-style
//! `>` wildcard subscriptions. The engine ships an in-process provider; a
//! broker-backed provider slots in behind the same traits.
//!
//! Ordering contract: messages published to one topic are delivered to each
//! matching subscription in publish order. Per-partition ordering falls out
//! of the one-topic-per-partition layout, never from cross-topic promises.

mod inproc;

pub use inproc::InProcessBus;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::CaptureError;

/// One message in flight on the bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    /// Routing key (the partition key for capture traffic)
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Consumer side of the capability: sequential delivery per subscription,
/// with lag observation and pause/resume for backpressure.
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Await the next message. Returns None when the bus shuts down.
    /// A paused consumer parks here until resumed.
    async fn next(&self) -> Option<BusMessage>;

    /// Acknowledge a delivered message.
    fn ack(&self, msg: &BusMessage);

    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;

    /// Messages delivered to the subscription but not yet consumed.
    fn lag(&self) -> u64;
}

/// Producer side of the capability.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), CaptureError>;

    /// Subscribe with an exact topic or a `prefix/>` wildcard.
    fn subscribe(&self, pattern: &str, group: &str) -> Arc<dyn BusConsumer>;
}

// ============================================================
// TOPIC UTILITIES
// ============================================================

/// Replace every character outside `[A-Za-z0-9_-]` with `_` so partition
/// keys embed safely in topic paths.
pub fn sanitize_partition_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Match a topic against a subscription pattern. `prefix/>` matches every
/// topic strictly below the prefix; anything else is an exact match.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/>") {
        topic.len() > prefix.len() + 1 && topic.starts_with(prefix) && topic.as_bytes()[prefix.len()] == b'/'
    } else {
        pattern == topic
    }
}

//! In-process bus provider
//!
//! Bounded per-subscription queues with wake-on-publish delivery. Publish
//! fans out to every matching subscription; a full queue fails the publish
//! so the caller's retry/DLQ policy engages instead of silently dropping.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tracing::debug;

use super::{BusConsumer, BusMessage, MessageBus, topic_matches};
use crate::error::CaptureError;

struct Subscription {
    pattern: String,
    group: String,
    queue: Mutex<VecDeque<BusMessage>>,
    capacity: usize,
    notify: Notify,
    paused: AtomicBool,
    delivered: AtomicU64,
    acked: AtomicU64,
}

impl Subscription {
    fn depth(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[async_trait]
impl BusConsumer for Subscription {
    async fn next(&self) -> Option<BusMessage> {
        loop {
            // Register for wakeup before the emptiness check so a publish
            // landing in between cannot be lost.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();

            if !self.paused.load(Ordering::Acquire) {
                let msg = self.queue.lock().unwrap().pop_front();
                if let Some(msg) = msg {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    return Some(msg);
                }
            }
            notified.await;
        }
    }

    fn ack(&self, _msg: &BusMessage) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            debug!(group = %self.group, pattern = %self.pattern, "Consumer paused");
        }
    }

    fn resume(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            debug!(group = %self.group, pattern = %self.pattern, "Consumer resumed");
            self.notify.notify_waiters();
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn lag(&self) -> u64 {
        self.depth() as u64
    }
}

pub struct InProcessBus {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    queue_capacity: usize,
}

impl InProcessBus {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            queue_capacity,
        }
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), CaptureError> {
        let msg = BusMessage {
            topic: topic.to_string(),
            key: key.map(str::to_string),
            payload,
        };

        let subs = self.subscriptions.read().unwrap();
        for sub in subs.iter().filter(|s| topic_matches(&s.pattern, topic)) {
            {
                let mut queue = sub.queue.lock().unwrap();
                if queue.len() >= sub.capacity {
                    return Err(CaptureError::PublishFailure(format!(
                        "subscription {} queue full on {}",
                        sub.group, topic
                    )));
                }
                queue.push_back(msg.clone());
            }
            sub.notify.notify_waiters();
        }
        Ok(())
    }

    fn subscribe(&self, pattern: &str, group: &str) -> Arc<dyn BusConsumer> {
        let sub = Arc::new(Subscription {
            pattern: pattern.to_string(),
            group: group.to_string(),
            queue: Mutex::new(VecDeque::new()),
            capacity: self.queue_capacity,
            notify: Notify::new(),
            paused: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            acked: AtomicU64::new(0),
        });
        self.subscriptions.write().unwrap().push(Arc::clone(&sub));
        debug!(pattern = %pattern, group = %group, "Subscription registered");
        sub
    }
}

use std::sync::Arc;

use crate::backpressure::{ApiAdmission, Bulkhead, RateLimiter};
use crate::consumer::ConsumerManager;
use crate::pipeline::TradePipeline;
use crate::publisher::Publisher;
use crate::rules::RuleStore;
use crate::seqgate::SequenceGate;
use crate::jobs::JobStore;

/// Gateway application state (shared)
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<TradePipeline>,
    pub jobs: Arc<JobStore>,
    pub admission: Arc<ApiAdmission>,
    pub limiter: Arc<RateLimiter>,
    pub bulkhead: Arc<Bulkhead>,
    pub gate: Arc<SequenceGate>,
    pub rules: Arc<RuleStore>,
    pub publisher: Arc<Publisher>,
    /// Absent when the gateway fronts a pipeline with no bus consumer
    pub consumer: Option<Arc<ConsumerManager>>,
    pub retry_after_secs: u64,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: Arc<TradePipeline>,
        jobs: Arc<JobStore>,
        admission: Arc<ApiAdmission>,
        limiter: Arc<RateLimiter>,
        bulkhead: Arc<Bulkhead>,
        gate: Arc<SequenceGate>,
        rules: Arc<RuleStore>,
        publisher: Arc<Publisher>,
        retry_after_secs: u64,
    ) -> Self {
        Self {
            pipeline,
            jobs,
            admission,
            limiter,
            bulkhead,
            gate,
            rules,
            publisher,
            consumer: None,
            retry_after_secs,
        }
    }

    /// Attach the consumer manager (call after setup)
    pub fn with_consumer(mut self, consumer: Arc<ConsumerManager>) -> Self {
        self.consumer = Some(consumer);
        self
    }
}

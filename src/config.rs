//! Engine configuration types and loader
//!
//! Every tunable carries its production default so a missing YAML key (or a
//! missing file entirely) yields a runnable engine. `DATABASE_URL` overrides
//! the configured durable-store URL.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::rules::Rule;

fn default_true() -> bool {
    true
}

// ============================================================
// SUB-CONFIGS
// ============================================================

/// Logging setup (file rotation + level + JSON switch)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub log_dir: String,
    pub log_file: String,
    /// "never" | "hourly" | "daily"
    pub rotation: String,
    pub log_level: String,
    pub use_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".into(),
            log_file: "tradecapture.log".into(),
            rotation: "daily".into(),
            log_level: "info".into(),
            use_json: false,
        }
    }
}

/// Durable-store connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Empty string means run on in-memory repositories
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            // Sized for ~100 concurrent writers at observed tx times
            max_connections: 50,
        }
    }
}

/// Partition lock lease settings (C1)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PartitionLockConfig {
    pub wait_timeout_ms: u64,
    pub hold_ttl_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for PartitionLockConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 30_000,
            hold_ttl_ms: 300_000,
            backoff_initial_ms: 50,
            backoff_max_ms: 500,
        }
    }
}

impl PartitionLockConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
    pub fn hold_ttl(&self) -> Duration {
        Duration::from_millis(self.hold_ttl_ms)
    }
}

/// Idempotency window + cache TTL (C2)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub window_hours: u64,
    pub cache_ttl_hours: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            cache_ttl_hours: 12,
        }
    }
}

impl IdempotencyConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_hours * 3600)
    }
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_hours * 3600)
    }
}

/// Sequence gate buffering (C3)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SequenceGateConfig {
    /// Max buffered out-of-order entries per partition
    pub buffer_window: usize,
    /// Seconds a buffered run may wait for its gap to fill
    pub timeout_secs: u64,
    /// Booking timestamps older than this bypass the gate (history replay)
    pub time_window_days: i64,
    /// Sweeper cadence
    pub sweep_interval_secs: u64,
}

impl Default for SequenceGateConfig {
    fn default() -> Self {
        Self {
            buffer_window: 1000,
            timeout_secs: 300,
            time_window_days: 7,
            sweep_interval_secs: 30,
        }
    }
}

/// Two-level token bucket (C11)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub global_rate_per_sec: f64,
    pub global_burst: f64,
    pub partition_rate_per_sec: f64,
    pub partition_burst: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_rate_per_sec: 100.0,
            global_burst: 200.0,
            partition_rate_per_sec: 10.0,
            partition_burst: 20.0,
        }
    }
}

/// Consumer lag control + bulkhead pools + API admission (C10/C11)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub max_lag: u64,
    pub resume_lag: u64,
    pub lag_interval_secs: u64,
    pub max_inflight: usize,
    pub consumer_workers: usize,
    pub bulkhead_groups: usize,
    pub bulkhead_pool_size: usize,
    pub bulkhead_queue_size: usize,
    pub external_pool_size: usize,
    pub external_queue_size: usize,
    pub admission_capacity: usize,
    /// Fraction of capacity at which warnings start
    pub admission_high_water: f64,
    pub retry_after_secs: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_lag: 10_000,
            resume_lag: 2_000,
            lag_interval_secs: 5,
            max_inflight: 500,
            consumer_workers: 4,
            bulkhead_groups: 10,
            bulkhead_pool_size: 10,
            bulkhead_queue_size: 100,
            external_pool_size: 20,
            external_queue_size: 200,
            admission_capacity: 1000,
            admission_high_water: 0.8,
            retry_after_secs: 5,
        }
    }
}

/// Deadlock-aware retry (C12)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeadlockRetryConfig {
    pub max_attempts: u32,
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for DeadlockRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_ms: 50,
            max_ms: 500,
            multiplier: 1.5,
        }
    }
}

/// Reference-data fan-out (C6)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub security_base_url: String,
    pub account_base_url: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            security_base_url: "http://refdata.internal/securities".into(),
            account_base_url: "http://refdata.internal/accounts".into(),
            connect_timeout_secs: 5,
            read_timeout_secs: 10,
            cache_ttl_secs: 7200,
            breaker_failure_threshold: 3,
            breaker_cooldown_secs: 60,
        }
    }
}

/// Topic layout of the messaging plane
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub input_topic: String,
    pub input_prefix: String,
    pub output_prefix: String,
    pub router_dlq_topic: String,
    pub dlq_topic: String,
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            input_topic: "trade/capture/input".into(),
            input_prefix: "trade/capture/input".into(),
            output_prefix: "trade/capture/blotter".into(),
            router_dlq_topic: "trade/capture/router/dlq".into(),
            dlq_topic: "trade/capture/dlq".into(),
            queue_capacity: 65_536,
        }
    }
}

/// One configured output subscriber (C8)
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriberConfig {
    pub name: String,
    /// "bus" | "webhook"
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Publisher fan-out (C8)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub subscribers: Vec<SubscriberConfig>,
    pub bus_retry_attempts: u32,
    pub webhook_attempts: u32,
    pub webhook_timeout_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            subscribers: vec![SubscriberConfig {
                name: "blotter-bus".into(),
                kind: "bus".into(),
                url: String::new(),
                enabled: true,
            }],
            bus_retry_attempts: 3,
            webhook_attempts: 3,
            webhook_timeout_secs: 30,
        }
    }
}

/// REST façade bind + rules seed
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_addr: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".into(),
        }
    }
}

// ============================================================
// TOP-LEVEL CONFIG
// ============================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogConfig,
    pub database: DatabaseConfig,
    pub partition_lock: PartitionLockConfig,
    pub idempotency: IdempotencyConfig,
    pub sequence_gate: SequenceGateConfig,
    pub rate_limit: RateLimitConfig,
    pub backpressure: BackpressureConfig,
    pub deadlock_retry: DeadlockRetryConfig,
    pub enrichment: EnrichmentConfig,
    pub bus: BusConfig,
    pub publisher: PublisherConfig,
    pub gateway: GatewayConfig,
    /// Boot-time rule seed; API-managed rules shadow these by id
    pub rules_seed: Vec<Rule>,
}

impl AppConfig {
    /// Load from a YAML file, falling back to defaults when the file is
    /// absent. `DATABASE_URL` overrides `database.url`.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut cfg: AppConfig = match std::fs::read_to_string(path.as_ref()) {
            Ok(raw) => serde_yaml::from_str(&raw)?,
            Err(_) => AppConfig::default(),
        };
        if let Ok(url) = std::env::var("DATABASE_URL") {
            cfg.database.url = url;
        }
        Ok(cfg)
    }
}

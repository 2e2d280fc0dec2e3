//! tradecapture - engine entry point
//!
//! Wiring order matters only in that the bus and repositories come first,
//! the pipeline owns references to everything, and the background workers
//! (router, consumers, lag monitor, sequence sweeper, idempotency purge)
//! are spawned before the gateway starts accepting traffic.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use tradecapture::backpressure::{ApiAdmission, Bulkhead, RateLimiter};
use tradecapture::blotters::{BlotterRepository, InMemoryBlotterRepository, PgBlotterRepository};
use tradecapture::bus::{InProcessBus, MessageBus};
use tradecapture::config::AppConfig;
use tradecapture::consumer::{ConsumerManager, LagMonitor};
use tradecapture::dlq::DlqEmitter;
use tradecapture::enrichment::{EnrichmentService, HttpReferenceDataSource};
use tradecapture::gateway::{self, AppState};
use tradecapture::idempotency::{
    IdempotencyRepository, IdempotencyService, InMemoryIdempotencyRepository,
    PgIdempotencyRepository,
};
use tradecapture::jobs::{InMemoryJobRepository, JobRepository, JobStore, PgJobRepository};
use tradecapture::locks::PartitionLockService;
use tradecapture::logging::init_logging;
use tradecapture::pipeline::{ApprovalService, AutoApprovalService, TradePipeline};
use tradecapture::position::{
    InMemoryPositionRepository, PgPositionRepository, PositionRepository, PositionStore,
};
use tradecapture::publisher::Publisher;
use tradecapture::retry::RetrySupervisor;
use tradecapture::router::IngressRouter;
use tradecapture::rules::{RuleStore, default_seed};
use tradecapture::schema::init_schema;
use tradecapture::seqgate::{SequenceGate, SequenceSweeper};

struct Repositories {
    idempotency: Arc<dyn IdempotencyRepository>,
    positions: Arc<dyn PositionRepository>,
    blotters: Arc<dyn BlotterRepository>,
    jobs: Arc<dyn JobRepository>,
}

async fn build_repositories(config: &AppConfig) -> anyhow::Result<Repositories> {
    if config.database.url.is_empty() {
        info!("No database configured, running on in-memory repositories");
        return Ok(Repositories {
            idempotency: Arc::new(InMemoryIdempotencyRepository::new()),
            positions: Arc::new(InMemoryPositionRepository::new()),
            blotters: Arc::new(InMemoryBlotterRepository::new()),
            jobs: Arc::new(InMemoryJobRepository::new()),
        });
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("connecting to durable store")?;
    init_schema(&pool).await.context("applying schema")?;
    info!(
        max_connections = config.database.max_connections,
        "Durable store connected"
    );

    Ok(Repositories {
        idempotency: Arc::new(PgIdempotencyRepository::new(pool.clone())),
        positions: Arc::new(PgPositionRepository::new(pool.clone())),
        blotters: Arc::new(PgBlotterRepository::new(pool.clone())),
        jobs: Arc::new(PgJobRepository::new(pool)),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".into());
    let config = AppConfig::load(&config_path).context("loading config")?;
    let _log_guard = init_logging(&config.log);
    info!(build = env!("GIT_HASH"), config = %config_path, "Starting tradecapture engine");

    let repos = build_repositories(&config).await?;

    // Messaging plane
    let bus: Arc<dyn MessageBus> = Arc::new(InProcessBus::new(config.bus.queue_capacity));
    let dlq = Arc::new(DlqEmitter::new(Arc::clone(&bus), config.bus.dlq_topic.clone()));
    let router_dlq = Arc::new(DlqEmitter::new(
        Arc::clone(&bus),
        config.bus.router_dlq_topic.clone(),
    ));

    // Core components
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let locks = Arc::new(PartitionLockService::new(config.partition_lock.clone()));
    let idempotency = Arc::new(IdempotencyService::new(
        repos.idempotency,
        config.idempotency.clone(),
    ));
    let gate = Arc::new(SequenceGate::new(config.sequence_gate.clone()));
    let enricher = Arc::new(EnrichmentService::new(
        Arc::new(HttpReferenceDataSource::new(&config.enrichment)?),
        &config.enrichment,
    ));
    let rules = Arc::new(RuleStore::new(if config.rules_seed.is_empty() {
        default_seed()
    } else {
        config.rules_seed.clone()
    }));
    let positions = Arc::new(PositionStore::new(repos.positions));
    let retry = Arc::new(RetrySupervisor::new(config.deadlock_retry.clone()));
    let publisher = Arc::new(Publisher::new(
        Arc::clone(&bus),
        Arc::clone(&dlq),
        &config.publisher,
        &config.bus.output_prefix,
    ));
    let jobs = Arc::new(JobStore::new(repos.jobs));
    let bulkhead = Arc::new(Bulkhead::new(&config.backpressure));
    let approval: Arc<dyn ApprovalService> = Arc::new(AutoApprovalService);

    let pipeline = Arc::new(TradePipeline::new(
        Arc::clone(&limiter),
        locks,
        Arc::clone(&idempotency),
        Arc::clone(&gate),
        enricher,
        Arc::clone(&rules),
        positions,
        repos.blotters,
        retry,
        Arc::clone(&publisher),
        Arc::clone(&dlq),
        Arc::clone(&jobs),
        Arc::clone(&bulkhead),
        approval,
    ));

    // Background workers
    let ingress = Arc::new(IngressRouter::new(
        Arc::clone(&bus),
        router_dlq,
        config.bus.clone(),
    ));
    tokio::spawn({
        let ingress = Arc::clone(&ingress);
        async move { ingress.run().await }
    });

    let consumer_mgr = Arc::new(ConsumerManager::new(
        Arc::clone(&bus),
        Arc::clone(&pipeline),
        Arc::clone(&dlq),
        &config.bus,
        &config.backpressure,
    ));
    tokio::spawn(Arc::clone(&consumer_mgr).run());

    let lag_monitor = LagMonitor::new(consumer_mgr.consumer(), &config.backpressure);
    tokio::spawn(async move { lag_monitor.run().await });

    let sweeper = SequenceSweeper::new(
        Arc::clone(&gate),
        Arc::clone(&dlq),
        Duration::from_secs(config.sequence_gate.sweep_interval_secs),
    );
    tokio::spawn(async move { sweeper.run().await });

    tokio::spawn({
        let idempotency = Arc::clone(&idempotency);
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                match idempotency.purge_expired().await {
                    Ok(evicted) if evicted > 0 => info!(evicted, "Purged expired idempotency records"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Idempotency purge failed"),
                }
            }
        }
    });

    // REST façade
    let admission = Arc::new(ApiAdmission::new(
        config.backpressure.admission_capacity,
        config.backpressure.admission_high_water,
    ));
    let state = AppState::new(
        pipeline,
        jobs,
        admission,
        limiter,
        bulkhead,
        gate,
        rules,
        publisher,
        config.backpressure.retry_after_secs,
    )
    .with_consumer(consumer_mgr);

    let app = gateway::router(state);
    let listener = tokio::net::TcpListener::bind(&config.gateway.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.gateway.bind_addr))?;
    info!(addr = %config.gateway.bind_addr, "Gateway listening");
    axum::serve(listener, app).await.context("serving gateway")?;
    Ok(())
}

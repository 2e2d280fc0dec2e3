//! SwapBlotter persistence
//!
//! Blotters are written once and never mutated. The trade id is the result
//! reference handed to the idempotency store.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;

use crate::error::CaptureError;
use crate::models::SwapBlotter;

#[async_trait]
pub trait BlotterRepository: Send + Sync {
    /// Insert the finished blotter. Re-inserting the same trade id is
    /// idempotent (retries after a crash between steps).
    async fn insert(&self, blotter: &SwapBlotter) -> Result<(), CaptureError>;

    async fn get_by_trade_id(&self, trade_id: &str) -> Result<Option<SwapBlotter>, CaptureError>;
}

pub struct PgBlotterRepository {
    pool: PgPool,
}

impl PgBlotterRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BlotterRepository for PgBlotterRepository {
    async fn insert(&self, blotter: &SwapBlotter) -> Result<(), CaptureError> {
        let blob = serde_json::to_value(blotter)
            .map_err(|e| CaptureError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO swap_blotters_tb (trade_id, partition_key, blob, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (trade_id) DO NOTHING
            "#,
        )
        .bind(&blotter.trade_id)
        .bind(&blotter.partition_key)
        .bind(blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_trade_id(&self, trade_id: &str) -> Result<Option<SwapBlotter>, CaptureError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT blob FROM swap_blotters_tb WHERE trade_id = $1")
                .bind(trade_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(blob,)| {
            serde_json::from_value(blob).map_err(|e| CaptureError::Serialization(e.to_string()))
        })
        .transpose()
    }
}

#[derive(Default)]
pub struct InMemoryBlotterRepository {
    blotters: DashMap<String, SwapBlotter>,
}

impl InMemoryBlotterRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.blotters.len()
    }
}

#[async_trait]
impl BlotterRepository for InMemoryBlotterRepository {
    async fn insert(&self, blotter: &SwapBlotter) -> Result<(), CaptureError> {
        self.blotters
            .entry(blotter.trade_id.clone())
            .or_insert_with(|| blotter.clone());
        Ok(())
    }

    async fn get_by_trade_id(&self, trade_id: &str) -> Result<Option<SwapBlotter>, CaptureError> {
        Ok(self.blotters.get(trade_id).map(|b| b.clone()))
    }
}

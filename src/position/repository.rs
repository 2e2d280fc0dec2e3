//! Position state persistence
//!
//! All writes use an optimistic version guard: `UPDATE ... WHERE version =
//! expected`. A zero-row update means another writer committed first and the
//! caller retries its whole step.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::{PgPool, Row};

use super::state::PositionState;
use crate::core_types::{SeqNum, Version};
use crate::error::CaptureError;

/// Durable per-partition position row
#[derive(Debug, Clone)]
pub struct PartitionStateRecord {
    pub partition_key: String,
    pub state: PositionState,
    pub state_blob: Vec<u8>,
    pub last_sequence: Option<SeqNum>,
    pub version: Version,
}

#[async_trait]
pub trait PositionRepository: Send + Sync {
    async fn get(&self, partition_key: &str) -> Result<Option<PartitionStateRecord>, CaptureError>;

    /// First write for a partition (version 1). Races surface as a unique
    /// violation mapped to VersionConflict.
    async fn insert_new(&self, record: &PartitionStateRecord) -> Result<(), CaptureError>;

    /// Versioned CAS write. Returns false when the expected version did not
    /// match.
    async fn update_if_version(
        &self,
        partition_key: &str,
        expected_version: Version,
        new_state: PositionState,
        state_blob: &[u8],
        last_sequence: Option<SeqNum>,
    ) -> Result<bool, CaptureError>;
}

// ============================================================
// POSTGRES IMPLEMENTATION
// ============================================================

pub struct PgPositionRepository {
    pool: PgPool,
}

impl PgPositionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PositionRepository for PgPositionRepository {
    async fn get(&self, partition_key: &str) -> Result<Option<PartitionStateRecord>, CaptureError> {
        let row = sqlx::query(
            r#"
            SELECT partition_key, position_state, state_blob, last_sequence, version
            FROM partition_states_tb
            WHERE partition_key = $1
            "#,
        )
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let state_id: i16 = row.get("position_state");
            let state = PositionState::from_id(state_id).ok_or_else(|| {
                CaptureError::Database(format!("unknown position state id {}", state_id))
            })?;
            Ok(PartitionStateRecord {
                partition_key: row.get("partition_key"),
                state,
                state_blob: row.get("state_blob"),
                last_sequence: row.get("last_sequence"),
                version: row.get("version"),
            })
        })
        .transpose()
    }

    async fn insert_new(&self, record: &PartitionStateRecord) -> Result<(), CaptureError> {
        let result = sqlx::query(
            r#"
            INSERT INTO partition_states_tb
                (partition_key, position_state, state_blob, last_sequence, version, updated_at)
            VALUES ($1, $2, $3, $4, 1, NOW())
            "#,
        )
        .bind(&record.partition_key)
        .bind(record.state.id())
        .bind(&record.state_blob)
        .bind(record.last_sequence)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(CaptureError::VersionConflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_if_version(
        &self,
        partition_key: &str,
        expected_version: Version,
        new_state: PositionState,
        state_blob: &[u8],
        last_sequence: Option<SeqNum>,
    ) -> Result<bool, CaptureError> {
        let result = sqlx::query(
            r#"
            UPDATE partition_states_tb
            SET position_state = $1, state_blob = $2, last_sequence = $3,
                version = version + 1, updated_at = NOW()
            WHERE partition_key = $4 AND version = $5
            "#,
        )
        .bind(new_state.id())
        .bind(state_blob)
        .bind(last_sequence)
        .bind(partition_key)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

// ============================================================
// IN-MEMORY IMPLEMENTATION
// ============================================================

#[derive(Default)]
pub struct InMemoryPositionRepository {
    records: DashMap<String, PartitionStateRecord>,
}

impl InMemoryPositionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionRepository for InMemoryPositionRepository {
    async fn get(&self, partition_key: &str) -> Result<Option<PartitionStateRecord>, CaptureError> {
        Ok(self.records.get(partition_key).map(|r| r.clone()))
    }

    async fn insert_new(&self, record: &PartitionStateRecord) -> Result<(), CaptureError> {
        let mut inserted = false;
        self.records
            .entry(record.partition_key.clone())
            .or_insert_with(|| {
                inserted = true;
                PartitionStateRecord {
                    version: 1,
                    ..record.clone()
                }
            });
        if inserted {
            Ok(())
        } else {
            Err(CaptureError::VersionConflict)
        }
    }

    async fn update_if_version(
        &self,
        partition_key: &str,
        expected_version: Version,
        new_state: PositionState,
        state_blob: &[u8],
        last_sequence: Option<SeqNum>,
    ) -> Result<bool, CaptureError> {
        match self.records.get_mut(partition_key) {
            Some(mut rec) if rec.version == expected_version => {
                rec.state = new_state;
                rec.state_blob = state_blob.to_vec();
                rec.last_sequence = last_sequence;
                rec.version += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }
}

//! Idempotency repositories
//!
//! The claim insert rides a unique-key constraint so racing workers cannot
//! both win; status writes are small single-transaction operations to keep
//! deadlock-retry granularity fine.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::{PgPool, Row};

use super::types::{ClaimOutcome, IdemStatus, IdempotencyRecord};
use crate::error::CaptureError;

#[async_trait]
pub trait IdempotencyRepository: Send + Sync {
    /// Insert a PROCESSING record under the unique-key constraint.
    async fn insert_processing(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<ClaimOutcome, CaptureError>;

    /// Fetch the live record for a key (expired records are treated as absent
    /// by the service layer, not here).
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, CaptureError>;

    /// Idempotent terminal status write. Runs in its own transaction.
    async fn mark(
        &self,
        key: &str,
        status: IdemStatus,
        result_ref: Option<&str>,
        failure_reason: Option<&str>,
    ) -> Result<(), CaptureError>;

    /// Drop records past their TTL. Returns the number evicted.
    async fn purge_expired(&self) -> Result<u64, CaptureError>;
}

// ============================================================
// POSTGRES IMPLEMENTATION
// ============================================================

pub struct PgIdempotencyRepository {
    pool: PgPool,
}

impl PgIdempotencyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<IdempotencyRecord, CaptureError> {
        let status_id: i16 = row.get("status");
        let status = IdemStatus::from_id(status_id).ok_or_else(|| {
            CaptureError::Database(format!("unknown idempotency status id {}", status_id))
        })?;
        Ok(IdempotencyRecord {
            key: row.get("key"),
            partition_key: row.get("partition_key"),
            status,
            result_ref: row.get("result_ref"),
            failure_reason: row.get("failure_reason"),
            payload_digest: row.get("payload_digest"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            expires_at: row.get("expires_at"),
        })
    }
}

#[async_trait]
impl IdempotencyRepository for PgIdempotencyRepository {
    async fn insert_processing(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<ClaimOutcome, CaptureError> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_records_tb
                (key, partition_key, status, payload_digest, created_at, updated_at, expires_at, archive_flag)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, FALSE)
            "#,
        )
        .bind(&record.key)
        .bind(&record.partition_key)
        .bind(record.status.id())
        .bind(&record.payload_digest)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(ClaimOutcome::Claimed),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Ok(ClaimOutcome::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, CaptureError> {
        let row = sqlx::query(
            r#"
            SELECT key, partition_key, status, result_ref, failure_reason,
                   payload_digest, created_at, updated_at, expires_at
            FROM idempotency_records_tb
            WHERE key = $1 AND archive_flag = FALSE
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn mark(
        &self,
        key: &str,
        status: IdemStatus,
        result_ref: Option<&str>,
        failure_reason: Option<&str>,
    ) -> Result<(), CaptureError> {
        sqlx::query(
            r#"
            UPDATE idempotency_records_tb
            SET status = $1, result_ref = $2, failure_reason = $3, updated_at = NOW()
            WHERE key = $4
            "#,
        )
        .bind(status.id())
        .bind(result_ref)
        .bind(failure_reason)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, CaptureError> {
        let result = sqlx::query(
            "DELETE FROM idempotency_records_tb WHERE expires_at <= NOW()",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================
// IN-MEMORY IMPLEMENTATION
// ============================================================

/// DashMap-backed repository. The entry API provides the same
/// first-writer-wins claim the unique constraint gives Postgres.
#[derive(Default)]
pub struct InMemoryIdempotencyRepository {
    records: DashMap<String, IdempotencyRecord>,
}

impl InMemoryIdempotencyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyRepository for InMemoryIdempotencyRepository {
    async fn insert_processing(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<ClaimOutcome, CaptureError> {
        let mut claimed = false;
        self.records
            .entry(record.key.clone())
            .or_insert_with(|| {
                claimed = true;
                record.clone()
            });
        Ok(if claimed {
            ClaimOutcome::Claimed
        } else {
            ClaimOutcome::AlreadyExists
        })
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, CaptureError> {
        Ok(self.records.get(key).map(|r| r.clone()))
    }

    async fn mark(
        &self,
        key: &str,
        status: IdemStatus,
        result_ref: Option<&str>,
        failure_reason: Option<&str>,
    ) -> Result<(), CaptureError> {
        if let Some(mut rec) = self.records.get_mut(key) {
            rec.status = status;
            rec.result_ref = result_ref.map(str::to_string);
            rec.failure_reason = failure_reason.map(str::to_string);
            rec.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, CaptureError> {
        let now = Utc::now();
        let before = self.records.len();
        self.records.retain(|_, rec| !rec.is_expired(now));
        Ok((before - self.records.len()) as u64)
    }
}

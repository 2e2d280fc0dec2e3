//! Async job lifecycle
//!
//! Jobs track capture requests accepted in async mode. Transitions:
//! PENDING -> PROCESSING -> {COMPLETED, FAILED}; CANCELLED only from
//! PENDING. A terminal transition with a callback URL enqueues a webhook
//! POST; webhook failure never touches the job state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sqlx::{PgPool, Row};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::CaptureError;
use crate::publisher::post_json_with_retry;

// ============================================================
// MODEL
// ============================================================

/// Job status. IDs are designed for SMALLINT storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum JobState {
    Pending = 0,
    Processing = 10,
    Completed = 20,
    Failed = -10,
    Cancelled = -20,
}

impl JobState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(JobState::Pending),
            10 => Some(JobState::Processing),
            20 => Some(JobState::Completed),
            -10 => Some(JobState::Failed),
            -20 => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Processing => "PROCESSING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub trade_id: String,
    pub state: JobState,
    pub progress: i16,
    pub result_ref: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub callback_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    fn new(trade_id: &str, callback_url: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            trade_id: trade_id.to_string(),
            state: JobState::Pending,
            progress: 0,
            result_ref: None,
            error_code: None,
            error_message: None,
            callback_url,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Webhook body for terminal notifications.
///
/// The error block never carries nulls on the wire: a missing code
/// serializes as "UNKNOWN" and a missing message as the empty string.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCallback {
    pub job_id: Uuid,
    pub trade_id: String,
    pub status: JobState,
    pub result: Option<String>,
    pub error: Option<JobCallbackError>,
}

#[derive(Debug, Serialize)]
pub struct JobCallbackError {
    pub code: String,
    pub message: String,
}

impl JobCallback {
    pub fn from_record(record: &JobRecord) -> Self {
        let error = match record.state {
            JobState::Failed => Some(JobCallbackError {
                code: record.error_code.clone().unwrap_or_else(|| "UNKNOWN".into()),
                message: record.error_message.clone().unwrap_or_default(),
            }),
            _ => None,
        };
        Self {
            job_id: record.job_id,
            trade_id: record.trade_id.clone(),
            status: record.state,
            result: record.result_ref.clone(),
            error,
        }
    }
}

// ============================================================
// REPOSITORY
// ============================================================

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert(&self, record: &JobRecord) -> Result<(), CaptureError>;
    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, CaptureError>;

    /// CAS state update; false when the current state did not match.
    async fn update_state_if(
        &self,
        job_id: Uuid,
        expected: JobState,
        new_state: JobState,
        progress: i16,
        result_ref: Option<&str>,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool, CaptureError>;
}

pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn insert(&self, record: &JobRecord) -> Result<(), CaptureError> {
        sqlx::query(
            r#"
            INSERT INTO job_status_tb
                (job_id, trade_id, status, progress, callback_url, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.job_id)
        .bind(&record.trade_id)
        .bind(record.state.id())
        .bind(record.progress)
        .bind(&record.callback_url)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, CaptureError> {
        let row = sqlx::query(
            r#"
            SELECT job_id, trade_id, status, progress, result_ref, error_code,
                   error_message, callback_url, created_at, updated_at
            FROM job_status_tb
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let status_id: i16 = row.get("status");
            let state = JobState::from_id(status_id).ok_or_else(|| {
                CaptureError::Database(format!("unknown job status id {}", status_id))
            })?;
            Ok(JobRecord {
                job_id: row.get("job_id"),
                trade_id: row.get("trade_id"),
                state,
                progress: row.get("progress"),
                result_ref: row.get("result_ref"),
                error_code: row.get("error_code"),
                error_message: row.get("error_message"),
                callback_url: row.get("callback_url"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }

    async fn update_state_if(
        &self,
        job_id: Uuid,
        expected: JobState,
        new_state: JobState,
        progress: i16,
        result_ref: Option<&str>,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool, CaptureError> {
        let result = sqlx::query(
            r#"
            UPDATE job_status_tb
            SET status = $1, progress = $2, result_ref = $3, error_code = $4,
                error_message = $5, updated_at = NOW()
            WHERE job_id = $6 AND status = $7
            "#,
        )
        .bind(new_state.id())
        .bind(progress)
        .bind(result_ref)
        .bind(error_code)
        .bind(error_message)
        .bind(job_id)
        .bind(expected.id())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Default)]
pub struct InMemoryJobRepository {
    records: DashMap<Uuid, JobRecord>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert(&self, record: &JobRecord) -> Result<(), CaptureError> {
        self.records.insert(record.job_id, record.clone());
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, CaptureError> {
        Ok(self.records.get(&job_id).map(|r| r.clone()))
    }

    async fn update_state_if(
        &self,
        job_id: Uuid,
        expected: JobState,
        new_state: JobState,
        progress: i16,
        result_ref: Option<&str>,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool, CaptureError> {
        match self.records.get_mut(&job_id) {
            Some(mut rec) if rec.state == expected => {
                rec.state = new_state;
                rec.progress = progress;
                rec.result_ref = result_ref.map(str::to_string);
                rec.error_code = error_code.map(str::to_string);
                rec.error_message = error_message.map(str::to_string);
                rec.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ============================================================
// SERVICE
// ============================================================

pub struct JobStore {
    repo: Arc<dyn JobRepository>,
    http: reqwest::Client,
    webhook_retries: AtomicU64,
}

impl JobStore {
    pub fn new(repo: Arc<dyn JobRepository>) -> Self {
        Self {
            repo,
            http: reqwest::Client::new(),
            webhook_retries: AtomicU64::new(0),
        }
    }

    pub async fn create(
        &self,
        trade_id: &str,
        callback_url: Option<String>,
    ) -> Result<JobRecord, CaptureError> {
        let record = JobRecord::new(trade_id, callback_url);
        self.repo.insert(&record).await?;
        info!(job_id = %record.job_id, trade_id = %trade_id, "Job accepted");
        Ok(record)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, CaptureError> {
        self.repo.get(job_id).await
    }

    /// PENDING -> PROCESSING. False when the job was cancelled first.
    pub async fn mark_processing(&self, job_id: Uuid) -> Result<bool, CaptureError> {
        self.repo
            .update_state_if(job_id, JobState::Pending, JobState::Processing, 10, None, None, None)
            .await
    }

    pub async fn complete(&self, job_id: Uuid, result_ref: &str) -> Result<(), CaptureError> {
        let updated = self
            .repo
            .update_state_if(
                job_id,
                JobState::Processing,
                JobState::Completed,
                100,
                Some(result_ref),
                None,
                None,
            )
            .await?;
        if updated {
            self.fire_callback(job_id).await;
        }
        Ok(())
    }

    pub async fn fail(&self, job_id: Uuid, code: &str, message: &str) -> Result<(), CaptureError> {
        let updated = self
            .repo
            .update_state_if(
                job_id,
                JobState::Processing,
                JobState::Failed,
                100,
                None,
                Some(code),
                Some(message),
            )
            .await?;
        if updated {
            self.fire_callback(job_id).await;
        }
        Ok(())
    }

    /// Cancellation is honored only in PENDING.
    pub async fn cancel(&self, job_id: Uuid) -> Result<JobRecord, CaptureError> {
        let record = self
            .repo
            .get(job_id)
            .await?
            .ok_or_else(|| CaptureError::JobNotFound(job_id.to_string()))?;

        let cancelled = self
            .repo
            .update_state_if(job_id, JobState::Pending, JobState::Cancelled, 0, None, None, None)
            .await?;
        if !cancelled {
            return Err(CaptureError::JobNotCancellable(record.state.to_string()));
        }

        info!(job_id = %job_id, "Job cancelled");
        self.repo
            .get(job_id)
            .await?
            .ok_or_else(|| CaptureError::JobNotFound(job_id.to_string()))
    }

    async fn fire_callback(&self, job_id: Uuid) {
        let Ok(Some(record)) = self.repo.get(job_id).await else {
            return;
        };
        let Some(url) = record.callback_url.clone() else {
            return;
        };

        let callback = JobCallback::from_record(&record);
        if let Err(e) =
            post_json_with_retry(&self.http, &url, &callback, 3, &self.webhook_retries).await
        {
            // Webhook failure never affects the job state
            error!(job_id = %job_id, url = %url, error = %e, "Job callback delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> JobStore {
        JobStore::new(Arc::new(InMemoryJobRepository::new()))
    }

    #[tokio::test]
    async fn test_lifecycle_to_completed() {
        let store = store();
        let job = store.create("T-1", None).await.unwrap();
        assert_eq!(job.state, JobState::Pending);

        assert!(store.mark_processing(job.job_id).await.unwrap());
        store.complete(job.job_id, "T-1").await.unwrap();

        let record = store.get(job.job_id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.progress, 100);
        assert_eq!(record.result_ref.as_deref(), Some("T-1"));
    }

    #[tokio::test]
    async fn test_cancel_only_in_pending() {
        let store = store();
        let job = store.create("T-1", None).await.unwrap();
        store.mark_processing(job.job_id).await.unwrap();

        let err = store.cancel(job.job_id).await.unwrap_err();
        assert!(matches!(err, CaptureError::JobNotCancellable(_)));

        let job2 = store.create("T-2", None).await.unwrap();
        let cancelled = store.cancel(job2.job_id).await.unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_job_cannot_start_processing() {
        let store = store();
        let job = store.create("T-1", None).await.unwrap();
        store.cancel(job.job_id).await.unwrap();
        assert!(!store.mark_processing(job.job_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_job_id() {
        let store = store();
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
        assert!(matches!(
            store.cancel(Uuid::new_v4()).await,
            Err(CaptureError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_callback_error_block_never_null() {
        let mut record = JobRecord::new("T-1", None);
        record.state = JobState::Failed;
        record.error_code = None;
        record.error_message = None;

        let callback = JobCallback::from_record(&record);
        let json = serde_json::to_value(&callback).unwrap();
        assert_eq!(json["error"]["code"], "UNKNOWN");
        assert_eq!(json["error"]["message"], "");
    }

    #[test]
    fn test_callback_completed_has_no_error_block() {
        let mut record = JobRecord::new("T-1", None);
        record.state = JobState::Completed;
        record.result_ref = Some("T-1".into());

        let callback = JobCallback::from_record(&record);
        let json = serde_json::to_value(&callback).unwrap();
        assert!(json["error"].is_null());
        assert_eq!(json["result"], "T-1");
        assert_eq!(json["status"], "COMPLETED");
    }
}

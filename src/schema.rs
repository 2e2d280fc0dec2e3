//! Durable-store schema
//!
//! Applied idempotently at startup when a database URL is configured. Every
//! table carries `archive_flag` and a date-based partitioning discriminator
//! (`created_date`) for cold-storage tiering; archival itself is operated
//! outside the engine.

use sqlx::PgPool;

use crate::error::CaptureError;

pub const CREATE_IDEMPOTENCY_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_records_tb (
    key             TEXT PRIMARY KEY,
    partition_key   TEXT NOT NULL,
    status          SMALLINT NOT NULL,
    result_ref      TEXT,
    failure_reason  TEXT,
    payload_digest  TEXT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    expires_at      TIMESTAMPTZ NOT NULL,
    archive_flag    BOOLEAN NOT NULL DEFAULT FALSE,
    created_date    DATE NOT NULL DEFAULT CURRENT_DATE
);
CREATE INDEX IF NOT EXISTS idx_idempotency_partition_status
    ON idempotency_records_tb (partition_key, status)
    WHERE archive_flag = FALSE;
"#;

pub const CREATE_PARTITION_STATES: &str = r#"
CREATE TABLE IF NOT EXISTS partition_states_tb (
    partition_key   TEXT PRIMARY KEY,
    position_state  SMALLINT NOT NULL,
    state_blob      BYTEA NOT NULL DEFAULT ''::bytea,
    last_sequence   BIGINT,
    version         BIGINT NOT NULL DEFAULT 1,
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    archive_flag    BOOLEAN NOT NULL DEFAULT FALSE,
    created_date    DATE NOT NULL DEFAULT CURRENT_DATE
);
"#;

pub const CREATE_SWAP_BLOTTERS: &str = r#"
CREATE TABLE IF NOT EXISTS swap_blotters_tb (
    trade_id        TEXT PRIMARY KEY,
    partition_key   TEXT NOT NULL,
    blob            JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    archive_flag    BOOLEAN NOT NULL DEFAULT FALSE,
    created_date    DATE NOT NULL DEFAULT CURRENT_DATE
);
CREATE INDEX IF NOT EXISTS idx_swap_blotters_partition
    ON swap_blotters_tb (partition_key);
"#;

pub const CREATE_JOB_STATUS: &str = r#"
CREATE TABLE IF NOT EXISTS job_status_tb (
    job_id          UUID PRIMARY KEY,
    trade_id        TEXT NOT NULL,
    status          SMALLINT NOT NULL,
    progress        SMALLINT NOT NULL DEFAULT 0,
    result_ref      TEXT,
    error_code      TEXT,
    error_message   TEXT,
    callback_url    TEXT,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    archive_flag    BOOLEAN NOT NULL DEFAULT FALSE,
    created_date    DATE NOT NULL DEFAULT CURRENT_DATE
);
CREATE INDEX IF NOT EXISTS idx_job_status_trade ON job_status_tb (trade_id);
"#;

/// Apply the schema. Statements are idempotent.
pub async fn init_schema(pool: &PgPool) -> Result<(), CaptureError> {
    for ddl in [
        CREATE_IDEMPOTENCY_RECORDS,
        CREATE_PARTITION_STATES,
        CREATE_SWAP_BLOTTERS,
        CREATE_JOB_STATUS,
    ] {
        for statement in ddl.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(pool).await?;
        }
    }
    Ok(())
}

//! PostgreSQL mutation logs
//!
//! Each directory owns any number of log sources. Watermarks are assigned
//! per `(directory_id, log_id)` under a row lock on the log's head counter:
//!
//! ```sql
//! BEGIN;
//! SELECT head FROM mutation_logs
//!     WHERE directory_id = $1 AND log_id = $2 FOR UPDATE;
//! INSERT INTO mutations (...) VALUES (..., head + 1, ...);
//! UPDATE mutation_logs SET head = head + 1 ...;
//! COMMIT;
//! ```
//!
//! so watermarks within one log are gap-free and strictly increasing.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use tracing::instrument;

use crate::domain::{DirectoryId, LogId, LogMessage, Watermark};
use crate::infra::{LogReader, MutationQueue, Result, SequencerError};

/// PostgreSQL-backed mutation logs
#[derive(Clone)]
pub struct PgMutationLog {
    pool: PgPool,
}

impl PgMutationLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create `mutation_logs` and `mutations` if missing
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mutation_logs (
                directory_id VARCHAR(64) NOT NULL,
                log_id BIGINT NOT NULL,
                head BIGINT NOT NULL DEFAULT 0,
                writable BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (directory_id, log_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mutations (
                directory_id VARCHAR(64) NOT NULL,
                log_id BIGINT NOT NULL,
                watermark BIGINT NOT NULL,
                payload BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (directory_id, log_id, watermark)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Register a log source; no-op if it exists
    pub async fn create_log(&self, directory_id: &DirectoryId, log_id: LogId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mutation_logs (directory_id, log_id)
            VALUES ($1, $2)
            ON CONFLICT (directory_id, log_id) DO NOTHING
            "#,
        )
        .bind(directory_id.as_str())
        .bind(log_id.as_i64())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stop accepting writes on a log. Its history stays readable.
    pub async fn set_writable(
        &self,
        directory_id: &DirectoryId,
        log_id: LogId,
        writable: bool,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE mutation_logs SET writable = $3
            WHERE directory_id = $1 AND log_id = $2
            "#,
        )
        .bind(directory_id.as_str())
        .bind(log_id.as_i64())
        .bind(writable)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(SequencerError::InvalidArgument(format!(
                "unknown log {log_id} in directory {directory_id}"
            )));
        }
        Ok(())
    }

    async fn lock_head(
        tx: &mut Transaction<'_, Postgres>,
        directory_id: &DirectoryId,
        log_id: LogId,
    ) -> Result<(u64, bool)> {
        let row: Option<(i64, bool)> = sqlx::query_as(
            r#"
            SELECT head, writable
            FROM mutation_logs
            WHERE directory_id = $1 AND log_id = $2
            FOR UPDATE
            "#,
        )
        .bind(directory_id.as_str())
        .bind(log_id.as_i64())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|(head, writable)| (head as u64, writable))
            .ok_or_else(|| {
                SequencerError::InvalidArgument(format!(
                    "unknown log {log_id} in directory {directory_id}"
                ))
            })
    }
}

fn watermark_param(watermark: Watermark) -> i64 {
    i64::try_from(watermark).unwrap_or(i64::MAX)
}

#[async_trait]
impl MutationQueue for PgMutationLog {
    #[instrument(skip(self, payload), fields(directory_id = %directory_id, log_id = %log_id, payload_len = payload.len()))]
    async fn send(
        &self,
        directory_id: &DirectoryId,
        log_id: LogId,
        payload: Vec<u8>,
    ) -> Result<Watermark> {
        let mut tx = self.pool.begin().await?;

        let (head, writable) = Self::lock_head(&mut tx, directory_id, log_id).await?;
        if !writable {
            return Err(SequencerError::FailedPrecondition(format!(
                "log {log_id} is not writable"
            )));
        }
        let watermark = head + 1;

        sqlx::query(
            r#"
            INSERT INTO mutations (directory_id, log_id, watermark, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(directory_id.as_str())
        .bind(log_id.as_i64())
        .bind(watermark as i64)
        .bind(&payload)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE mutation_logs SET head = $3
            WHERE directory_id = $1 AND log_id = $2
            "#,
        )
        .bind(directory_id.as_str())
        .bind(log_id.as_i64())
        .bind(watermark as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(watermark)
    }
}

#[async_trait]
impl LogReader for PgMutationLog {
    async fn list_sources(&self, directory_id: &DirectoryId) -> Result<Vec<LogId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT log_id FROM mutation_logs
            WHERE directory_id = $1 AND writable
            ORDER BY log_id ASC
            "#,
        )
        .bind(directory_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| LogId::new(id)).collect())
    }

    async fn high_watermark(
        &self,
        directory_id: &DirectoryId,
        log_id: LogId,
        after: Watermark,
        max_items: u64,
    ) -> Result<(u64, Watermark)> {
        if max_items == 0 {
            return Ok((0, after));
        }

        let (count, high): (i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MAX(watermark) FROM (
                SELECT watermark FROM mutations
                WHERE directory_id = $1 AND log_id = $2 AND watermark > $3
                ORDER BY watermark ASC
                LIMIT $4
            ) AS window_rows
            "#,
        )
        .bind(directory_id.as_str())
        .bind(log_id.as_i64())
        .bind(watermark_param(after))
        .bind(watermark_param(max_items))
        .fetch_one(&self.pool)
        .await?;

        Ok((count as u64, high.map(|h| h as u64).unwrap_or(after)))
    }

    async fn read_range(
        &self,
        directory_id: &DirectoryId,
        log_id: LogId,
        low: Watermark,
        high: Watermark,
        page_size: u64,
    ) -> Result<Vec<LogMessage>> {
        let rows: Vec<(i64, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT watermark, payload FROM mutations
            WHERE directory_id = $1 AND log_id = $2
              AND watermark > $3 AND watermark <= $4
            ORDER BY watermark ASC
            LIMIT $5
            "#,
        )
        .bind(directory_id.as_str())
        .bind(log_id.as_i64())
        .bind(watermark_param(low))
        .bind(watermark_param(high))
        .bind(watermark_param(page_size))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(watermark, payload)| LogMessage::new(log_id, watermark as u64, payload))
            .collect())
    }
}

//! PostgreSQL batch definition store
//!
//! One row per `(directory_id, revision)`. The stored `sources` column holds
//! the canonical JSON of `MapMetadata`, so the duplicate-write check is a
//! byte comparison.
//!
//! ```sql
//! INSERT INTO batch_definitions (directory_id, revision, sources)
//!     VALUES ($1, $2, $3)
//!     ON CONFLICT (directory_id, revision) DO NOTHING;
//! -- no row inserted: compare with the stored definition
//! ```

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tracing::instrument;

use crate::domain::{DirectoryId, MapMetadata};
use crate::infra::{BatchStore, Result, SequencerError};

/// PostgreSQL-backed batch store
#[derive(Clone)]
pub struct PgBatchStore {
    pool: PgPool,
}

impl PgBatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `batch_definitions` table if missing
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batch_definitions (
                directory_id VARCHAR(64) NOT NULL,
                revision BIGINT NOT NULL,
                sources BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (directory_id, revision)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Highest defined revision for a directory, if any
    pub async fn latest_revision(&self, directory_id: &DirectoryId) -> Result<Option<u64>> {
        let row: (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT MAX(revision) FROM batch_definitions WHERE directory_id = $1
            "#,
        )
        .bind(directory_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0.map(|r| r as u64))
    }
}

fn revision_param(revision: u64) -> Result<i64> {
    i64::try_from(revision)
        .map_err(|_| SequencerError::InvalidArgument(format!("revision {revision} out of range")))
}

#[async_trait]
impl BatchStore for PgBatchStore {
    #[instrument(skip(self, meta), fields(directory_id = %directory_id))]
    async fn write_batch_sources(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
        meta: &MapMetadata,
    ) -> Result<()> {
        if meta.revision != revision {
            return Err(SequencerError::InvalidArgument(format!(
                "metadata is for revision {}, not {revision}",
                meta.revision
            )));
        }
        meta.validate().map_err(SequencerError::InvalidArgument)?;

        let bytes = meta.to_canonical_bytes();
        let rev = revision_param(revision)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO batch_definitions (directory_id, revision, sources)
            VALUES ($1, $2, $3)
            ON CONFLICT (directory_id, revision) DO NOTHING
            "#,
        )
        .bind(directory_id.as_str())
        .bind(rev)
        .bind(&bytes)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(());
        }

        let (stored,): (Vec<u8>,) = sqlx::query_as(
            r#"
            SELECT sources FROM batch_definitions
            WHERE directory_id = $1 AND revision = $2
            "#,
        )
        .bind(directory_id.as_str())
        .bind(rev)
        .fetch_one(&self.pool)
        .await?;

        if stored == bytes {
            tracing::debug!("Batch definition already present with identical sources");
            Ok(())
        } else {
            Err(SequencerError::BatchConflict {
                directory_id: directory_id.clone(),
                revision,
            })
        }
    }

    #[instrument(skip(self), fields(directory_id = %directory_id))]
    async fn read_batch(&self, directory_id: &DirectoryId, revision: u64) -> Result<MapMetadata> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            r#"
            SELECT sources FROM batch_definitions
            WHERE directory_id = $1 AND revision = $2
            "#,
        )
        .bind(directory_id.as_str())
        .bind(revision_param(revision)?)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((bytes,)) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(SequencerError::BatchNotFound {
                directory_id: directory_id.clone(),
                revision,
            }),
        }
    }
}

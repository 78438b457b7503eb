//! Postgres-backed outbox store.
//!
//! ## Claiming
//!
//! `claim_batch` selects pending rows with `FOR UPDATE SKIP LOCKED` and moves
//! them to `processing` inside the same transaction. A concurrent claimer
//! skips the locked rows instead of blocking on them, and once the transaction
//! commits the rows are no longer `pending`, so no job is handed out twice.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key / check violation) | `23503`, `23514` | `Storage` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` |
//! | Other | N/A | `Storage` |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use pdpsync_core::{Job, JobId, JobPayload, JobStatus, PayloadColumns, SchemaId, StatusUpdate};

use super::store::{JobStore, JobStoreError, ReferentStore};

const MIGRATION: &str = include_str!("../../migrations/0001_pdp_jobs.sql");

/// Outbox store over a shared `PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the job table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Insert a job inside the caller's transaction.
    ///
    /// The enqueue path calls this in the same transaction that writes the
    /// job's Schema or Application row.
    #[instrument(skip(tx, job), fields(job_id = %job.id, job_type = %job.type_name()), err)]
    pub async fn enqueue_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
    ) -> Result<(), JobStoreError> {
        let columns = job.payload.to_columns();
        sqlx::query(
            r#"
            INSERT INTO pdp_jobs (
                job_id, job_type, schema_id, sdl, application_id,
                selected_fields, grant_duration, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            "#,
        )
        .bind(job.id.as_str())
        .bind(&columns.job_type)
        .bind(&columns.schema_id)
        .bind(&columns.sdl)
        .bind(&columns.application_id)
        .bind(&columns.selected_fields)
        .bind(&columns.grant_duration)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| match map_sqlx_error("enqueue", e) {
            JobStoreError::Conflict(_) => JobStoreError::AlreadyExists(job.id.clone()),
            other => other,
        })?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self), err)]
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let rows = sqlx::query(
            r#"
            SELECT
                job_id, job_type, schema_id, sdl, application_id, selected_fields,
                grant_duration, status, error, created_at, updated_at, processed_at
            FROM pdp_jobs
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        if rows.is_empty() {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            return Ok(Vec::new());
        }

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let job = JobRow::from_row(&row)
                .map_err(|e| JobStoreError::Decode(e.to_string()))?
                .into_job()?;
            jobs.push(job);
        }

        let ids: Vec<String> = jobs.iter().map(|job| job.id.to_string()).collect();
        let stamped: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            UPDATE pdp_jobs
            SET status = 'processing', updated_at = NOW()
            WHERE job_id = ANY($1)
            RETURNING job_id, updated_at
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;
        let stamped: HashMap<String, DateTime<Utc>> = stamped.into_iter().collect();

        for job in &mut jobs {
            let claimed_at = stamped.get(job.id.as_str()).copied().ok_or_else(|| {
                JobStoreError::Conflict(format!("job {} was not moved to processing", job.id))
            })?;
            job.mark_processing(claimed_at)
                .map_err(|e| JobStoreError::Conflict(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        tracing::debug!(claimed = jobs.len(), "claimed pending jobs");
        Ok(jobs)
    }

    #[instrument(skip(self), fields(threshold_secs = threshold.as_secs()), err)]
    async fn sweep_stuck(&self, threshold: Duration) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pdp_jobs
            SET status = 'pending', updated_at = NOW()
            WHERE status = 'processing'
              AND updated_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(threshold.as_secs_f64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("sweep_stuck", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, update), fields(job_id = %job_id, status = %update.status), err)]
    async fn update_status(
        &self,
        job_id: &JobId,
        update: &StatusUpdate,
    ) -> Result<(), JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let exists = sqlx::query("SELECT job_id FROM pdp_jobs WHERE job_id = $1 FOR UPDATE")
            .bind(job_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_status", e))?;

        if exists.is_none() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(JobStoreError::NotFound(job_id.clone()));
        }

        sqlx::query(
            r#"
            UPDATE pdp_jobs
            SET status = $2, error = $3, processed_at = $4, updated_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_str())
        .bind(update.status.as_str())
        .bind(&update.error)
        .bind(update.processed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_status", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                job_id, job_type, schema_id, sdl, application_id, selected_fields,
                grant_duration, status, error, created_at, updated_at, processed_at
            FROM pdp_jobs
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| {
            JobRow::from_row(&row)
                .map_err(|e| JobStoreError::Decode(e.to_string()))?
                .into_job()
        })
        .transpose()
    }
}

#[async_trait]
impl ReferentStore for PostgresJobStore {
    #[instrument(skip(self), fields(schema_id = %schema_id), err)]
    async fn delete_schema(&self, schema_id: &SchemaId) -> Result<u64, JobStoreError> {
        let result = sqlx::query("DELETE FROM schemas WHERE schema_id = $1")
            .bind(schema_id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_schema", e))?;
        Ok(result.rows_affected())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::Conflict(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::Io(e) => JobStoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

struct JobRow {
    job_id: String,
    job_type: String,
    schema_id: Option<String>,
    sdl: Option<String>,
    application_id: Option<String>,
    selected_fields: Option<String>,
    grant_duration: Option<String>,
    status: String,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            job_id: row.try_get("job_id")?,
            job_type: row.try_get("job_type")?,
            schema_id: row.try_get("schema_id")?,
            sdl: row.try_get("sdl")?,
            application_id: row.try_get("application_id")?,
            selected_fields: row.try_get("selected_fields")?,
            grant_duration: row.try_get("grant_duration")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

impl JobRow {
    fn into_job(self) -> Result<Job, JobStoreError> {
        let status = self
            .status
            .parse::<JobStatus>()
            .map_err(|e| JobStoreError::Decode(format!("job {}: {}", self.job_id, e)))?;

        let payload = JobPayload::from_columns(PayloadColumns {
            job_type: self.job_type,
            schema_id: self.schema_id,
            sdl: self.sdl,
            application_id: self.application_id,
            selected_fields: self.selected_fields,
            grant_duration: self.grant_duration,
        });

        Ok(Job {
            id: JobId::from_raw(self.job_id),
            payload,
            status,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            processed_at: self.processed_at,
        })
    }
}

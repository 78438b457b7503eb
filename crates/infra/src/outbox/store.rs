//! Job table and domain-row access used by the worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use pdpsync_core::{Job, JobId, SchemaId, StatusUpdate};

/// Job record store.
///
/// Claim ownership lives here: a job in `processing` is owned by whichever
/// worker claimed it, and no in-process lock is involved.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Claim up to `limit` pending jobs, oldest first.
    ///
    /// Selection and the move to `processing` happen in one transaction, and
    /// rows locked by a concurrent claimer are skipped rather than waited on.
    /// Returned jobs are already in `processing`.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Move `processing` jobs not updated for longer than `threshold` back to
    /// `pending`. Returns the number of jobs released.
    async fn sweep_stuck(&self, threshold: Duration) -> Result<u64, JobStoreError>;

    /// Record the outcome of an attempt in its own transaction.
    async fn update_status(&self, job_id: &JobId, update: &StatusUpdate)
    -> Result<(), JobStoreError>;

    /// Load a job by ID.
    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError>;
}

/// Access to the domain rows jobs refer to.
///
/// The worker only ever deletes a referent, and only as compensation.
#[async_trait]
pub trait ReferentStore: Send + Sync {
    /// Delete a Schema row, returning the number of rows affected.
    async fn delete_schema(&self, schema_id: &SchemaId) -> Result<u64, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("failed to decode job row: {0}")]
    Decode(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).claim_batch(limit).await
    }

    async fn sweep_stuck(&self, threshold: Duration) -> Result<u64, JobStoreError> {
        (**self).sweep_stuck(threshold).await
    }

    async fn update_status(
        &self,
        job_id: &JobId,
        update: &StatusUpdate,
    ) -> Result<(), JobStoreError> {
        (**self).update_status(job_id, update).await
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }
}

#[async_trait]
impl<T: ReferentStore + ?Sized> ReferentStore for Arc<T> {
    async fn delete_schema(&self, schema_id: &SchemaId) -> Result<u64, JobStoreError> {
        (**self).delete_schema(schema_id).await
    }
}

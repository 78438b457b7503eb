//! Type-specific undo of a job's local side effect.

use pdpsync_core::{ApplicationId, Job, JobId, JobPayload, JobType, SchemaId};

use super::store::{JobStoreError, ReferentStore};

/// What compensation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// The job's Schema row was deleted.
    SchemaDeleted(SchemaId),
    /// Nothing to undo; the referent is left in place.
    NotRequired(ApplicationId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompensationError {
    #[error("schema not found for compensation: {0}")]
    SchemaNotFound(SchemaId),
    #[error("unexpected row count {rows} deleting schema {schema_id}")]
    UnexpectedRowCount { schema_id: SchemaId, rows: u64 },
    #[error("unknown job type for compensation: {0}")]
    UnknownJobType(String),
    #[error("cannot compensate job {job_id}: {job_type} payload is incomplete")]
    IncompletePayload { job_id: JobId, job_type: String },
    #[error("failed to delete schema: {0}")]
    Store(#[from] JobStoreError),
}

/// Compensation policy, one rule per job type:
///
/// - `create_policy_metadata`: delete the Schema row; exactly one row must go
/// - `update_allow_list`: no-op, an Application without grants is a safe state
/// - anything unrecognized: fails, so the job is escalated
#[derive(Debug, Clone)]
pub struct Compensator<R> {
    referents: R,
}

impl<R: ReferentStore> Compensator<R> {
    pub fn new(referents: R) -> Self {
        Self { referents }
    }

    pub async fn compensate(&self, job: &Job) -> Result<Compensation, CompensationError> {
        match &job.payload {
            JobPayload::CreatePolicyMetadata(payload) => {
                let schema_id = &payload.schema_id;
                match self.referents.delete_schema(schema_id).await? {
                    1 => {
                        tracing::info!(job_id = %job.id, schema_id = %schema_id, "compensated by deleting schema");
                        Ok(Compensation::SchemaDeleted(schema_id.clone()))
                    }
                    0 => Err(CompensationError::SchemaNotFound(schema_id.clone())),
                    rows => Err(CompensationError::UnexpectedRowCount {
                        schema_id: schema_id.clone(),
                        rows,
                    }),
                }
            }
            JobPayload::UpdateAllowList(payload) => {
                tracing::info!(
                    job_id = %job.id,
                    application_id = %payload.application_id,
                    "compensation not needed for update_allow_list, application remains"
                );
                Ok(Compensation::NotRequired(payload.application_id.clone()))
            }
            JobPayload::Unrecognized(payload) => match payload.job_type.parse::<JobType>() {
                Ok(_) => Err(CompensationError::IncompletePayload {
                    job_id: job.id.clone(),
                    job_type: payload.job_type.clone(),
                }),
                Err(_) => Err(CompensationError::UnknownJobType(payload.job_type.clone())),
            },
        }
    }
}

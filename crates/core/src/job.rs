//! Outbox job record and its typed payload.
//!
//! A job row is written by the enqueue path in the same local transaction as
//! the Schema or Application row it protects. The worker decodes the row's
//! nullable payload columns into [`JobPayload`]; rows it cannot interpret are
//! kept as [`JobPayload::Unrecognized`] so they still flow through
//! compensation and alerting instead of being dropped.

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{ApplicationId, JobId, SchemaId};
use crate::status::JobStatus;

/// Job type column values.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    CreatePolicyMetadata,
    UpdateAllowList,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::CreatePolicyMetadata => "create_policy_metadata",
            JobType::UpdateAllowList => "update_allow_list",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_policy_metadata" => Ok(JobType::CreatePolicyMetadata),
            "update_allow_list" => Ok(JobType::UpdateAllowList),
            other => Err(DomainError::UnknownJobType(other.to_string())),
        }
    }
}

/// How long an allow-list grant stays active.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GrantDuration {
    #[default]
    #[serde(rename = "30d")]
    OneMonth,
    #[serde(rename = "365d")]
    OneYear,
}

impl GrantDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantDuration::OneMonth => "30d",
            GrantDuration::OneYear => "365d",
        }
    }
}

impl FromStr for GrantDuration {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "30d" => Ok(GrantDuration::OneMonth),
            "365d" => Ok(GrantDuration::OneYear),
            other => Err(DomainError::validation(format!(
                "invalid grant duration: {other}"
            ))),
        }
    }
}

/// One field an application is granted access to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedFieldRecord {
    pub field_name: String,
    pub schema_id: String,
}

/// Payload of a `create_policy_metadata` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMetadataCreate {
    pub schema_id: SchemaId,
    pub sdl: String,
}

/// Payload of an `update_allow_list` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowListUpdate {
    pub application_id: ApplicationId,
    pub selected_fields: Vec<SelectedFieldRecord>,
    pub grant_duration: GrantDuration,
}

/// A job row the worker could not decode into a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnrecognizedPayload {
    /// Raw job type column.
    pub job_type: String,
    /// Why decoding failed; recorded as the job's failure reason.
    pub reason: String,
    pub schema_id: Option<SchemaId>,
    pub application_id: Option<ApplicationId>,
}

/// Typed job payload, one variant per job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    CreatePolicyMetadata(PolicyMetadataCreate),
    UpdateAllowList(AllowListUpdate),
    Unrecognized(UnrecognizedPayload),
}

/// Raw, nullable payload columns of a job row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadColumns {
    pub job_type: String,
    pub schema_id: Option<String>,
    pub sdl: Option<String>,
    pub application_id: Option<String>,
    /// JSON array of [`SelectedFieldRecord`].
    pub selected_fields: Option<String>,
    pub grant_duration: Option<String>,
}

impl JobPayload {
    pub fn create_policy_metadata(schema_id: SchemaId, sdl: impl Into<String>) -> Self {
        Self::CreatePolicyMetadata(PolicyMetadataCreate {
            schema_id,
            sdl: sdl.into(),
        })
    }

    pub fn update_allow_list(
        application_id: ApplicationId,
        selected_fields: Vec<SelectedFieldRecord>,
        grant_duration: GrantDuration,
    ) -> Self {
        Self::UpdateAllowList(AllowListUpdate {
            application_id,
            selected_fields,
            grant_duration,
        })
    }

    /// Known job type, `None` for unrecognized rows.
    pub fn job_type(&self) -> Option<JobType> {
        match self {
            JobPayload::CreatePolicyMetadata(_) => Some(JobType::CreatePolicyMetadata),
            JobPayload::UpdateAllowList(_) => Some(JobType::UpdateAllowList),
            JobPayload::Unrecognized(_) => None,
        }
    }

    /// Job type as stored, including unrecognized values.
    pub fn type_name(&self) -> &str {
        match self {
            JobPayload::CreatePolicyMetadata(_) => JobType::CreatePolicyMetadata.as_str(),
            JobPayload::UpdateAllowList(_) => JobType::UpdateAllowList.as_str(),
            JobPayload::Unrecognized(p) => &p.job_type,
        }
    }

    pub fn schema_id(&self) -> Option<&SchemaId> {
        match self {
            JobPayload::CreatePolicyMetadata(p) => Some(&p.schema_id),
            JobPayload::UpdateAllowList(_) => None,
            JobPayload::Unrecognized(p) => p.schema_id.as_ref(),
        }
    }

    pub fn application_id(&self) -> Option<&ApplicationId> {
        match self {
            JobPayload::CreatePolicyMetadata(_) => None,
            JobPayload::UpdateAllowList(p) => Some(&p.application_id),
            JobPayload::Unrecognized(p) => p.application_id.as_ref(),
        }
    }

    /// Decode the nullable column layout into a typed payload.
    ///
    /// Never fails: anything that does not form a complete known variant
    /// becomes [`JobPayload::Unrecognized`] carrying the reason.
    pub fn from_columns(columns: PayloadColumns) -> Self {
        let PayloadColumns {
            job_type,
            schema_id,
            sdl,
            application_id,
            selected_fields,
            grant_duration,
        } = columns;

        let schema_id = schema_id.and_then(|s| s.parse::<SchemaId>().ok());
        let application_id = application_id.and_then(|s| s.parse::<ApplicationId>().ok());

        let unrecognized = |reason: String,
                            schema_id: Option<SchemaId>,
                            application_id: Option<ApplicationId>| {
            JobPayload::Unrecognized(UnrecognizedPayload {
                job_type: job_type.clone(),
                reason,
                schema_id,
                application_id,
            })
        };

        match job_type.parse::<JobType>() {
            Ok(JobType::CreatePolicyMetadata) => match (schema_id, sdl) {
                (Some(schema_id), Some(sdl)) => {
                    JobPayload::CreatePolicyMetadata(PolicyMetadataCreate { schema_id, sdl })
                }
                (schema_id, sdl) => {
                    let reason = format!(
                        "missing required fields for create policy metadata job (schema_id: {}, sdl: {})",
                        schema_id.is_some(),
                        sdl.is_some()
                    );
                    unrecognized(reason, schema_id, application_id)
                }
            },
            Ok(JobType::UpdateAllowList) => {
                let (app_id, raw_fields) = match (application_id.clone(), selected_fields) {
                    (Some(app_id), Some(raw_fields)) => (app_id, raw_fields),
                    (app_id, raw_fields) => {
                        let reason = format!(
                            "missing required fields for update allow list job (application_id: {}, selected_fields: {})",
                            app_id.is_some(),
                            raw_fields.is_some()
                        );
                        return unrecognized(reason, schema_id, application_id);
                    }
                };

                let fields = match serde_json::from_str::<Vec<SelectedFieldRecord>>(&raw_fields) {
                    Ok(fields) => fields,
                    Err(e) => {
                        return unrecognized(
                            format!("failed to unmarshal selected fields: {e}"),
                            schema_id,
                            application_id,
                        );
                    }
                };

                let grant_duration = match grant_duration.as_deref().map(GrantDuration::from_str) {
                    None => GrantDuration::default(),
                    Some(Ok(duration)) => duration,
                    Some(Err(e)) => return unrecognized(e.to_string(), schema_id, application_id),
                };

                JobPayload::UpdateAllowList(AllowListUpdate {
                    application_id: app_id,
                    selected_fields: fields,
                    grant_duration,
                })
            }
            Err(_) => unrecognized(
                format!("unknown job type: {job_type}"),
                schema_id,
                application_id,
            ),
        }
    }

    /// Encode into the nullable column layout.
    pub fn to_columns(&self) -> PayloadColumns {
        match self {
            JobPayload::CreatePolicyMetadata(p) => PayloadColumns {
                job_type: JobType::CreatePolicyMetadata.as_str().to_string(),
                schema_id: Some(p.schema_id.to_string()),
                sdl: Some(p.sdl.clone()),
                ..PayloadColumns::default()
            },
            JobPayload::UpdateAllowList(p) => PayloadColumns {
                job_type: JobType::UpdateAllowList.as_str().to_string(),
                application_id: Some(p.application_id.to_string()),
                // Serializing plain string records cannot fail.
                selected_fields: serde_json::to_string(&p.selected_fields).ok(),
                grant_duration: Some(p.grant_duration.as_str().to_string()),
                ..PayloadColumns::default()
            },
            JobPayload::Unrecognized(p) => PayloadColumns {
                job_type: p.job_type.clone(),
                schema_id: p.schema_id.as_ref().map(ToString::to_string),
                application_id: p.application_id.as_ref().map(ToString::to_string),
                ..PayloadColumns::default()
            },
        }
    }
}

/// An outbox job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub status: JobStatus,
    /// Last failure reason; set for compensated and compensation_failed jobs.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once an attempt has concluded, success or otherwise.
    pub processed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(payload: JobPayload) -> Self {
        Self::with_id(JobId::new(), payload)
    }

    pub fn with_id(id: JobId, payload: JobPayload) -> Self {
        let now = Utc::now();
        Self {
            id,
            payload,
            status: JobStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }

    /// Override the creation time (claim order is oldest-created first).
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    pub fn type_name(&self) -> &str {
        self.payload.type_name()
    }

    /// Mark the job as claimed by a worker.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.status = self.status.transition_to(JobStatus::Processing)?;
        self.updated_at = now;
        Ok(())
    }

    /// Return a stuck job to the pending queue.
    pub fn mark_pending(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.status = self.status.transition_to(JobStatus::Pending)?;
        self.updated_at = now;
        Ok(())
    }

    /// Record the outcome of an attempt.
    ///
    /// Unconditional: the status-update path must be able to record an outcome
    /// even if the row was swept back to pending in the meantime.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) {
        self.status = update.status;
        self.error = update.error.clone();
        self.processed_at = Some(update.processed_at);
        self.updated_at = now;
    }
}

/// Terminal result of one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Remote call succeeded.
    Completed,
    /// Remote call failed, compensation restored local consistency.
    Compensated { remote_error: String },
    /// Remote call failed and so did compensation.
    CompensationFailed {
        remote_error: String,
        compensation_error: String,
    },
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Compensated { .. } => JobStatus::Compensated,
            JobOutcome::CompensationFailed { .. } => JobStatus::CompensationFailed,
        }
    }

    /// Error text persisted on the job.
    ///
    /// For compensation failures both causes are kept, one per line.
    pub fn error_text(&self) -> Option<String> {
        match self {
            JobOutcome::Completed => None,
            JobOutcome::Compensated { remote_error } => Some(remote_error.clone()),
            JobOutcome::CompensationFailed {
                remote_error,
                compensation_error,
            } => Some(format!(
                "PDP call failed: {remote_error}\ncompensation failed: {compensation_error}"
            )),
        }
    }

    pub fn to_update(&self, processed_at: DateTime<Utc>) -> StatusUpdate {
        StatusUpdate {
            status: self.status(),
            error: self.error_text(),
            processed_at,
        }
    }
}

/// Fields written by the status-update path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

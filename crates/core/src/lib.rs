//! `pdpsync-core`: domain model of the PDP outbox.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): job
//! identifiers, the typed job payload, the status state machine and the
//! outcome recorded for a processed job.

pub mod error;
pub mod id;
pub mod job;
pub mod status;

pub use error::DomainError;
pub use id::{ApplicationId, JobId, SchemaId};
pub use job::{
    AllowListUpdate, GrantDuration, Job, JobOutcome, JobPayload, JobType, PayloadColumns,
    PolicyMetadataCreate, SelectedFieldRecord, StatusUpdate, UnrecognizedPayload,
};
pub use status::JobStatus;

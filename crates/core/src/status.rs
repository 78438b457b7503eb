//! Job status state machine.
//!
//! ```text
//! pending --(claim)--> processing
//! processing --(remote call succeeds)--> completed
//! processing --(remote call fails, compensation succeeds)--> compensated
//! processing --(remote call fails, compensation fails)--> compensation_failed
//! processing --(stuck-job sweep)--> pending
//! ```
//!
//! `completed`, `compensated` and `compensation_failed` are terminal.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle state of an outbox job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued, waiting to be claimed.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Remote call succeeded.
    Completed,
    /// Remote call failed and the local side effect was undone.
    Compensated,
    /// Remote call failed and the local side effect could not be undone.
    CompensationFailed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Compensated,
        JobStatus::CompensationFailed,
    ];

    /// Column value as persisted in the job table.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Compensated => "compensated",
            JobStatus::CompensationFailed => "compensation_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Compensated | JobStatus::CompensationFailed
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Compensated)
                | (JobStatus::Processing, JobStatus::CompensationFailed)
                | (JobStatus::Processing, JobStatus::Pending)
        )
    }

    /// Validate a transition, returning the target status.
    pub fn transition_to(&self, next: JobStatus) -> Result<JobStatus, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::IllegalTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::UnknownStatus(s.to_string()))
    }
}

//! Domain error model.

use thiserror::Error;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (parsing, validation, illegal
/// state transitions). Storage and network concerns belong to `pdpsync-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. empty).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A status string did not name a known job status.
    #[error("unknown job status: {0}")]
    UnknownStatus(String),

    /// A job type string did not name a known job type.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// The job state machine does not allow this transition.
    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

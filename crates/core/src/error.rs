//! Domain error model.

use thiserror::Error;

use crate::job::JobStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic rule violations raised by domain types.
///
/// Storage and transport failures are infra errors, not these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Bad input: empty prompt, unknown feature, non-object params.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An operation the record's current state does not permit.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An id string that is not a UUID.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A job state transition that the state machine does not allow.
    #[error("illegal job transition: {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    /// The change was already applied (e.g. a second refund).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

//! Domain error model.

use thiserror::Error;

/// Result type used for validation at the domain boundary.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic, input-level failures (bad ids, bad settings, bad job shapes).
///
/// State-machine and lease failures have their own error type in `jobforge-jobs`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. empty job kind, unparsable setting).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

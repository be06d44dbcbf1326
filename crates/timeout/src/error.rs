use std::time::Duration;

use thiserror::Error;

/// Failures produced by the bounded-execution wrapper itself.
///
/// Errors returned by the guarded callable never pass through this type; they
/// reach the caller unchanged.
#[derive(Debug, Error)]
pub enum BoundedError {
    /// The guarded call did not finish within its budget.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// `Timeout::Ambient` was requested but no budget scope is active.
    #[error("{operation}: no timeout given and no budget scope is active")]
    NoBudget { operation: String },

    #[error("{operation}: failed to spawn worker thread: {source}")]
    Spawn {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl BoundedError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BoundedError::Timeout { .. })
    }
}

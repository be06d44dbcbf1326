//! Contract implemented by concrete job kinds.

use std::time::Duration;

use thiserror::Error;

use crate::job::DiagnosticContext;
use crate::retry::RetryPolicy;

/// Why a run step did not succeed.
#[derive(Debug, Error)]
pub enum RunError {
    /// Transient failure. The runner requeues while the retry policy allows.
    #[error("retryable failure: {reason}")]
    Retryable {
        reason: String,
        /// Overrides the policy's backoff for the next attempt.
        after: Option<Duration>,
    },

    /// Expected failure caused by the request itself; reported to the requester
    /// rather than to operators.
    #[error("user error: {0}")]
    User(String),

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl RunError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable {
            reason: reason.into(),
            after: None,
        }
    }

    pub fn retry_after(reason: impl Into<String>, after: Duration) -> Self {
        Self::Retryable {
            reason: reason.into(),
            after: Some(after),
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }
}

/// The run step of a job kind.
///
/// The runner calls `run` on a dedicated worker thread between the `start` and
/// `complete`/`fail`/`queue` transitions, so it must not touch the job record
/// itself. If the run budget expires, `cancel` is called from the runner thread
/// while `run` may still be blocked; it should make that blocked I/O fail (for
/// example by closing a `CancellablePool`).
pub trait RunnableJob: Send + Sync {
    fn run(&self) -> Result<(), RunError>;

    fn cancel(&self) {}

    /// Extra pairs merged into error reports about this job.
    fn diagnostic_context(&self) -> DiagnosticContext {
        DiagnosticContext::new()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::no_retry()
    }
}

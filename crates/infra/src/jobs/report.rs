//! Reporting of failed job runs.

use serde::Serialize;
use tracing::{error, warn};

use jobforge_core::JobId;
use jobforge_jobs::DiagnosticContext;

/// Why a run ended up reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Expected failure caused by the request; goes back to the requester.
    User,
    /// The run did not finish within its lease.
    Timeout,
    /// A retryable failure with no retries left.
    RetriesExhausted,
    /// Anything else, including a missing handler.
    Fatal,
}

/// One failed run, with the merged job and runnable diagnostic context.
#[derive(Debug, Clone, Serialize)]
pub struct JobFailure {
    pub job_id: JobId,
    pub kind: String,
    pub failure: FailureKind,
    pub message: String,
    pub context: DiagnosticContext,
}

/// Sink for failed runs (error tracker, requester notification, ...).
pub trait ErrorReporter: Send + Sync {
    fn report(&self, failure: &JobFailure);
}

/// Default reporter: structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, failure: &JobFailure) {
        match failure.failure {
            FailureKind::User | FailureKind::Timeout => warn!(
                job_id = %failure.job_id,
                kind = %failure.kind,
                failure = ?failure.failure,
                context = ?failure.context,
                "job failed: {}",
                failure.message
            ),
            FailureKind::RetriesExhausted | FailureKind::Fatal => error!(
                job_id = %failure.job_id,
                kind = %failure.kind,
                failure = ?failure.failure,
                context = ?failure.context,
                "job failed: {}",
                failure.message
            ),
        }
    }
}

use chrono::{DateTime, Utc};
use thiserror::Error;

use jobforge_core::JobId;

use crate::status::JobStatus;

/// Failures of the job state machine and lease bookkeeping.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// A disallowed status change. Always a programming error; never retried.
    #[error("job {job_id}: invalid status transition {from} -> {to}")]
    InvalidStateTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// Another worker holds an unexpired lease. Callers re-poll.
    #[error("job {job_id}: lease already held until {expires_at}")]
    LeaseAlreadyHeld {
        job_id: JobId,
        expires_at: DateTime<Utc>,
    },

    /// `now + duration` falls outside the representable time range.
    #[error("job {job_id}: lease of {duration} is out of range")]
    LeaseOutOfRange {
        job_id: JobId,
        duration: chrono::Duration,
    },
}

impl JobError {
    pub fn is_lease_held(&self) -> bool {
        matches!(self, JobError::LeaseAlreadyHeld { .. })
    }
}

//! Job status values and the legal moves between them.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use jobforge_core::DomainError;

/// Lifecycle status of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued, waiting to be claimed.
    Waiting,
    /// Claimed by a runner and executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully; will not be retried.
    Failed,
    /// Parked by an operator; ignored by runners until resumed.
    Suspended,
}

/// Statuses in which a job still has work ahead of it.
pub const PENDING_STATUSES: [JobStatus; 2] = [JobStatus::Waiting, JobStatus::Running];

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Waiting,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Suspended,
    ];

    /// Targets reachable from this status in a single transition.
    pub fn valid_targets(self) -> &'static [JobStatus] {
        match self {
            JobStatus::Waiting => &[JobStatus::Running, JobStatus::Suspended],
            JobStatus::Running => &[
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Waiting,
                JobStatus::Suspended,
            ],
            JobStatus::Suspended => &[JobStatus::Waiting],
            JobStatus::Completed | JobStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(self, target: JobStatus) -> bool {
        self.valid_targets().contains(&target)
    }

    pub fn is_pending(self) -> bool {
        PENDING_STATUSES.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Suspended => "SUSPENDED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status '{s}'")))
    }
}

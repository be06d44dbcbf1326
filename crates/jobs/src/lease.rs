//! Lease bookkeeping on the job record.
//!
//! A lease is not a separate entity: it is `lease_expires` read as "do not hand
//! this job to another worker until then". These helpers operate on a single
//! in-memory record; the store is what makes acquisition exclusive across
//! workers, by applying the same check-and-set atomically.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::JobError;
use crate::job::Job;
use crate::status::JobStatus;

/// Lease length used when a runner does not configure one.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(300);

impl Job {
    /// Claim the job for `duration` from now.
    ///
    /// Negative durations are allowed and yield an already-expired lease.
    pub fn acquire_lease(&mut self, duration: chrono::Duration) -> Result<DateTime<Utc>, JobError> {
        self.acquire_lease_at(duration, Utc::now())
    }

    pub fn acquire_lease_at(
        &mut self,
        duration: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, JobError> {
        if let Some(expires_at) = self.lease_expires.filter(|expires| *expires > now) {
            return Err(JobError::LeaseAlreadyHeld {
                job_id: self.id,
                expires_at,
            });
        }

        let expires_at = now
            .checked_add_signed(duration)
            .ok_or(JobError::LeaseOutOfRange {
                job_id: self.id,
                duration,
            })?;
        self.lease_expires = Some(expires_at);
        Ok(expires_at)
    }

    /// Give up the lease so a requeued job is claimable as soon as it is scheduled.
    pub fn release_lease(&mut self) {
        self.lease_expires = None;
    }

    /// True while another acquisition would fail.
    pub fn has_active_lease_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires.is_some_and(|expires| expires > now)
    }

    /// Time left on the lease, floored at zero.
    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout_at(Utc::now())
    }

    pub fn lease_timeout_at(&self, now: DateTime<Utc>) -> Duration {
        self.lease_expires
            .and_then(|expires| (expires - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Whether a runner may claim this job right now.
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting
            && !self.has_active_lease_at(now)
            && self.scheduled_start.is_none_or(|start| start <= now)
    }
}

//! The job record and its transition operations.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use jobforge_core::{DomainError, JobId, PersonId};

use crate::error::JobError;
use crate::status::JobStatus;

/// Key/value pairs attached to error reports about a job.
pub type DiagnosticContext = BTreeMap<String, String>;

/// A persisted unit of background work.
///
/// Fields are public so stores can rebuild rows; everything else should change
/// status only through the transition methods, which enforce the legal moves in
/// [`JobStatus::valid_targets`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Routing key used by runners to pick the implementation.
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub requester: Option<PersonId>,
    pub created_at: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_finished: Option<DateTime<Utc>>,
    /// "Claimed until". See `lease.rs`.
    pub lease_expires: Option<DateTime<Utc>>,
    /// Not runnable before this instant.
    pub scheduled_start: Option<DateTime<Utc>>,
    /// Number of transitions into RUNNING so far.
    pub attempt_count: u32,
}

/// Notification emitted by every successful transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub job_id: JobId,
    pub kind: String,
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
}

impl Job {
    /// Create a WAITING job scheduled to start immediately.
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Result<Self, DomainError> {
        let kind = kind.into();
        if kind.trim().is_empty() {
            return Err(DomainError::validation("job kind must not be empty"));
        }

        let now = Utc::now();
        Ok(Self {
            id: JobId::new(),
            kind,
            payload,
            status: JobStatus::Waiting,
            requester: None,
            created_at: now,
            date_started: None,
            date_finished: None,
            lease_expires: None,
            scheduled_start: Some(now),
            attempt_count: 0,
        })
    }

    /// Create one WAITING job per payload, all of the same kind, with no requester.
    pub fn batch(
        kind: impl Into<String>,
        payloads: impl IntoIterator<Item = serde_json::Value>,
    ) -> Result<Vec<Self>, DomainError> {
        let kind = kind.into();
        payloads
            .into_iter()
            .map(|payload| Self::new(kind.clone(), payload))
            .collect()
    }

    pub fn with_requester(mut self, requester: PersonId) -> Self {
        self.requester = Some(requester);
        self
    }

    /// Schedule the job for a later start.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_start = Some(at);
        self
    }

    /// Schedule the job with a delay from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_start =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status.is_pending()
    }

    /// WAITING -> RUNNING.
    pub fn start(&mut self) -> Result<StatusChanged, JobError> {
        let change = self.transition(&[JobStatus::Waiting], JobStatus::Running)?;
        self.date_started = Some(change.at);
        self.date_finished = None;
        self.attempt_count += 1;
        Ok(change)
    }

    /// RUNNING -> COMPLETED.
    pub fn complete(&mut self) -> Result<StatusChanged, JobError> {
        let change = self.transition(&[JobStatus::Running], JobStatus::Completed)?;
        self.date_finished = Some(change.at);
        Ok(change)
    }

    /// RUNNING -> FAILED.
    pub fn fail(&mut self) -> Result<StatusChanged, JobError> {
        let change = self.transition(&[JobStatus::Running], JobStatus::Failed)?;
        self.date_finished = Some(change.at);
        Ok(change)
    }

    /// RUNNING -> WAITING, so another attempt can be made later.
    pub fn queue(&mut self) -> Result<StatusChanged, JobError> {
        let change = self.transition(&[JobStatus::Running], JobStatus::Waiting)?;
        self.date_finished = Some(change.at);
        Ok(change)
    }

    /// WAITING or RUNNING -> SUSPENDED.
    pub fn suspend(&mut self) -> Result<StatusChanged, JobError> {
        self.transition(&[JobStatus::Waiting, JobStatus::Running], JobStatus::Suspended)
    }

    /// SUSPENDED -> WAITING. Drops any lease so the job is immediately claimable.
    pub fn resume(&mut self) -> Result<StatusChanged, JobError> {
        let change = self.transition(&[JobStatus::Suspended], JobStatus::Waiting)?;
        self.lease_expires = None;
        Ok(change)
    }

    /// Move the earliest start time, e.g. to apply a retry delay after `queue`.
    pub fn reschedule(&mut self, at: DateTime<Utc>) {
        self.scheduled_start = Some(at);
    }

    /// Base diagnostic pairs for error reports; runnables may add their own.
    pub fn diagnostic_context(&self) -> DiagnosticContext {
        let mut context = DiagnosticContext::new();
        context.insert("job_id".to_string(), self.id.to_string());
        context.insert("job_kind".to_string(), self.kind.clone());
        context.insert("job_status".to_string(), self.status.to_string());
        context.insert("attempt_count".to_string(), self.attempt_count.to_string());
        if let Some(requester) = self.requester {
            context.insert("requester".to_string(), requester.to_string());
        }
        context
    }

    /// Move to `to` if the current status is one of `sources`.
    ///
    /// Several operations share a target (`queue` and `resume` both land in
    /// WAITING), so the source check is per operation, not per target.
    fn transition(
        &mut self,
        sources: &[JobStatus],
        to: JobStatus,
    ) -> Result<StatusChanged, JobError> {
        let from = self.status;
        if !sources.contains(&from) || !from.can_transition_to(to) {
            return Err(JobError::InvalidStateTransition {
                job_id: self.id,
                from,
                to,
            });
        }

        self.status = to;
        debug!(job_id = %self.id, kind = %self.kind, %from, %to, "job status changed");

        Ok(StatusChanged {
            job_id: self.id,
            kind: self.kind.clone(),
            from,
            to,
            at: Utc::now(),
        })
    }
}

//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use jobforge_core::JobId;
use jobforge_jobs::{Job, JobError, JobStatus};

/// Job store abstraction.
///
/// `acquire_lease` and `save` are the only operations that need to be atomic;
/// everything a runner does between them works on its own copy of the record.
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Persist several jobs, returning their ids in input order.
    fn enqueue_many(&self, jobs: Vec<Job>) -> Result<Vec<JobId>, JobStoreError> {
        jobs.into_iter().map(|job| self.enqueue(job)).collect()
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Ids of jobs a runner could claim now, oldest schedule first.
    ///
    /// Selection is advisory; two runners may see the same id.
    fn ready_job_ids(&self, limit: usize) -> Result<Vec<JobId>, JobStoreError>;

    /// Atomically claim a job for `duration` and return the updated record.
    ///
    /// Fails with `JobError::LeaseAlreadyHeld` if another caller holds an
    /// unexpired lease.
    fn acquire_lease(&self, id: JobId, duration: chrono::Duration) -> Result<Job, JobStoreError>;

    /// Write back a transitioned record if the stored status is still `expected`.
    fn save(&self, job: &Job, expected: JobStatus) -> Result<(), JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {job_id} is {actual}, expected {expected}")]
    Stale {
        job_id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    /// Another worker got there first; the caller should re-poll.
    pub fn is_conflict(&self) -> bool {
        match self {
            JobStoreError::Stale { .. } => true,
            JobStoreError::Job(err) => err.is_lease_held(),
            _ => false,
        }
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub waiting: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub suspended: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Waiting => self.waiting += count,
            JobStatus::Running => self.running += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Suspended => self.suspended += count,
        }
    }

    pub fn total(&self) -> usize {
        self.waiting + self.running + self.completed + self.failed + self.suspended
    }
}

/// Sort key used by every store for ready selection.
pub(crate) fn schedule_key(job: &Job) -> (DateTime<Utc>, JobId) {
    (job.scheduled_start.unwrap_or(job.created_at), job.id)
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn enqueue_many(&self, batch: Vec<Job>) -> Result<Vec<JobId>, JobStoreError> {
        let mut jobs = self.write()?;
        if let Some(dup) = batch.iter().find(|job| jobs.contains_key(&job.id)) {
            return Err(JobStoreError::AlreadyExists(dup.id));
        }
        Ok(batch
            .into_iter()
            .map(|job| {
                let id = job.id;
                jobs.insert(id, job);
                id
            })
            .collect())
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn ready_job_ids(&self, limit: usize) -> Result<Vec<JobId>, JobStoreError> {
        let jobs = self.read()?;
        let now = Utc::now();

        let mut ready: Vec<_> = jobs.values().filter(|job| job.is_ready_at(now)).collect();
        ready.sort_by_key(|job| schedule_key(job));

        Ok(ready.into_iter().take(limit).map(|job| job.id).collect())
    }

    fn acquire_lease(&self, id: JobId, duration: chrono::Duration) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.acquire_lease(duration)?;
        Ok(job.clone())
    }

    fn save(&self, job: &Job, expected: JobStatus) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let stored = jobs.get_mut(&job.id).ok_or(JobStoreError::NotFound(job.id))?;
        if stored.status != expected {
            return Err(JobStoreError::Stale {
                job_id: job.id,
                expected,
                actual: stored.status,
            });
        }
        *stored = job.clone();
        Ok(())
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn enqueue_many(&self, jobs: Vec<Job>) -> Result<Vec<JobId>, JobStoreError> {
        (**self).enqueue_many(jobs)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id)
    }

    fn ready_job_ids(&self, limit: usize) -> Result<Vec<JobId>, JobStoreError> {
        (**self).ready_job_ids(limit)
    }

    fn acquire_lease(&self, id: JobId, duration: chrono::Duration) -> Result<Job, JobStoreError> {
        (**self).acquire_lease(id, duration)
    }

    fn save(&self, job: &Job, expected: JobStatus) -> Result<(), JobStoreError> {
        (**self).save(job, expected)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_and_get() {
        contract::enqueue_and_get(&InMemoryJobStore::new());
    }

    #[test]
    fn enqueue_many_keeps_input_order() {
        contract::enqueue_many_keeps_input_order(&InMemoryJobStore::new());
    }

    #[test]
    fn ready_selection() {
        contract::ready_selection(&InMemoryJobStore::new());
    }

    #[test]
    fn ready_selection_is_ordered_and_limited() {
        contract::ready_selection_is_ordered_and_limited(&InMemoryJobStore::new());
    }

    #[test]
    fn lease_is_exclusive() {
        contract::lease_is_exclusive(&InMemoryJobStore::new());
    }

    #[test]
    fn out_of_range_lease_is_rejected() {
        contract::out_of_range_lease_is_rejected(&InMemoryJobStore::new());
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        contract::expired_lease_can_be_taken_over(&InMemoryJobStore::new());
    }

    #[test]
    fn save_checks_expected_status() {
        contract::save_checks_expected_status(&InMemoryJobStore::new());
    }

    #[test]
    fn stats_count_by_status() {
        contract::stats_count_by_status(&InMemoryJobStore::new());
    }

    #[test]
    fn arc_store_delegates() {
        let store = InMemoryJobStore::arc();
        let shared: Arc<dyn JobStore> = store.clone();
        let id = shared.enqueue(Job::new("arc.test", serde_json::Value::Null).unwrap()).unwrap();
        assert!(store.get(id).unwrap().is_some());
    }
}

//! Runner settings from the environment.

use std::str::FromStr;
use std::time::Duration;

use jobforge_core::{DomainError, DomainResult};
use jobforge_timeout::DEFAULT_CANCEL_GRACE;

use crate::jobs::{JobRunnerConfig, JobStoreError, SqliteJobStore};

pub const DATABASE_URL: &str = "JOBFORGE_DATABASE_URL";
pub const RUNNER_NAME: &str = "JOBFORGE_RUNNER_NAME";
pub const POLL_INTERVAL_MS: &str = "JOBFORGE_POLL_INTERVAL_MS";
pub const LEASE_SECONDS: &str = "JOBFORGE_LEASE_SECONDS";
pub const BATCH_SIZE: &str = "JOBFORGE_BATCH_SIZE";
pub const CANCEL_GRACE_MS: &str = "JOBFORGE_CANCEL_GRACE_MS";
pub const CLEARANCE_MS: &str = "JOBFORGE_CLEARANCE_MS";

/// Longest lease a runner may be configured with (one week).
pub const MAX_LEASE_SECONDS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    pub database_url: String,
    pub runner_name: String,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub batch_size: usize,
    pub cancel_grace: Duration,
    pub clearance: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        let runner = JobRunnerConfig::default();
        Self {
            database_url: "sqlite::memory:".to_string(),
            runner_name: runner.name,
            poll_interval: runner.poll_interval,
            lease_duration: runner.lease_duration,
            batch_size: runner.batch_size,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            clearance: runner.clearance,
        }
    }
}

impl RunnerSettings {
    pub fn from_env() -> DomainResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup; unset keys keep their
    /// defaults, blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> DomainResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let batch_size = parse_or(&get, BATCH_SIZE, defaults.batch_size)?;
        if batch_size == 0 {
            return Err(DomainError::validation(format!("{BATCH_SIZE} must be at least 1")));
        }
        let lease_secs = parse_or(&get, LEASE_SECONDS, defaults.lease_duration.as_secs())?;
        if !(1..=MAX_LEASE_SECONDS).contains(&lease_secs) {
            return Err(DomainError::validation(format!(
                "{LEASE_SECONDS} must be between 1 and {MAX_LEASE_SECONDS}"
            )));
        }

        Ok(Self {
            database_url: get(DATABASE_URL).unwrap_or(defaults.database_url),
            runner_name: get(RUNNER_NAME).unwrap_or(defaults.runner_name),
            poll_interval: Duration::from_millis(parse_or(
                &get,
                POLL_INTERVAL_MS,
                millis(defaults.poll_interval),
            )?),
            lease_duration: Duration::from_secs(lease_secs),
            batch_size,
            cancel_grace: Duration::from_millis(parse_or(
                &get,
                CANCEL_GRACE_MS,
                millis(defaults.cancel_grace),
            )?),
            clearance: Duration::from_millis(parse_or(
                &get,
                CLEARANCE_MS,
                millis(defaults.clearance),
            )?),
        })
    }

    pub fn runner_config(&self) -> JobRunnerConfig {
        JobRunnerConfig::default()
            .with_name(self.runner_name.clone())
            .with_poll_interval(self.poll_interval)
            .with_lease_duration(self.lease_duration)
            .with_batch_size(self.batch_size)
            .with_cancel_grace(self.cancel_grace)
            .with_clearance(self.clearance)
    }

    pub fn open_store(&self) -> Result<SqliteJobStore, JobStoreError> {
        SqliteJobStore::connect(&self.database_url)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> DomainResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err| DomainError::validation(format!("{key}={raw:?}: {err}"))),
    }
}

//! Infrastructure layer: job persistence, the runner loop and configuration.

pub mod config;
pub mod jobs;

pub use config::RunnerSettings;
pub use jobs::{
    InMemoryJobStore, JobRunner, JobRunnerConfig, JobRunnerHandle, JobStats, JobStore,
    JobStoreError, RunOutcome, RunnerError, RunnerStats, SqliteJobStore,
};

//! Background job persistence and execution.
//!
//! ## Design
//!
//! - Many runners, possibly in separate processes, poll one shared store
//! - The store's atomic lease update is the only exclusion point
//! - Each run is bounded by the remaining lease time
//! - A panicking run fails its job; the runner keeps polling
//! - Retryable failures are requeued with backoff; others fail the job
//!
//! ## Components
//!
//! - `JobStore`: persistence for jobs (in-memory or SQLite)
//! - `JobRunner`: claims ready jobs and runs them through registered factories
//! - `ErrorReporter`: where failed runs are reported, with diagnostic context

pub mod report;
pub mod runner;
pub mod sqlite;
pub mod store;

pub use report::{ErrorReporter, FailureKind, JobFailure, TracingReporter};
pub use runner::{
    DEFAULT_CLEARANCE, JobRunner, JobRunnerConfig, JobRunnerHandle, RunOutcome, RunnableFactory,
    RunnerError, RunnerStats,
};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};

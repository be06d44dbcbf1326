//! The job record, its status state machine and lease bookkeeping.
//!
//! ## Components
//!
//! - `Job`: persisted status/timing/lease fields plus the transition operations
//! - `JobStatus`: the five statuses and which moves between them are legal
//! - lease helpers on `Job` (`acquire_lease`, `lease_timeout`, `is_ready_at`)
//! - `RunnableJob`: the narrow contract concrete job kinds implement
//! - `RetryPolicy`: how a runner decides between requeue and failure
//! - `StatusBus`: fan-out of `StatusChanged` notifications
//!
//! Persistence is not handled here; see `jobforge-infra`.

pub mod error;
pub mod job;
pub mod lease;
pub mod notify;
pub mod retry;
pub mod runnable;
pub mod status;

pub use error::JobError;
pub use job::{DiagnosticContext, Job, StatusChanged};
pub use lease::DEFAULT_LEASE_DURATION;
pub use notify::{InMemoryStatusBus, StatusBus, Subscription};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use runnable::{RunError, RunnableJob};
pub use status::{JobStatus, PENDING_STATUSES};

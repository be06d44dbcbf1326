//! Wall-clock bounds for blocking work.
//!
//! - [`budget`]: dynamically scoped "timeout to use when none is given"
//! - [`bounded`]: run a blocking callable on a dedicated worker thread and give
//!   up on it, after invoking a cancellation callback, once the budget is spent
//!
//! Budgets live in a thread-local slot. They are not inherited by spawned
//! threads; capture a concrete value (or a deadline) before crossing over.

pub mod bounded;
pub mod budget;
pub mod error;

pub use bounded::{BoundedCall, DEFAULT_CANCEL_GRACE, Timeout};
pub use budget::{
    BudgetScope, Reduced, RequestScope, bounded_request, current_budget, default_timeout,
    override_deadline, override_timeout, reduced_timeout,
};
pub use error::BoundedError;

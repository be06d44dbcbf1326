//! Shared tracing setup for jobforge processes and tests.

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use crate::tracing::{DEFAULT_FILTER, init, init_for_tests};

//! Bounded execution of blocking callables.
//!
//! The callable runs on its own worker thread while the caller waits on a
//! single-slot channel. When the budget runs out the caller invokes the
//! cancellation callback once, gives the worker a short grace period to notice,
//! and returns a timeout error. The worker is never killed; a callable that does
//! not react to cancellation keeps running detached until it finishes.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::budget::current_budget;
use crate::error::BoundedError;

/// How long a timed-out call waits for its worker after cancelling it.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Where a bounded call takes its timeout from.
pub enum Timeout<A> {
    Fixed(Duration),
    /// Computed from the call's argument.
    PerCall(Arc<dyn Fn(&A) -> Duration + Send + Sync>),
    /// The active budget scope on the calling thread.
    Ambient,
}

impl<A> Timeout<A> {
    pub fn per_call<F>(f: F) -> Self
    where
        F: Fn(&A) -> Duration + Send + Sync + 'static,
    {
        Timeout::PerCall(Arc::new(f))
    }

    /// The timeout a call with `arg` would get right now, if any.
    pub fn resolve(&self, arg: &A) -> Option<Duration> {
        match self {
            Timeout::Fixed(timeout) => Some(*timeout),
            Timeout::PerCall(f) => Some(f(arg)),
            Timeout::Ambient => current_budget(),
        }
    }
}

impl<A> Clone for Timeout<A> {
    fn clone(&self) -> Self {
        match self {
            Timeout::Fixed(timeout) => Timeout::Fixed(*timeout),
            Timeout::PerCall(f) => Timeout::PerCall(Arc::clone(f)),
            Timeout::Ambient => Timeout::Ambient,
        }
    }
}

impl<A> fmt::Debug for Timeout<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeout::Fixed(timeout) => f.debug_tuple("Fixed").field(timeout).finish(),
            Timeout::PerCall(_) => f.write_str("PerCall(..)"),
            Timeout::Ambient => f.write_str("Ambient"),
        }
    }
}

/// A reusable wall-clock bound for calls taking an argument of type `A`.
#[derive(Debug, Clone)]
pub struct BoundedCall<A> {
    operation: String,
    timeout: Timeout<A>,
    cancel_grace: Duration,
}

type Outcome<T, E> = Result<Result<T, E>, Box<dyn Any + Send + 'static>>;

impl<A> BoundedCall<A>
where
    A: Send + 'static,
{
    pub fn new(timeout: Timeout<A>) -> Self {
        Self {
            operation: "bounded call".to_string(),
            timeout,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    /// Name used in errors, logs and the worker thread name.
    pub fn named(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Run `f(arg)` on a worker thread, bounded by the resolved timeout.
    ///
    /// The callable's own `Err` is returned unchanged and a panic inside it is
    /// resumed on the calling thread. On timeout `cancel` runs exactly once on
    /// the calling thread before `BoundedError::Timeout` is returned.
    pub fn run<T, E, F, C>(&self, arg: A, cancel: C, f: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<BoundedError> + Send + 'static,
        F: FnOnce(A) -> Result<T, E> + Send + 'static,
        C: FnOnce(),
    {
        let Some(timeout) = self.timeout.resolve(&arg) else {
            return Err(BoundedError::NoBudget {
                operation: self.operation.clone(),
            }
            .into());
        };

        let (tx, rx) = mpsc::sync_channel::<Outcome<T, E>>(1);
        let worker = thread::Builder::new()
            .name(self.thread_name())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(arg)));
                // The caller may have given up already.
                let _ = tx.send(outcome);
            })
            .map_err(|source| BoundedError::Spawn {
                operation: self.operation.clone(),
                source,
            })?;

        match rx.recv_timeout(timeout) {
            Ok(outcome) => {
                let _ = worker.join();
                match outcome {
                    Ok(result) => result,
                    Err(payload) => panic::resume_unwind(payload),
                }
            }
            Err(RecvTimeoutError::Disconnected) => match worker.join() {
                Err(payload) => panic::resume_unwind(payload),
                Ok(()) => Err(self.timed_out(timeout).into()),
            },
            Err(RecvTimeoutError::Timeout) => {
                warn!(operation = %self.operation, ?timeout, "bounded call timed out, cancelling");
                cancel();
                match rx.recv_timeout(self.cancel_grace) {
                    Ok(_) => debug!(operation = %self.operation, "worker finished after cancel"),
                    Err(_) => debug!(
                        operation = %self.operation,
                        grace = ?self.cancel_grace,
                        "worker still running after cancel grace, abandoning it"
                    ),
                }
                Err(self.timed_out(timeout).into())
            }
        }
    }

    fn timed_out(&self, timeout: Duration) -> BoundedError {
        BoundedError::Timeout {
            operation: self.operation.clone(),
            timeout,
        }
    }

    fn thread_name(&self) -> String {
        self.operation.chars().filter(|c| *c != '\0').collect()
    }
}

//! Budget scopes: the timeout used when a caller gives none explicitly.
//!
//! The active budget is a provider function stored in a thread-local slot.
//! Each scope function installs a provider and returns a guard that puts back
//! whatever was active on entry when it is dropped, including during a panic
//! unwind. Guards are `!Send` and must be dropped in reverse order of creation,
//! which ordinary lexical scoping guarantees.
//!
//! ```ignore
//! let _job = override_timeout(Duration::from_secs(60));
//! {
//!     // keep 5 s of the job's budget for cleanup after the fetch gives up
//!     let _fetch = reduced_timeout(Reduced::new(Duration::from_secs(5)));
//!     fetcher.fetch(url)?; // bounded by ~55 s
//! }
//! ```

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

type Provider = Rc<dyn Fn() -> Option<Duration>>;

thread_local! {
    static PROVIDER: RefCell<Option<Provider>> = const { RefCell::new(None) };
    static IN_BOUNDED_REQUEST: Cell<bool> = const { Cell::new(false) };
}

fn active_provider() -> Option<Provider> {
    PROVIDER.with(|slot| slot.borrow().clone())
}

fn install(provider: Option<Provider>) -> Option<Provider> {
    PROVIDER.with(|slot| slot.replace(provider))
}

/// Remaining budget of the innermost active scope on this thread, if any.
pub fn current_budget() -> Option<Duration> {
    active_provider().and_then(|provider| provider())
}

/// Restores the previously active provider on drop.
#[must_use = "the previous budget is restored as soon as the scope is dropped"]
pub struct BudgetScope {
    previous: Option<Provider>,
}

impl Drop for BudgetScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = PROVIDER.try_with(|slot| slot.replace(previous));
    }
}

impl std::fmt::Debug for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetScope")
            .field("restores_budget", &self.previous.is_some())
            .finish()
    }
}

/// Install `timeout` only if no budget is active. Nested calls inherit the
/// outer budget unchanged.
pub fn default_timeout(timeout: Duration) -> BudgetScope {
    let previous = active_provider();
    if previous.is_none() {
        install(Some(Rc::new(move || Some(timeout))));
    }
    BudgetScope { previous }
}

/// Replace the active budget with `timeout` regardless of the outer context.
pub fn override_timeout(timeout: Duration) -> BudgetScope {
    let previous = install(Some(Rc::new(move || Some(timeout))));
    BudgetScope { previous }
}

/// Replace the active budget with whatever time is left until `deadline`.
///
/// Used to carry a budget captured on one thread into a worker thread.
pub fn override_deadline(deadline: Instant) -> BudgetScope {
    let previous = install(Some(Rc::new(move || {
        Some(deadline.saturating_duration_since(Instant::now()))
    })));
    BudgetScope { previous }
}

/// Parameters of a reduced budget derived from the outer one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reduced {
    /// Seconds of the outer budget reserved for the caller's own cleanup.
    pub clearance: Duration,
    /// Upper bound applied while serving a bounded external request.
    pub cap: Option<Duration>,
    /// Budget to use when there is no outer budget at all.
    pub fallback: Option<Duration>,
}

impl Reduced {
    pub fn new(clearance: Duration) -> Self {
        Self {
            clearance,
            ..Self::default()
        }
    }

    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = Some(cap);
        self
    }

    pub fn with_fallback(mut self, fallback: Duration) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Derive the budget from the outer remaining budget.
    ///
    /// Reduction never drives a positive budget to zero: when the outer budget
    /// is no larger than the clearance it is returned as is.
    pub fn apply(&self, outer: Option<Duration>, in_bounded_request: bool) -> Option<Duration> {
        let Some(remaining) = outer else {
            return self.fallback;
        };

        if let Some(cap) = self.cap {
            if in_bounded_request && remaining > cap {
                return Some(cap);
            }
        }

        if remaining > self.clearance {
            Some(remaining - self.clearance)
        } else {
            Some(remaining)
        }
    }
}

/// Install a budget derived from the outer one, see [`Reduced::apply`].
///
/// The outer provider is captured on entry and re-evaluated on every read, so
/// a reduced deadline budget keeps counting down.
pub fn reduced_timeout(reduced: Reduced) -> BudgetScope {
    let outer = active_provider();
    let derived: Provider = {
        let outer = outer.clone();
        Rc::new(move || {
            let remaining = outer.as_ref().and_then(|provider| provider());
            reduced.apply(remaining, in_bounded_request())
        })
    };
    install(Some(derived));
    BudgetScope { previous: outer }
}

/// Marks the current thread as serving a bounded external request.
#[must_use = "the marker is cleared as soon as the scope is dropped"]
#[derive(Debug)]
pub struct RequestScope {
    previous: bool,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        let previous = self.previous;
        let _ = IN_BOUNDED_REQUEST.try_with(|flag| flag.set(previous));
    }
}

/// Enter a bounded external request; enables the `cap` of reduced budgets.
pub fn bounded_request() -> RequestScope {
    let previous = IN_BOUNDED_REQUEST.with(|flag| flag.replace(true));
    RequestScope {
        previous,
        _not_send: std::marker::PhantomData,
    }
}

pub fn in_bounded_request() -> bool {
    IN_BOUNDED_REQUEST.with(Cell::get)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn no_budget_by_default() {
        assert_eq!(current_budget(), None);
    }

    #[test]
    fn default_installs_only_when_nothing_is_active() {
        let _outer = default_timeout(secs(100));
        assert_eq!(current_budget(), Some(secs(100)));
        {
            let _inner = default_timeout(secs(10));
            assert_eq!(current_budget(), Some(secs(100)));
        }
        assert_eq!(current_budget(), Some(secs(100)));
    }

    #[test]
    fn override_replaces_and_restores() {
        let _outer = default_timeout(secs(100));
        {
            let _inner = override_timeout(secs(5));
            assert_eq!(current_budget(), Some(secs(5)));
        }
        assert_eq!(current_budget(), Some(secs(100)));
    }

    #[test]
    fn scopes_unwind_to_empty() {
        {
            let _a = override_timeout(secs(1));
            let _b = reduced_timeout(Reduced::new(secs(1)));
        }
        assert_eq!(current_budget(), None);
    }

    #[test]
    fn reduced_reserves_clearance() {
        let _outer = default_timeout(secs(100));
        let _reduced = reduced_timeout(Reduced::new(secs(5)));
        assert_eq!(current_budget(), Some(secs(95)));
    }

    #[test]
    fn reduced_uses_fallback_without_outer_budget() {
        let _reduced = reduced_timeout(Reduced::new(secs(5)).with_fallback(secs(30)));
        assert_eq!(current_budget(), Some(secs(30)));
    }

    #[test]
    fn reduced_without_outer_or_fallback_has_no_budget() {
        let _reduced = reduced_timeout(Reduced::new(secs(5)));
        assert_eq!(current_budget(), None);
    }

    #[test]
    fn reduced_never_eats_the_whole_budget() {
        let _outer = override_timeout(secs(3));
        let _reduced = reduced_timeout(Reduced::new(secs(5)));
        assert_eq!(current_budget(), Some(secs(3)));
    }

    #[test]
    fn cap_applies_only_inside_bounded_request() {
        let _outer = override_timeout(secs(100));
        let _reduced = reduced_timeout(Reduced::new(secs(5)).with_cap(secs(20)));
        assert_eq!(current_budget(), Some(secs(95)));

        let _request = bounded_request();
        assert_eq!(current_budget(), Some(secs(20)));
    }

    #[test]
    fn nested_reductions_compound() {
        let _outer = override_timeout(secs(100));
        let _a = reduced_timeout(Reduced::new(secs(5)));
        let _b = reduced_timeout(Reduced::new(secs(10)));
        assert_eq!(current_budget(), Some(secs(85)));
    }

    #[test]
    fn deadline_budget_counts_down() {
        let _scope = override_deadline(Instant::now() + secs(60));
        let remaining = current_budget().unwrap();
        assert!(remaining <= secs(60));
        assert!(remaining > secs(59));
    }

    #[test]
    fn expired_deadline_is_zero() {
        let _scope = override_deadline(Instant::now());
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(current_budget(), Some(Duration::ZERO));
    }

    #[test]
    fn scope_is_restored_when_unwinding() {
        let _outer = default_timeout(secs(100));

        let result = std::panic::catch_unwind(|| {
            let _inner = override_timeout(secs(1));
            panic!("boom");
        });

        assert!(result.is_err());
        assert_eq!(current_budget(), Some(secs(100)));
    }

    #[test]
    fn budget_is_not_inherited_by_spawned_threads() {
        let _outer = override_timeout(secs(100));
        let seen = std::thread::spawn(current_budget).join().unwrap();
        assert_eq!(seen, None);
    }

    proptest! {
        #[test]
        fn reduction_stays_positive_and_within_outer(
            outer_ms in 1u64..100_000,
            clearance_ms in 0u64..200_000,
        ) {
            let outer = Duration::from_millis(outer_ms);
            let reduced = Reduced::new(Duration::from_millis(clearance_ms));

            let budget = reduced.apply(Some(outer), false).unwrap();

            prop_assert!(budget > Duration::ZERO);
            prop_assert!(budget <= outer);
        }
    }
}

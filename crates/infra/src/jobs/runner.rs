//! Job runner: claims ready jobs and runs them within their lease.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use jobforge_core::JobId;
use jobforge_jobs::{
    DEFAULT_LEASE_DURATION, DiagnosticContext, InMemoryStatusBus, Job, JobError, JobStatus,
    RetryPolicy, RunError, RunnableJob, StatusBus, Subscription,
};
use jobforge_timeout::{
    BoundedCall, BoundedError, DEFAULT_CANCEL_GRACE, Reduced, Timeout, override_deadline,
    override_timeout, reduced_timeout,
};

use super::report::{ErrorReporter, FailureKind, JobFailure, TracingReporter};
use super::store::{JobStore, JobStoreError};

/// Builds the runnable for a claimed job, usually by decoding its payload.
pub type RunnableFactory =
    Box<dyn Fn(&Job) -> Result<Arc<dyn RunnableJob>, RunError> + Send + Sync>;

/// Job runner configuration.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Name for logging and the runner thread
    pub name: String,
    /// How long to sleep when nothing was ready
    pub poll_interval: Duration,
    /// Lease taken on each job; also the run budget
    pub lease_duration: Duration,
    /// Maximum number of ready jobs fetched per poll
    pub batch_size: usize,
    /// How long a timed-out run gets to react to cancellation
    pub cancel_grace: Duration,
    /// Share of the lease withheld from calls the job makes, so they time out first
    pub clearance: Duration,
}

/// Default time kept back from a job's nested calls.
pub const DEFAULT_CLEARANCE: Duration = Duration::from_secs(1);

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            name: "job-runner".to_string(),
            poll_interval: Duration::from_millis(1000),
            lease_duration: DEFAULT_LEASE_DURATION,
            batch_size: 10,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            clearance: DEFAULT_CLEARANCE,
        }
    }
}

impl JobRunnerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_clearance(mut self, clearance: Duration) -> Self {
        self.clearance = clearance;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Transition(#[from] JobError),
}

/// What happened to a job this runner actually ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Requeued { scheduled_start: DateTime<Utc> },
    Failed { reason: String },
}

/// Runner statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunnerStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_requeued: u64,
    pub lease_conflicts: u64,
    pub uptime_secs: u64,
}

/// Handle to control a spawned runner.
#[derive(Debug)]
pub struct JobRunnerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<RunnerStats>>,
}

impl JobRunnerHandle {
    /// Request graceful shutdown and wait for the current poll to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

enum RunFailure {
    Run(RunError),
    Bounded(BoundedError),
    Panicked(String),
}

impl From<BoundedError> for RunFailure {
    fn from(err: BoundedError) -> Self {
        RunFailure::Bounded(err)
    }
}

enum Disposition {
    Requeue {
        reason: String,
        after: Option<Duration>,
    },
    Fail {
        failure: FailureKind,
        message: String,
    },
}

fn dispose(failure: RunFailure, policy: &RetryPolicy, attempt: u32) -> Disposition {
    let retries_left = policy.should_retry(attempt);
    match failure {
        RunFailure::Run(RunError::Retryable { reason, after }) if retries_left => {
            Disposition::Requeue { reason, after }
        }
        RunFailure::Run(RunError::Retryable { reason, .. }) => Disposition::Fail {
            failure: FailureKind::RetriesExhausted,
            message: reason,
        },
        RunFailure::Run(RunError::User(message)) => Disposition::Fail {
            failure: FailureKind::User,
            message,
        },
        RunFailure::Run(RunError::Fatal(err)) => Disposition::Fail {
            failure: FailureKind::Fatal,
            message: format!("{err:#}"),
        },
        RunFailure::Bounded(err) if err.is_timeout() => {
            if policy.retry_on_timeout && retries_left {
                Disposition::Requeue {
                    reason: err.to_string(),
                    after: None,
                }
            } else {
                Disposition::Fail {
                    failure: FailureKind::Timeout,
                    message: err.to_string(),
                }
            }
        }
        RunFailure::Bounded(err) => Disposition::Fail {
            failure: FailureKind::Fatal,
            message: err.to_string(),
        },
        RunFailure::Panicked(message) => Disposition::Fail {
            failure: FailureKind::Fatal,
            message: format!("job panicked: {message}"),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Background job runner.
///
/// Polls a store for ready jobs, claims each with a lease, and runs it through
/// the factory registered for its kind. Runners share nothing but the store, so
/// any number of them may poll the same one.
pub struct JobRunner<S: JobStore> {
    store: S,
    handlers: HashMap<String, RunnableFactory>,
    bus: Arc<dyn StatusBus>,
    reporter: Arc<dyn ErrorReporter>,
    config: JobRunnerConfig,
    stats: Arc<Mutex<RunnerStats>>,
}

impl<S: JobStore> JobRunner<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            bus: Arc::new(InMemoryStatusBus::new()),
            reporter: Arc::new(TracingReporter),
            config: JobRunnerConfig::default(),
            stats: Arc::default(),
        }
    }

    pub fn with_config(mut self, config: JobRunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn StatusBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &JobRunnerConfig {
        &self.config
    }

    /// Subscribe to every status change this runner persists.
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Register a factory for a job kind.
    ///
    /// `kind_pattern` is an exact kind, a category such as `"mail.*"`, or `"*"`.
    pub fn register<R, F>(&mut self, kind_pattern: impl Into<String>, factory: F)
    where
        R: RunnableJob + 'static,
        F: Fn(&Job) -> Result<R, RunError> + Send + Sync + 'static,
    {
        let factory: RunnableFactory =
            Box::new(move |job: &Job| -> Result<Arc<dyn RunnableJob>, RunError> {
                Ok(Arc::new(factory(job)?))
            });
        self.handlers.insert(kind_pattern.into(), factory);
    }

    fn handler_for(&self, kind: &str) -> Option<&RunnableFactory> {
        if let Some(factory) = self.handlers.get(kind) {
            return Some(factory);
        }

        // Category match: "mail.*" matches "mail.notify"
        for (pattern, factory) in &self.handlers {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                if kind.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('.')) {
                    return Some(factory);
                }
            }
        }

        self.handlers.get("*")
    }

    fn record(&self, update: impl FnOnce(&mut RunnerStats)) {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn lost_race(&self, id: JobId, err: &JobStoreError) {
        warn!(runner = %self.config.name, job_id = %id, error = %err, "job claimed elsewhere, skipping");
        self.record(|stats| stats.lease_conflicts += 1);
    }

    /// Claim and run one job.
    ///
    /// Returns `None` when another runner got the job first.
    pub fn run_job(&self, id: JobId) -> Result<Option<RunOutcome>, RunnerError> {
        let lease = chrono::Duration::from_std(self.config.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::days(365));

        let mut job = match self.store.acquire_lease(id, lease) {
            Ok(job) => job,
            Err(err) if err.is_conflict() => {
                self.lost_race(id, &err);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        if job.status != JobStatus::Waiting {
            debug!(runner = %self.config.name, job_id = %id, status = %job.status, "job no longer waiting");
            self.record(|stats| stats.lease_conflicts += 1);
            return Ok(None);
        }

        let runnable = match self.handler_for(&job.kind) {
            Some(factory) => match panic::catch_unwind(AssertUnwindSafe(|| factory(&job))) {
                Ok(built) => built.map_err(RunFailure::Run),
                Err(payload) => Err(RunFailure::Panicked(panic_message(payload.as_ref()))),
            },
            None => Err(RunFailure::Run(RunError::Fatal(anyhow::anyhow!(
                "no handler registered for job kind {}",
                job.kind
            )))),
        };

        let started = job.start()?;
        match self.store.save(&job, JobStatus::Waiting) {
            Ok(()) => self.bus.publish(started),
            Err(err) if err.is_conflict() => {
                self.lost_race(id, &err);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }
        debug!(
            runner = %self.config.name,
            job_id = %id,
            kind = %job.kind,
            attempt = job.attempt_count,
            "job started"
        );

        let (result, policy, runnable_context) = match runnable {
            Ok(runnable) => (
                panic::catch_unwind(AssertUnwindSafe(|| self.execute(&job, &runnable)))
                    .unwrap_or_else(|payload| {
                        Err(RunFailure::Panicked(panic_message(payload.as_ref())))
                    }),
                runnable.retry_policy(),
                runnable.diagnostic_context(),
            ),
            Err(failure) => (Err(failure), RetryPolicy::no_retry(), DiagnosticContext::new()),
        };

        let (change, outcome, failure) = match result {
            Ok(()) => (job.complete()?, RunOutcome::Completed, None),
            Err(failure) => match dispose(failure, &policy, job.attempt_count) {
                Disposition::Requeue { reason, after } => {
                    let delay = after.unwrap_or_else(|| policy.delay_for_attempt(job.attempt_count));
                    let change = job.queue()?;
                    let now = Utc::now();
                    let at = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|delay| now.checked_add_signed(delay))
                        .unwrap_or(now);
                    job.reschedule(at);
                    job.release_lease();
                    warn!(
                        runner = %self.config.name,
                        job_id = %id,
                        kind = %job.kind,
                        attempt = job.attempt_count,
                        retry_at = %at,
                        reason = %reason,
                        "job requeued"
                    );
                    (change, RunOutcome::Requeued { scheduled_start: at }, None)
                }
                Disposition::Fail { failure, message } => {
                    let change = job.fail()?;
                    let outcome = RunOutcome::Failed {
                        reason: message.clone(),
                    };
                    (change, outcome, Some((failure, message)))
                }
            },
        };

        match self.store.save(&job, JobStatus::Running) {
            Ok(()) => self.bus.publish(change),
            Err(err) if err.is_conflict() => {
                self.lost_race(id, &err);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }

        if let Some((failure, message)) = failure {
            let mut context = runnable_context;
            context.extend(job.diagnostic_context());
            self.reporter.report(&JobFailure {
                job_id: id,
                kind: job.kind.clone(),
                failure,
                message,
                context,
            });
        }

        self.record(|stats| {
            stats.jobs_processed += 1;
            match outcome {
                RunOutcome::Completed => stats.jobs_completed += 1,
                RunOutcome::Requeued { .. } => stats.jobs_requeued += 1,
                RunOutcome::Failed { .. } => stats.jobs_failed += 1,
            }
        });
        debug!(runner = %self.config.name, job_id = %id, outcome = ?outcome, "job finished");
        Ok(Some(outcome))
    }

    /// Run the job's run step on a worker thread, bounded by the lease.
    ///
    /// Calls the job makes see the lease minus the configured clearance, so
    /// their own timeouts fire before the job is cancelled.
    fn execute(&self, job: &Job, runnable: &Arc<dyn RunnableJob>) -> Result<(), RunFailure> {
        let budget = job.lease_timeout();
        let _scope = override_timeout(budget);
        let deadline = Instant::now().checked_add(budget);

        let call = BoundedCall::new(Timeout::Ambient)
            .named(format!("job {}", job.kind))
            .with_cancel_grace(self.config.cancel_grace);
        let worker = Arc::clone(runnable);
        let canceller = Arc::clone(runnable);
        let clearance = self.config.clearance;

        call.run(
            (),
            move || canceller.cancel(),
            move |()| {
                let _deadline = match deadline {
                    Some(deadline) => override_deadline(deadline),
                    None => override_timeout(budget),
                };
                let _reduced = reduced_timeout(Reduced::new(clearance));
                worker.run().map_err(RunFailure::Run)
            },
        )
    }

    /// Run every job that is ready now, up to the batch size.
    pub fn poll_once(&self) -> Result<Vec<(JobId, RunOutcome)>, RunnerError> {
        let ids = self.store.ready_job_ids(self.config.batch_size)?;
        let mut ran = Vec::with_capacity(ids.len());

        for id in ids {
            match self.run_job(id) {
                Ok(Some(outcome)) => ran.push((id, outcome)),
                Ok(None) => {}
                Err(err) => {
                    error!(runner = %self.config.name, job_id = %id, error = %err, "failed to run job");
                }
            }
        }

        Ok(ran)
    }

    /// Spawn the runner in a background thread.
    pub fn spawn(mut self, config: JobRunnerConfig) -> std::io::Result<JobRunnerHandle>
    where
        S: 'static,
    {
        self.config = config;
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::clone(&self.stats);

        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || runner_loop(self, shutdown_rx))?;

        Ok(JobRunnerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn runner_loop<S: JobStore>(runner: JobRunner<S>, shutdown_rx: mpsc::Receiver<()>) {
    info!(runner = %runner.config.name, "job runner started");
    let started = Instant::now();

    loop {
        let ran = match runner.poll_once() {
            Ok(ran) => ran.len(),
            Err(err) => {
                error!(runner = %runner.config.name, error = %err, "failed to poll for ready jobs");
                0
            }
        };
        runner.record(|stats| stats.uptime_secs = started.elapsed().as_secs());

        let idle = if ran == 0 {
            runner.config.poll_interval
        } else {
            Duration::ZERO
        };
        match shutdown_rx.recv_timeout(idle) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(runner = %runner.config.name, "job runner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Succeed;

    impl RunnableJob for Succeed {
        fn run(&self) -> Result<(), RunError> {
            Ok(())
        }
    }

    struct FailWith(fn() -> RunError, RetryPolicy);

    impl RunnableJob for FailWith {
        fn run(&self) -> Result<(), RunError> {
            Err((self.0)())
        }

        fn retry_policy(&self) -> RetryPolicy {
            self.1.clone()
        }

        fn diagnostic_context(&self) -> DiagnosticContext {
            DiagnosticContext::from([("branch".to_string(), "lp:example".to_string())])
        }
    }

    /// Blocks until cancelled.
    #[derive(Default)]
    struct Hang {
        cancelled: Arc<AtomicBool>,
        cancels: Arc<AtomicUsize>,
        policy: Option<RetryPolicy>,
    }

    impl RunnableJob for Hang {
        fn run(&self) -> Result<(), RunError> {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !self.cancelled.load(Ordering::SeqCst) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            Err(RunError::user("interrupted"))
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.cancelled.store(true, Ordering::SeqCst);
        }

        fn retry_policy(&self) -> RetryPolicy {
            self.policy.clone().unwrap_or_else(RetryPolicy::no_retry)
        }
    }

    struct Explode;

    impl RunnableJob for Explode {
        fn run(&self) -> Result<(), RunError> {
            panic!("index out of bounds in scanner");
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        failures: Mutex<Vec<JobFailure>>,
    }

    impl ErrorReporter for RecordingReporter {
        fn report(&self, failure: &JobFailure) {
            self.failures.lock().unwrap().push(failure.clone());
        }
    }

    fn runner() -> (JobRunner<Arc<InMemoryJobStore>>, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::default());
        let runner = JobRunner::new(InMemoryJobStore::arc()).with_reporter(reporter.clone());
        (runner, reporter)
    }

    fn enqueue(runner: &JobRunner<Arc<InMemoryJobStore>>, kind: &str) -> JobId {
        runner
            .store()
            .enqueue(Job::new(kind, serde_json::json!({})).unwrap())
            .unwrap()
    }

    #[test]
    fn successful_run_completes_the_job() {
        let (mut runner, reporter) = runner();
        runner.register("scan", |_job| Ok(Succeed));
        let changes = runner.subscribe();
        let id = enqueue(&runner, "scan");

        let outcome = runner.run_job(id).unwrap();

        assert_eq!(outcome, Some(RunOutcome::Completed));
        let job = runner.store().get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempt_count, 1);
        assert!(job.date_finished.is_some());

        let seen: Vec<_> = changes.drain().into_iter().map(|c| (c.from, c.to)).collect();
        assert_eq!(
            seen,
            vec![
                (JobStatus::Waiting, JobStatus::Running),
                (JobStatus::Running, JobStatus::Completed)
            ]
        );
        assert!(reporter.failures.lock().unwrap().is_empty());
        assert_eq!(runner.stats().jobs_completed, 1);
    }

    #[test]
    fn missing_handler_fails_the_job() {
        let (runner, reporter) = runner();
        let id = enqueue(&runner, "unknown.kind");

        let outcome = runner.run_job(id).unwrap();

        assert!(matches!(outcome, Some(RunOutcome::Failed { .. })));
        assert_eq!(runner.store().get(id).unwrap().unwrap().status, JobStatus::Failed);
        let failures = reporter.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].failure, FailureKind::Fatal);
    }

    #[test]
    fn user_errors_fail_and_carry_diagnostic_context() {
        let (mut runner, reporter) = runner();
        runner.register("mail.notify", |_job| {
            Ok(FailWith(|| RunError::user("no such address"), RetryPolicy::no_retry()))
        });
        let id = enqueue(&runner, "mail.notify");

        runner.run_job(id).unwrap();

        let failures = reporter.failures.lock().unwrap();
        assert_eq!(failures[0].failure, FailureKind::User);
        assert_eq!(failures[0].message, "no such address");
        assert_eq!(failures[0].context["branch"], "lp:example");
        assert_eq!(failures[0].context["job_id"], id.to_string());
        assert_eq!(failures[0].context["job_status"], "FAILED");
    }

    #[test]
    fn retryable_failure_is_requeued_with_backoff() {
        let (mut runner, reporter) = runner();
        runner.register("scan", |_job| {
            Ok(FailWith(
                || RunError::retryable("mirror busy"),
                RetryPolicy::fixed(2, Duration::from_secs(60)),
            ))
        });
        let id = enqueue(&runner, "scan");

        let outcome = runner.run_job(id).unwrap();

        let Some(RunOutcome::Requeued { scheduled_start }) = outcome else {
            panic!("expected requeue, got {outcome:?}");
        };
        let job = runner.store().get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.scheduled_start, Some(scheduled_start));
        assert!(job.lease_expires.is_none());
        assert!(job.date_finished.is_some());
        assert!(scheduled_start > Utc::now() + chrono::Duration::seconds(50));
        assert!(runner.store().ready_job_ids(10).unwrap().is_empty());
        assert!(reporter.failures.lock().unwrap().is_empty());
    }

    #[test]
    fn retries_run_out() {
        let (mut runner, reporter) = runner();
        runner.register("scan", |_job| {
            Ok(FailWith(
                || RunError::retry_after("mirror busy", Duration::ZERO),
                RetryPolicy::fixed(1, Duration::ZERO),
            ))
        });
        let id = enqueue(&runner, "scan");

        assert!(matches!(runner.run_job(id).unwrap(), Some(RunOutcome::Requeued { .. })));
        assert!(matches!(runner.run_job(id).unwrap(), Some(RunOutcome::Failed { .. })));

        let job = runner.store().get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 2);
        assert_eq!(reporter.failures.lock().unwrap()[0].failure, FailureKind::RetriesExhausted);
    }

    #[test]
    fn overrunning_job_is_cancelled_and_failed() {
        let (runner, reporter) = runner();
        let mut runner = runner.with_config(
            JobRunnerConfig::default()
                .with_lease_duration(Duration::from_millis(100))
                .with_cancel_grace(Duration::from_secs(2)),
        );
        let cancels = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cancels);
        runner.register("build", move |_job| {
            Ok(Hang {
                cancels: Arc::clone(&counter),
                ..Hang::default()
            })
        });
        let id = enqueue(&runner, "build");

        let started = Instant::now();
        let outcome = runner.run_job(id).unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(outcome, Some(RunOutcome::Failed { .. })));
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.failures.lock().unwrap()[0].failure, FailureKind::Timeout);
    }

    #[test]
    fn overrunning_job_is_requeued_when_timeouts_are_retryable() {
        let (runner, _reporter) = runner();
        let mut runner = runner.with_config(
            JobRunnerConfig::default().with_lease_duration(Duration::from_millis(50)),
        );
        runner.register("build", |_job| {
            Ok(Hang {
                policy: Some(RetryPolicy::fixed(3, Duration::from_secs(1)).retrying_timeouts()),
                ..Hang::default()
            })
        });
        let id = enqueue(&runner, "build");

        let outcome = runner.run_job(id).unwrap();

        assert!(matches!(outcome, Some(RunOutcome::Requeued { .. })));
        assert_eq!(runner.stats().jobs_requeued, 1);
    }

    #[test]
    fn panicking_run_fails_the_job_as_fatal() {
        let (mut runner, reporter) = runner();
        runner.register("scan", |_job| Ok(Explode));
        let changes = runner.subscribe();
        let id = enqueue(&runner, "scan");

        let outcome = runner.run_job(id).unwrap();

        let Some(RunOutcome::Failed { reason }) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(reason.contains("index out of bounds in scanner"), "{reason}");
        let job = runner.store().get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(changes.drain().last().map(|c| c.to), Some(JobStatus::Failed));
        let failures = reporter.failures.lock().unwrap();
        assert_eq!(failures[0].failure, FailureKind::Fatal);
    }

    #[test]
    fn panicking_factory_fails_the_job_as_fatal() {
        let (mut runner, reporter) = runner();
        runner.register("scan", |job: &Job| -> Result<Succeed, RunError> {
            panic!("cannot decode {}", job.kind)
        });
        let id = enqueue(&runner, "scan");

        let outcome = runner.run_job(id).unwrap();

        assert!(matches!(
            outcome,
            Some(RunOutcome::Failed { ref reason }) if reason.contains("cannot decode scan")
        ));
        assert_eq!(runner.store().get(id).unwrap().unwrap().status, JobStatus::Failed);
        assert_eq!(reporter.failures.lock().unwrap()[0].failure, FailureKind::Fatal);
    }

    #[test]
    fn spawned_runner_survives_a_panicking_job() {
        let store = InMemoryJobStore::arc();
        let mut runner = JobRunner::new(Arc::clone(&store));
        runner.register("explode", |_job| Ok(Explode));
        runner.register("scan", |_job| Ok(Succeed));
        let bad = store.enqueue(Job::new("explode", serde_json::Value::Null).unwrap()).unwrap();

        let handle = runner
            .spawn(JobRunnerConfig::default().with_poll_interval(Duration::from_millis(10)))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().jobs_failed == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let good = store.enqueue(Job::new("scan", serde_json::Value::Null).unwrap()).unwrap();
        while handle.stats().jobs_completed == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!((stats.jobs_failed, stats.jobs_completed), (1, 1));
        assert_eq!(store.get(bad).unwrap().unwrap().status, JobStatus::Failed);
        assert_eq!(store.get(good).unwrap().unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn nested_calls_see_the_lease_minus_clearance() {
        struct ReadBudget(Arc<Mutex<Option<Duration>>>);

        impl RunnableJob for ReadBudget {
            fn run(&self) -> Result<(), RunError> {
                *self.0.lock().unwrap() = jobforge_timeout::current_budget();
                Ok(())
            }
        }

        let (runner, _reporter) = runner();
        let mut runner = runner.with_config(
            JobRunnerConfig::default()
                .with_lease_duration(Duration::from_secs(30))
                .with_clearance(Duration::from_secs(10)),
        );
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        runner.register("scan", move |_job| Ok(ReadBudget(Arc::clone(&slot))));
        let id = enqueue(&runner, "scan");

        runner.run_job(id).unwrap();

        let budget = seen.lock().unwrap().expect("budget inside the job");
        assert!(budget <= Duration::from_secs(20), "{budget:?}");
        assert!(budget > Duration::from_secs(15), "{budget:?}");
    }

    #[test]
    fn leased_job_is_skipped() {
        let (mut runner, _reporter) = runner();
        runner.register("scan", |_job| Ok(Succeed));
        let id = enqueue(&runner, "scan");
        runner.store().acquire_lease(id, chrono::Duration::seconds(60)).unwrap();

        assert_eq!(runner.run_job(id).unwrap(), None);
        assert_eq!(runner.store().get(id).unwrap().unwrap().status, JobStatus::Waiting);
        assert_eq!(runner.stats().lease_conflicts, 1);
    }

    #[test]
    fn routing_prefers_exact_then_category_then_wildcard() {
        let (mut runner, _reporter) = runner();
        let hits = Arc::new(Mutex::new(Vec::new()));
        for pattern in ["mail.notify", "mail.*", "*"] {
            let hits = Arc::clone(&hits);
            runner.register(pattern, move |job| {
                hits.lock().unwrap().push((pattern, job.kind.clone()));
                Ok(Succeed)
            });
        }

        for kind in ["mail.notify", "mail.digest", "mailbox.scan", "scan"] {
            let id = enqueue(&runner, kind);
            runner.run_job(id).unwrap();
        }

        let hits = hits.lock().unwrap();
        assert_eq!(
            *hits,
            vec![
                ("mail.notify", "mail.notify".to_string()),
                ("mail.*", "mail.digest".to_string()),
                ("*", "mailbox.scan".to_string()),
                ("*", "scan".to_string()),
            ]
        );
    }

    #[test]
    fn poll_once_runs_every_ready_job() {
        let (mut runner, _reporter) = runner();
        runner.register("*", |_job| Ok(Succeed));
        for _ in 0..3 {
            enqueue(&runner, "batch");
        }
        let later = runner
            .store()
            .enqueue(
                Job::new("batch", serde_json::Value::Null)
                    .unwrap()
                    .delayed(Duration::from_secs(3600)),
            )
            .unwrap();

        let ran = runner.poll_once().unwrap();

        assert_eq!(ran.len(), 3);
        assert!(ran.iter().all(|(_, outcome)| *outcome == RunOutcome::Completed));
        assert_eq!(runner.store().get(later).unwrap().unwrap().status, JobStatus::Waiting);
    }

    #[test]
    fn spawned_runner_processes_jobs_until_shutdown() {
        let store = InMemoryJobStore::arc();
        let mut runner = JobRunner::new(Arc::clone(&store));
        runner.register("*", |_job| Ok(Succeed));
        let id = store.enqueue(Job::new("bg", serde_json::Value::Null).unwrap()).unwrap();

        let handle = runner
            .spawn(
                JobRunnerConfig::default()
                    .with_name("test-runner")
                    .with_poll_interval(Duration::from_millis(10)),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().jobs_completed == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Completed);
    }
}

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{
    JobContext, JobHandler, JobSpec, JobStats, ShutdownOutcome, Trigger, TriggerOutcome,
};
use crate::clock::Clock;
use crate::error::{Error, ErrorDetails};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

#[derive(Default)]
struct LastRun {
    error: Option<String>,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
}

struct RegisteredJob {
    name: Arc<str>,
    trigger: Trigger,
    singleton: bool,
    timeout: Duration,
    handler: JobHandler,
    running: AtomicBool,
    active: AtomicUsize,
    runs: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    rescheduled: AtomicU64,
    last: Mutex<LastRun>,
}

impl RegisteredJob {
    fn from_spec(spec: JobSpec) -> Self {
        Self {
            name: Arc::from(spec.name),
            trigger: spec.trigger,
            singleton: spec.singleton,
            timeout: spec.timeout,
            handler: spec.handler,
            running: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            runs: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            rescheduled: AtomicU64::new(0),
            last: Mutex::new(LastRun::default()),
        }
    }

    fn last(&self) -> MutexGuard<'_, LastRun> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_start(&self, at: DateTime<Utc>) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.last().started = Some(at);
    }

    fn record_finish(&self, result: &Result<(), Error>, at: DateTime<Utc>) {
        let outcome = match result {
            Ok(()) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                "success"
            }
            Err(e) => match e.get_details() {
                ErrorDetails::JobCancelled { .. } => {
                    self.cancellations.fetch_add(1, Ordering::Relaxed);
                    "cancelled"
                }
                ErrorDetails::JobTimeout { .. } => {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    "timeout"
                }
                _ => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    "failure"
                }
            },
        };
        metrics::counter!(
            "meter_job_runs_total",
            "job" => self.name.to_string(),
            "outcome" => outcome
        )
        .increment(1);

        let mut last = self.last();
        last.finished = Some(at);
        if let Err(e) = result {
            last.error = Some(e.to_string());
        }
    }

    fn stats(&self) -> JobStats {
        let last = self.last();
        JobStats {
            runs: self.runs.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            rescheduled: self.rescheduled.load(Ordering::Relaxed),
            running: self.active.load(Ordering::Acquire),
            last_error: last.error.clone(),
            last_started: last.started,
            last_finished: last.finished,
        }
    }
}

/// Clears the running markers however the invocation ends.
struct RunGuard(Arc<RegisteredJob>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
        if self.0.singleton {
            self.0.running.store(false, Ordering::Release);
        }
    }
}

struct Inner {
    jobs: DashMap<String, Arc<RegisteredJob>>,
    lifecycle: Mutex<Lifecycle>,
    timezone: Tz,
    clock: Arc<dyn Clock>,
    /// Stops the trigger loops
    trigger_token: CancellationToken,
    /// Parent of every invocation's token; only cancelled when the grace period runs out
    job_token: CancellationToken,
    loops: TaskTracker,
    invocations: TaskTracker,
}

/// Owns every periodic job of the process.
///
/// Constructed once by whatever composes the process and stopped explicitly.
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct SchedulerManager {
    inner: Arc<Inner>,
}

impl SchedulerManager {
    pub fn new(timezone: Tz, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: DashMap::new(),
                lifecycle: Mutex::new(Lifecycle::Created),
                timezone,
                clock,
                trigger_token: CancellationToken::new(),
                job_token: CancellationToken::new(),
                loops: TaskTracker::new(),
                invocations: TaskTracker::new(),
            }),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.inner.timezone
    }

    /// Adds a job. Registering on a running scheduler starts its trigger loop
    /// right away.
    pub fn register(&self, spec: JobSpec) -> Result<(), Error> {
        if let Trigger::Interval { period, .. } = &spec.trigger {
            if period.is_zero() {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!("Job `{}` has a zero interval", spec.name),
                }));
            }
        }

        let lifecycle = self.inner.lifecycle();
        if *lifecycle == Lifecycle::Stopped {
            return Err(Error::new(ErrorDetails::SchedulerState {
                message: format!("cannot register `{}` after stop", spec.name),
            }));
        }
        if self.inner.jobs.contains_key(&spec.name) {
            return Err(Error::new(ErrorDetails::SchedulerState {
                message: format!("a job named `{}` is already registered", spec.name),
            }));
        }

        let job = Arc::new(RegisteredJob::from_spec(spec));
        info!(
            job = %job.name,
            trigger = %job.trigger.describe(),
            singleton = job.singleton,
            "Registered job"
        );
        self.inner
            .jobs
            .insert(job.name.to_string(), Arc::clone(&job));
        if *lifecycle == Lifecycle::Running {
            self.inner.spawn_loop(job);
        }
        Ok(())
    }

    pub fn start(&self) -> Result<(), Error> {
        let mut lifecycle = self.inner.lifecycle();
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running => {
                return Err(Error::new(ErrorDetails::SchedulerState {
                    message: "already running".to_string(),
                }))
            }
            Lifecycle::Stopped => {
                return Err(Error::new(ErrorDetails::SchedulerState {
                    message: "cannot restart a stopped scheduler".to_string(),
                }))
            }
        }
        *lifecycle = Lifecycle::Running;
        for job in self.inner.jobs.iter() {
            self.inner.spawn_loop(Arc::clone(job.value()));
        }
        info!(
            jobs = self.inner.jobs.len(),
            timezone = %self.inner.timezone,
            "Scheduler started"
        );
        Ok(())
    }

    /// Fires a job now, outside its trigger. Singleton rules apply.
    pub fn trigger(&self, name: &str) -> Result<TriggerOutcome, Error> {
        let lifecycle = self.inner.lifecycle();
        if *lifecycle != Lifecycle::Running {
            return Err(Error::new(ErrorDetails::SchedulerState {
                message: format!("cannot trigger `{name}` while not running"),
            }));
        }
        let job = self
            .inner
            .jobs
            .get(name)
            .map(|job| Arc::clone(job.value()))
            .ok_or_else(|| {
                Error::new(ErrorDetails::JobNotFound {
                    job: name.to_string(),
                })
            })?;
        Ok(self.inner.fire(&job))
    }

    pub fn stats(&self, name: &str) -> Option<JobStats> {
        self.inner.jobs.get(name).map(|job| job.stats())
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.jobs.iter().map(|j| j.key().clone()).collect();
        names.sort();
        names
    }

    /// Stops accepting firings, then waits up to `grace` for running
    /// invocations. Invocations still running after that are cancelled and
    /// awaited before returning, so nothing is left behind.
    pub async fn stop(&self, grace: Duration) -> ShutdownOutcome {
        {
            let mut lifecycle = self.inner.lifecycle();
            *lifecycle = Lifecycle::Stopped;
        }
        self.inner.trigger_token.cancel();
        self.inner.loops.close();
        self.inner.loops.wait().await;

        self.inner.invocations.close();
        if tokio::time::timeout(grace, self.inner.invocations.wait())
            .await
            .is_ok()
        {
            info!("Scheduler stopped cleanly");
            return ShutdownOutcome::Clean;
        }

        let mut cancelled: Vec<String> = self
            .inner
            .jobs
            .iter()
            .filter(|job| job.active.load(Ordering::Acquire) > 0)
            .map(|job| job.key().clone())
            .collect();
        cancelled.sort();
        warn!(
            grace_ms = grace.as_millis() as u64,
            jobs = ?cancelled,
            "Shutdown grace period elapsed, cancelling running jobs"
        );
        self.inner.job_token.cancel();
        self.inner.invocations.wait().await;
        ShutdownOutcome::Forced { cancelled }
    }
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_loop(self: &Arc<Self>, job: Arc<RegisteredJob>) {
        let inner = Arc::clone(self);
        self.loops.spawn(async move { inner.run_loop(job).await });
    }

    async fn run_loop(self: Arc<Self>, job: Arc<RegisteredJob>) {
        match &job.trigger {
            Trigger::Interval {
                period,
                run_immediately,
            } => {
                let first = if *run_immediately {
                    Instant::now()
                } else {
                    Instant::now() + *period
                };
                let mut ticker = tokio::time::interval_at(first, *period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        () = self.trigger_token.cancelled() => break,
                        _ = ticker.tick() => {
                            self.fire(&job);
                        }
                    }
                }
            }
            Trigger::Cron { .. } => {
                let mut last_fired: Option<DateTime<Utc>> = None;
                loop {
                    let now = self.clock.now();
                    // Never hand back an occurrence that already fired
                    let after = last_fired.map_or(now, |fired| fired.max(now));
                    let Some(next) = job.trigger.next_fire(self.timezone, after) else {
                        warn!(job = %job.name, "Cron expression has no future occurrence");
                        break;
                    };
                    let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                    debug!(job = %job.name, %next, "Next cron occurrence");
                    tokio::select! {
                        biased;
                        () = self.trigger_token.cancelled() => break,
                        () = tokio::time::sleep(wait) => {
                            last_fired = Some(next);
                            self.fire(&job);
                        }
                    }
                }
            }
        }
        debug!(job = %job.name, "Trigger loop exited");
    }

    fn fire(&self, job: &Arc<RegisteredJob>) -> TriggerOutcome {
        if job.singleton
            && job
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            job.rescheduled.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("meter_job_rescheduled_total", "job" => job.name.to_string())
                .increment(1);
            info!(
                job = %job.name,
                "Previous run still in progress, waiting for the next occurrence"
            );
            return TriggerOutcome::Rescheduled;
        }

        job.active.fetch_add(1, Ordering::AcqRel);
        let ctx = JobContext {
            job: Arc::clone(&job.name),
            fired_at: self.clock.now(),
            cancel: self.job_token.child_token(),
        };
        self.invocations
            .spawn(invoke(Arc::clone(job), ctx, Arc::clone(&self.clock)));
        TriggerOutcome::Started
    }
}

async fn invoke(job: Arc<RegisteredJob>, ctx: JobContext, clock: Arc<dyn Clock>) {
    let _guard = RunGuard(Arc::clone(&job));
    job.record_start(ctx.fired_at);
    debug!(job = %job.name, "Job started");

    let name = job.name.to_string();
    let cancel = ctx.cancel.clone();
    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::new(ErrorDetails::JobCancelled { job: name })),
        outcome = tokio::time::timeout(job.timeout, (job.handler)(ctx)) => match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::new(ErrorDetails::JobFailed {
                job: name,
                message: e.to_string(),
            })),
            Err(_) => Err(Error::new(ErrorDetails::JobTimeout {
                job: name,
                timeout_ms: job.timeout.as_millis() as u64,
            })),
        },
    };

    if result.is_ok() {
        debug!(job = %job.name, "Job finished");
    }
    job.record_finish(&result, clock.now());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::scheduler::handler;
    use tracing_test::traced_test;

    fn manager() -> SchedulerManager {
        SchedulerManager::new(chrono_tz::Asia::Shanghai, Arc::new(SystemClock))
    }

    fn far_interval() -> Trigger {
        Trigger::interval(Duration::from_secs(36_000), false)
    }

    #[tokio::test]
    async fn test_singleton_second_firing_is_rescheduled() {
        let scheduler = manager();
        let gate = CancellationToken::new();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (g, c, p) = (gate.clone(), current.clone(), peak.clone());
        scheduler
            .register(JobSpec::new(
                "slow",
                far_interval(),
                handler(move |_ctx| {
                    let (g, c, p) = (g.clone(), c.clone(), p.clone());
                    async move {
                        let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                        p.fetch_max(now, Ordering::SeqCst);
                        g.cancelled().await;
                        c.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            ))
            .unwrap();
        scheduler.start().unwrap();

        assert_eq!(scheduler.trigger("slow").unwrap(), TriggerOutcome::Started);
        assert_eq!(
            scheduler.trigger("slow").unwrap(),
            TriggerOutcome::Rescheduled
        );

        gate.cancel();
        assert_eq!(
            scheduler.stop(Duration::from_secs(5)).await,
            ShutdownOutcome::Clean
        );
        let stats = scheduler.stats("slow").unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(stats.runs, 1);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.rescheduled, 1);
        assert_eq!(stats.running, 0);
    }

    #[tokio::test]
    async fn test_non_singleton_runs_concurrently() {
        let scheduler = manager();
        let gate = CancellationToken::new();
        let g = gate.clone();
        scheduler
            .register(
                JobSpec::new(
                    "parallel",
                    far_interval(),
                    handler(move |_ctx| {
                        let g = g.clone();
                        async move {
                            g.cancelled().await;
                            Ok(())
                        }
                    }),
                )
                .singleton(false),
            )
            .unwrap();
        scheduler.start().unwrap();

        assert_eq!(scheduler.trigger("parallel").unwrap(), TriggerOutcome::Started);
        assert_eq!(scheduler.trigger("parallel").unwrap(), TriggerOutcome::Started);
        assert_eq!(scheduler.stats("parallel").unwrap().running, 2);

        gate.cancel();
        scheduler.stop(Duration::from_secs(5)).await;
        assert_eq!(scheduler.stats("parallel").unwrap().successes, 2);
    }

    #[traced_test]
    #[tokio::test]
    async fn test_forced_stop_cancels_without_error_log() {
        let scheduler = manager();
        scheduler
            .register(JobSpec::new(
                "stuck",
                far_interval(),
                handler(|_ctx| async {
                    std::future::pending::<()>().await;
                    Ok(())
                }),
            ))
            .unwrap();
        scheduler.start().unwrap();
        scheduler.trigger("stuck").unwrap();

        let outcome = scheduler.stop(Duration::from_millis(50)).await;
        assert_eq!(
            outcome,
            ShutdownOutcome::Forced {
                cancelled: vec!["stuck".to_string()]
            }
        );
        let stats = scheduler.stats("stuck").unwrap();
        assert_eq!(stats.cancellations, 1);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.running, 0);
        assert!(logs_contain("was cancelled by shutdown"));
        assert!(!logs_contain("ERROR"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_recorded_as_timeout() {
        let scheduler = manager();
        scheduler
            .register(
                JobSpec::new(
                    "slow_rollup",
                    far_interval(),
                    handler(|_ctx| async {
                        std::future::pending::<()>().await;
                        Ok(())
                    }),
                )
                .timeout(Duration::from_secs(60)),
            )
            .unwrap();
        scheduler.start().unwrap();
        scheduler.trigger("slow_rollup").unwrap();

        assert_eq!(
            scheduler.stop(Duration::from_secs(300)).await,
            ShutdownOutcome::Clean
        );
        let stats = scheduler.stats("slow_rollup").unwrap();
        assert_eq!(stats.timeouts, 1);
        assert!(stats.last_error.unwrap().contains("deadline"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_runs_immediately_then_on_period() {
        let scheduler = manager();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        scheduler
            .register(JobSpec::new(
                "tick",
                Trigger::interval(Duration::from_secs(60), true),
                handler(move |_ctx| {
                    let r = r.clone();
                    async move {
                        r.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            ))
            .unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_secs(130)).await;
        scheduler.stop(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_isolated() {
        let scheduler = manager();
        let healthy = Arc::new(AtomicUsize::new(0));
        let h = healthy.clone();
        scheduler
            .register(JobSpec::new(
                "broken",
                far_interval(),
                handler(|_ctx| async {
                    Err(Error::new(ErrorDetails::Database {
                        message: "connection refused".to_string(),
                    }))
                }),
            ))
            .unwrap();
        scheduler
            .register(JobSpec::new(
                "healthy",
                far_interval(),
                handler(move |_ctx| {
                    let h = h.clone();
                    async move {
                        h.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            ))
            .unwrap();
        scheduler.start().unwrap();

        scheduler.trigger("broken").unwrap();
        scheduler.trigger("healthy").unwrap();
        scheduler.stop(Duration::from_secs(5)).await;

        let broken = scheduler.stats("broken").unwrap();
        assert_eq!(broken.failures, 1);
        assert!(broken.last_error.unwrap().contains("connection refused"));
        assert_eq!(healthy.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let scheduler = manager();
        let noop = || handler(|_ctx| async { Ok(()) });
        scheduler
            .register(JobSpec::new("a", far_interval(), noop()))
            .unwrap();
        assert!(scheduler
            .register(JobSpec::new("a", far_interval(), noop()))
            .is_err());
        assert!(scheduler
            .register(JobSpec::new(
                "zero",
                Trigger::interval(Duration::ZERO, false),
                noop()
            ))
            .is_err());
        assert!(scheduler.trigger("a").is_err());

        scheduler.start().unwrap();
        assert!(scheduler.start().is_err());
        let err = scheduler.trigger("missing").unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::JobNotFound { .. }));

        scheduler.stop(Duration::from_secs(1)).await;
        assert!(scheduler.trigger("a").is_err());
        assert!(scheduler
            .register(JobSpec::new("b", far_interval(), noop()))
            .is_err());
        assert_eq!(scheduler.job_names(), vec!["a".to_string()]);
    }
}

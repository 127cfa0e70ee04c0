//! # Job Records
//!
//! A job is an explicit record `{name, cadence, mode, work}` plus the
//! metrics the scheduler mutates on every tick. The name is the only
//! identity a job has: every registration under one name shares one
//! [`ExecutionGate`], so executions never overlap across a replacement.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::rules::{PositionLookup, RuleCheck, ScheduleRules};

/// Boxed future returned by one job execution.
pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Unit of periodic work. Called once per tick.
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Held for the whole of one execution of a named job.
pub type ExecutionGate = Arc<tokio::sync::Mutex<()>>;

/// Wraps an async closure as a [`JobFn`].
///
/// # Examples
///
/// ```
/// use recon_relay::scheduler::job_fn;
///
/// let work = job_fn(|| async { Ok(()) });
/// ```
pub fn job_fn<F, Fut>(f: F) -> JobFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as JobFuture)
}

/// Wraps a synchronous closure as a [`JobFn`].
///
/// The body runs on the blocking pool so a slow synchronous job never
/// holds up a dispatch loop.
pub fn blocking_job<F>(f: F) -> JobFn
where
    F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move || {
        let f = Arc::clone(&f);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || f())
                .await
                .map_err(|e| anyhow::anyhow!("blocking job did not complete: {}", e))?
        }) as JobFuture
    })
}

/// How ticks of a job are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// The timer spawns each execution as its own task and keeps ticking.
    /// A tick that lands while the previous execution is still running is
    /// skipped, so a job never overlaps with itself.
    FireAndContinue,
    /// The dispatch loop awaits each execution before arming the next delay.
    AwaitBeforeRearm,
}

/// Interval shared between a job and whoever tunes it.
///
/// The scheduler re-reads the value after every tick, so a job can change
/// its own cadence by writing here.
#[derive(Debug, Clone)]
pub struct SharedInterval {
    millis: Arc<AtomicU64>,
}

impl SharedInterval {
    /// Creates a shared interval starting at `initial`.
    pub fn new(initial: Duration) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(initial.as_millis() as u64)),
        }
    }

    /// Current interval.
    pub fn get(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::Acquire))
    }

    /// Replaces the interval used from the next tick on.
    pub fn set(&self, interval: Duration) {
        self.millis
            .store(interval.as_millis() as u64, Ordering::Release);
    }
}

/// Where a job reads its interval from.
#[derive(Debug, Clone)]
pub enum Cadence {
    /// Fixed at registration.
    Fixed(Duration),
    /// Read from a [`SharedInterval`] after every tick.
    Shared(SharedInterval),
}

impl Cadence {
    /// Interval to wait before the next tick.
    pub fn current(&self) -> Duration {
        match self {
            Cadence::Fixed(interval) => *interval,
            Cadence::Shared(shared) => shared.get(),
        }
    }
}

/// Registration options for [`JobScheduler::schedule_with`](super::JobScheduler::schedule_with).
#[derive(Clone)]
pub struct JobOptions {
    pub cadence: Cadence,
    /// `None` uses the scheduler's default mode.
    pub mode: Option<DispatchMode>,
    /// Checked before each tick; a `false` skips the tick.
    pub rule: Option<RuleCheck>,
}

impl std::fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOptions")
            .field("cadence", &self.cadence)
            .field("mode", &self.mode)
            .field("rule", &self.rule.is_some())
            .finish()
    }
}

impl JobOptions {
    /// Fixed interval, default dispatch mode.
    pub fn every(interval: Duration) -> Self {
        Self {
            cadence: Cadence::Fixed(interval),
            mode: None,
            rule: None,
        }
    }

    /// Self-adjusting interval, default dispatch mode.
    pub fn shared(interval: SharedInterval) -> Self {
        Self {
            cadence: Cadence::Shared(interval),
            mode: None,
            rule: None,
        }
    }

    /// Await each execution before re-arming.
    pub fn serialized(mut self) -> Self {
        self.mode = Some(DispatchMode::AwaitBeforeRearm);
        self
    }

    /// Spawn each execution and keep the timer running.
    pub fn fire_and_continue(mut self) -> Self {
        self.mode = Some(DispatchMode::FireAndContinue);
        self
    }

    /// Run only while `check` returns `true`.
    pub fn when(mut self, check: RuleCheck) -> Self {
        self.rule = Some(check);
        self
    }

    /// Run only inside `rules`. Empty rules leave the job ungated.
    pub fn with_rules(self, rules: ScheduleRules, position: PositionLookup) -> Self {
        if rules.is_empty() {
            self
        } else {
            self.when(rules.into_check(position))
        }
    }
}

/// Per-job metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobMetrics {
    /// Completed executions (successful or not).
    pub run_count: u64,
    /// Start time of the last completed execution.
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_duration: Option<Duration>,
    /// Error of the last execution, `None` if it succeeded.
    pub last_error: Option<String>,
    /// Ticks dropped because the previous execution was still in flight.
    pub skipped_ticks: u64,
    /// Ticks dropped because the job's rules did not hold.
    pub skipped_by_rules: u64,
    /// When the next tick is due.
    pub next_run_at: Option<DateTime<Utc>>,
    pub interval: Duration,
    pub mode: DispatchMode,
}

impl JobMetrics {
    fn new(interval: Duration, mode: DispatchMode) -> Self {
        Self {
            run_count: 0,
            last_run_at: None,
            last_duration: None,
            last_error: None,
            skipped_ticks: 0,
            skipped_by_rules: 0,
            next_run_at: due_after(interval),
            interval,
            mode,
        }
    }
}

fn due_after(delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay).ok().map(|d| Utc::now() + d)
}

/// A registered job.
pub struct ScheduledJob {
    name: String,
    cadence: Cadence,
    mode: DispatchMode,
    work: JobFn,
    gate: ExecutionGate,
    rule: Option<RuleCheck>,
    metrics: Mutex<JobMetrics>,
}

impl std::fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("name", &self.name)
            .field("cadence", &self.cadence)
            .field("mode", &self.mode)
            .field("gated_by_rules", &self.rule.is_some())
            .finish_non_exhaustive()
    }
}

impl ScheduledJob {
    pub(crate) fn new(name: String, cadence: Cadence, mode: DispatchMode, work: JobFn) -> Self {
        let metrics = JobMetrics::new(cadence.current(), mode);
        Self {
            name,
            cadence,
            mode,
            work,
            gate: Arc::new(tokio::sync::Mutex::new(())),
            rule: None,
            metrics: Mutex::new(metrics),
        }
    }

    /// Shares `gate` with earlier registrations of the same name.
    pub(crate) fn gated(mut self, gate: ExecutionGate) -> Self {
        self.gate = gate;
        self
    }

    pub(crate) fn with_rule(mut self, rule: Option<RuleCheck>) -> Self {
        self.rule = rule;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn cadence(&self) -> &Cadence {
        &self.cadence
    }

    /// Metrics with the interval refreshed from the cadence.
    pub fn metrics(&self) -> JobMetrics {
        let mut snapshot = self.lock_metrics().clone();
        snapshot.interval = self.cadence.current();
        snapshot
    }

    pub(crate) fn gate(&self) -> &ExecutionGate {
        &self.gate
    }

    /// Whether the job's rules let the current tick run.
    pub(crate) fn rules_allow(&self) -> bool {
        self.rule.as_ref().map_or(true, |check| check())
    }

    /// Waits for the gate, then runs the work once.
    pub(crate) async fn execute(&self) {
        let _permit = self.gate.lock().await;
        self.run_body().await;
    }

    /// Runs the work once and records the outcome. The caller holds the
    /// gate. Never panics: a panic inside the body is recorded as the
    /// job's error.
    pub(crate) async fn run_body(&self) {
        let started_at = Utc::now();
        let start = Instant::now();

        let outcome = AssertUnwindSafe(async { (self.work)().await })
            .catch_unwind()
            .await;
        let elapsed = start.elapsed();

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(panic) => Some(format!("job panicked: {}", panic_message(&panic))),
        };

        match &error {
            Some(e) => warn!(job = %self.name, error = %e, "Scheduled job failed"),
            None => debug!(job = %self.name, elapsed_ms = elapsed.as_millis() as u64, "Scheduled job finished"),
        }

        let mut metrics = self.lock_metrics();
        metrics.run_count += 1;
        metrics.last_run_at = Some(started_at);
        metrics.last_duration = Some(elapsed);
        metrics.last_error = error;
    }

    pub(crate) fn record_skip(&self) {
        self.lock_metrics().skipped_ticks += 1;
    }

    pub(crate) fn record_rule_skip(&self) {
        self.lock_metrics().skipped_by_rules += 1;
    }

    pub(crate) fn record_next_run(&self, delay: Duration) {
        self.lock_metrics().next_run_at = due_after(delay);
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, JobMetrics> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_interval_roundtrip() {
        let shared = SharedInterval::new(Duration::from_secs(2));
        let clone = shared.clone();
        clone.set(Duration::from_secs(8));
        assert_eq!(shared.get(), Duration::from_secs(8));
        assert_eq!(Cadence::Shared(shared).current(), Duration::from_secs(8));
    }

    #[test]
    fn test_job_options_modes() {
        let opts = JobOptions::every(Duration::from_secs(1));
        assert_eq!(opts.mode, None);
        assert_eq!(
            opts.clone().serialized().mode,
            Some(DispatchMode::AwaitBeforeRearm)
        );
        assert_eq!(
            opts.fire_and_continue().mode,
            Some(DispatchMode::FireAndContinue)
        );
    }

    #[test]
    fn test_empty_rules_leave_job_ungated() {
        let opts = JobOptions::every(Duration::from_secs(1))
            .with_rules(ScheduleRules::default(), Arc::new(|| None));
        assert!(opts.rule.is_none());
    }

    #[test]
    fn test_rule_check_is_consulted() {
        let job = ScheduledJob::new(
            "gated".to_string(),
            Cadence::Fixed(Duration::from_secs(1)),
            DispatchMode::AwaitBeforeRearm,
            job_fn(|| async { Ok(()) }),
        );
        assert!(job.rules_allow());

        let job = job.with_rule(Some(Arc::new(|| false)));
        assert!(!job.rules_allow());
    }

    #[test]
    fn test_new_job_reports_next_run() {
        let job = ScheduledJob::new(
            "later".to_string(),
            Cadence::Fixed(Duration::from_secs(60)),
            DispatchMode::AwaitBeforeRearm,
            job_fn(|| async { Ok(()) }),
        );
        let next = job.metrics().next_run_at.unwrap();
        assert!(next > Utc::now());
        assert_eq!(job.metrics().skipped_by_rules, 0);
    }

    #[tokio::test]
    async fn test_execute_records_success() {
        let job = ScheduledJob::new(
            "ok".to_string(),
            Cadence::Fixed(Duration::from_secs(1)),
            DispatchMode::AwaitBeforeRearm,
            job_fn(|| async { Ok(()) }),
        );
        job.execute().await;

        let metrics = job.metrics();
        assert_eq!(metrics.run_count, 1);
        assert!(metrics.last_error.is_none());
        assert!(metrics.last_run_at.is_some());
        assert!(metrics.last_duration.is_some());
    }

    #[tokio::test]
    async fn test_execute_records_error_chain() {
        let job = ScheduledJob::new(
            "bad".to_string(),
            Cadence::Fixed(Duration::from_secs(1)),
            DispatchMode::AwaitBeforeRearm,
            job_fn(|| async {
                Err::<(), _>(anyhow::anyhow!("disk full").context("writing snapshot"))
            }),
        );
        job.execute().await;

        let error = job.metrics().last_error.expect("error recorded");
        assert!(error.contains("writing snapshot"));
        assert!(error.contains("disk full"));
    }

    #[tokio::test]
    async fn test_execute_records_panic() {
        let job = ScheduledJob::new(
            "panics".to_string(),
            Cadence::Fixed(Duration::from_secs(1)),
            DispatchMode::FireAndContinue,
            job_fn(|| async {
                let explode = true;
                if explode {
                    panic!("boom");
                }
                Ok(())
            }),
        );
        job.execute().await;

        let metrics = job.metrics();
        assert_eq!(metrics.run_count, 1);
        assert!(metrics.last_error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_blocking_job_runs_on_pool() {
        let job = ScheduledJob::new(
            "sync".to_string(),
            Cadence::Fixed(Duration::from_secs(1)),
            DispatchMode::AwaitBeforeRearm,
            blocking_job(|| anyhow::bail!("sync failure")),
        );
        job.execute().await;
        assert_eq!(job.metrics().last_error.as_deref(), Some("sync failure"));
    }
}

//! # Scheduler Module
//!
//! Drives all periodic work in the agent.
//!
//! This module handles:
//! - Registering named jobs, each with its own interval (fixed or self-adjusting)
//! - Dispatching ticks either fire-and-continue or await-before-rearm
//! - Serializing executions of one job while distinct jobs run independently,
//!   including across a replacement of the job under the same name
//! - Skipping ticks whose run rules (time windows, geofences) do not hold
//! - Recording per-job metrics (run count, duration, last error, next run)
//! - Cooperative cancellation: in-flight executions finish, nothing new starts
//!
//! ## Usage
//!
//! ```no_run
//! use recon_relay::scheduler::{job_fn, DispatchMode, JobScheduler};
//! use std::time::Duration;
//!
//! # async fn run() -> recon_relay::error::Result<()> {
//! let scheduler = JobScheduler::new(DispatchMode::AwaitBeforeRearm);
//! scheduler.schedule("heartbeat", job_fn(|| async { Ok(()) }), Duration::from_secs(5))?;
//!
//! let metrics = scheduler.get_metrics();
//! assert_eq!(metrics["heartbeat"].run_count, 0);
//! # Ok(())
//! # }
//! ```

pub mod job;
pub mod rules;

pub use job::{
    blocking_job, job_fn, Cadence, DispatchMode, ExecutionGate, JobFn, JobFuture, JobMetrics,
    JobOptions, ScheduledJob, SharedInterval,
};
pub use rules::{Geofence, PositionLookup, RuleCheck, ScheduleRules, TimeWindow};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AgentError, Result};

/// Lower bound on any delay between ticks, so a shared interval set to
/// zero cannot spin a dispatch loop.
const MIN_TICK: Duration = Duration::from_millis(1);

struct JobEntry {
    job: Arc<ScheduledJob>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Coordinates every periodic job of the agent.
///
/// Each job gets its own dispatch task. Executions of one job never
/// overlap; executions of different jobs are independent of each other.
pub struct JobScheduler {
    default_mode: DispatchMode,
    jobs: Mutex<HashMap<String, JobEntry>>,
    /// One gate per name, kept across cancel and re-registration.
    gates: Mutex<HashMap<String, ExecutionGate>>,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("default_mode", &self.default_mode)
            .field("jobs", &self.job_names())
            .finish()
    }
}

impl JobScheduler {
    /// Creates a scheduler whose [`schedule`](Self::schedule) calls use `default_mode`.
    pub fn new(default_mode: DispatchMode) -> Self {
        Self {
            default_mode,
            jobs: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_mode(&self) -> DispatchMode {
        self.default_mode
    }

    /// Registers `work` to run every `interval`, replacing any job with the
    /// same name.
    ///
    /// The first execution happens one interval after registration.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::InvalidInterval`] if `interval` is zero.
    pub fn schedule(&self, name: impl Into<String>, work: JobFn, interval: Duration) -> Result<()> {
        self.schedule_with(name, work, JobOptions::every(interval))
    }

    /// Registers a job with explicit cadence, dispatch mode and run rules.
    ///
    /// A replacement's first execution waits until any execution of the
    /// previous registration has finished.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::InvalidInterval`] if the initial interval is zero.
    pub fn schedule_with(
        &self,
        name: impl Into<String>,
        work: JobFn,
        options: JobOptions,
    ) -> Result<()> {
        let name = name.into();
        let interval = options.cadence.current();
        if interval.is_zero() {
            return Err(AgentError::InvalidInterval(name));
        }

        let mode = options.mode.unwrap_or(self.default_mode);
        let gated_by_rules = options.rule.is_some();
        let job = Arc::new(
            ScheduledJob::new(name.clone(), options.cadence, mode, work)
                .gated(self.gate_for(&name))
                .with_rule(options.rule),
        );
        let cancel = CancellationToken::new();

        let handle = match mode {
            DispatchMode::FireAndContinue => {
                tokio::spawn(fire_and_continue_loop(Arc::clone(&job), cancel.clone()))
            }
            DispatchMode::AwaitBeforeRearm => {
                tokio::spawn(await_before_rearm_loop(Arc::clone(&job), cancel.clone()))
            }
        };

        let previous = self
            .lock_jobs()
            .insert(name.clone(), JobEntry { job, cancel, handle });

        if let Some(previous) = previous {
            previous.cancel.cancel();
            debug!(job = %name, "Replaced existing job registration");
        }

        info!(
            job = %name,
            interval_ms = interval.as_millis() as u64,
            ?mode,
            gated_by_rules,
            "Job scheduled"
        );
        Ok(())
    }

    /// Stops a job. Returns `false` if no job with that name was registered.
    ///
    /// An execution already in progress is allowed to finish; no further
    /// execution starts. Calling this repeatedly is harmless.
    pub fn cancel(&self, name: &str) -> bool {
        match self.lock_jobs().remove(name) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(job = %name, "Job cancelled");
                true
            }
            None => false,
        }
    }

    /// Like [`cancel`](Self::cancel), but treats an unknown name as a caller bug.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::UnknownJob`] if no job with that name is registered.
    pub fn try_cancel(&self, name: &str) -> Result<()> {
        if self.cancel(name) {
            Ok(())
        } else {
            Err(AgentError::UnknownJob(name.to_string()))
        }
    }

    /// Stops every job and forgets their metrics.
    pub fn cancel_all(&self) {
        let drained: Vec<(String, JobEntry)> = self.lock_jobs().drain().collect();
        for (_, entry) in &drained {
            entry.cancel.cancel();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "All jobs cancelled");
        }
    }

    /// Cancels every job and waits for their dispatch loops to exit.
    ///
    /// Serialized jobs finish their in-flight execution before their loop
    /// exits, so after this returns none of them is running.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, JobEntry)> = self.lock_jobs().drain().collect();
        for (_, entry) in &drained {
            entry.cancel.cancel();
        }
        for (name, entry) in drained {
            if let Err(e) = entry.handle.await {
                debug!(job = %name, error = %e, "Dispatch loop ended abnormally");
            }
        }
        info!("Scheduler shut down");
    }

    /// Snapshot of every registered job's metrics, keyed by name.
    pub fn get_metrics(&self) -> HashMap<String, JobMetrics> {
        self.lock_jobs()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.job.metrics()))
            .collect()
    }

    /// Metrics of a single job.
    pub fn metrics_for(&self, name: &str) -> Option<JobMetrics> {
        self.lock_jobs().get(name).map(|entry| entry.job.metrics())
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.lock_jobs().contains_key(name)
    }

    /// Names of registered jobs, sorted.
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_jobs().keys().cloned().collect();
        names.sort();
        names
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn gate_for(&self, name: &str) -> ExecutionGate {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(gates.entry(name.to_string()).or_default())
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        for entry in self.lock_jobs().values() {
            entry.cancel.cancel();
        }
    }
}

async fn fire_and_continue_loop(job: Arc<ScheduledJob>, cancel: CancellationToken) {
    let mut deadline = Instant::now() + job.cadence().current().max(MIN_TICK);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        if !job.rules_allow() {
            job.record_rule_skip();
            debug!(job = %job.name(), "Run rules not met, tick skipped");
        } else {
            match Arc::clone(job.gate()).try_lock_owned() {
                Ok(permit) => {
                    let running = Arc::clone(&job);
                    tokio::spawn(async move {
                        let _permit = permit;
                        running.run_body().await;
                    });
                }
                Err(_) => {
                    job.record_skip();
                    debug!(job = %job.name(), "Previous execution still running, tick skipped");
                }
            }
        }

        deadline = next_deadline(deadline, job.cadence().current().max(MIN_TICK));
        job.record_next_run(deadline.saturating_duration_since(Instant::now()));
    }

    debug!(job = %job.name(), "Dispatch loop stopped");
}

async fn await_before_rearm_loop(job: Arc<ScheduledJob>, cancel: CancellationToken) {
    loop {
        let delay = job.cadence().current().max(MIN_TICK);
        job.record_next_run(delay);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        if !job.rules_allow() {
            job.record_rule_skip();
            debug!(job = %job.name(), "Run rules not met, tick skipped");
            continue;
        }

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = job.gate().lock() => permit,
        };
        job.run_body().await;
    }

    debug!(job = %job.name(), "Dispatch loop stopped");
}

/// Next tick on the fixed grid, or one interval from now if the grid fell
/// behind.
fn next_deadline(previous: Instant, interval: Duration) -> Instant {
    let now = Instant::now();
    let next = previous + interval;
    if next <= now {
        now + interval
    } else {
        next
    }
}

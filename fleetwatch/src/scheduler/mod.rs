//! Drives N independent recurring jobs.
//!
//! Each job gets its own driver task and interval timer. A tick that arrives
//! while the previous run of the same job is still going is skipped, not
//! queued. A run that errors or panics is recorded and logged; the driver
//! keeps firing.

mod job;

pub use job::{JobContext, JobHandler, JobSnapshot, RecurringJob, handler_fn};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{Error, Result};

#[derive(Debug, Default)]
struct JobState {
    last_started_at: Option<chrono::DateTime<Utc>>,
    running: bool,
    runs: u64,
    skipped: u64,
    failures: u64,
    last_error: Option<String>,
}

#[derive(Debug)]
struct JobEntry {
    job: RecurringJob,
    state: Mutex<JobState>,
}

impl JobEntry {
    fn snapshot(&self) -> JobSnapshot {
        let state = self.state.lock();
        JobSnapshot {
            name: self.job.name.clone(),
            interval: self.job.interval,
            last_started_at: state.last_started_at,
            running: state.running,
            runs: state.runs,
            skipped: state.skipped,
            failures: state.failures,
            last_error: state.last_error.clone(),
        }
    }
}

pub struct Scheduler {
    jobs: Mutex<Vec<Arc<JobEntry>>>,
    cancel: CancellationToken,
    drivers: Mutex<Option<JoinSet<()>>>,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    /// Use `token` as the shutdown signal handed to every job run.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            cancel: token,
            drivers: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Add a job. Fails after `start`, on a duplicate name, or a zero interval.
    pub fn register(&self, job: RecurringJob) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(Error::Other(format!(
                "cannot register job '{}' after the scheduler started",
                job.name
            )));
        }
        if job.interval.is_zero() {
            return Err(Error::config(format!("job '{}' has a zero interval", job.name)));
        }

        let mut jobs = self.jobs.lock();
        if jobs.iter().any(|entry| entry.job.name == job.name) {
            return Err(Error::Other(format!("job '{}' is already registered", job.name)));
        }
        debug!(job = %job.name, interval = ?job.interval, "job registered");
        jobs.push(Arc::new(JobEntry {
            job,
            state: Mutex::new(JobState::default()),
        }));
        Ok(())
    }

    /// Begin driving every registered job. Each fires immediately.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Other("scheduler already started".to_string()));
        }

        let jobs = self.jobs.lock().clone();
        let mut drivers = JoinSet::new();
        for entry in jobs {
            let cancel = self.cancel.clone();
            drivers.spawn(drive(entry, cancel));
        }
        info!(jobs = drivers.len(), "scheduler started");
        *self.drivers.lock() = Some(drivers);
        Ok(())
    }

    /// Signal shutdown and wait for every in-flight run to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let drivers = self.drivers.lock().take();
        if let Some(mut drivers) = drivers {
            while let Some(result) = drivers.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "job driver terminated abnormally");
                }
            }
        }
        info!("scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        self.jobs.lock().iter().map(|entry| entry.snapshot()).collect()
    }

    pub fn job(&self, name: &str) -> Option<JobSnapshot> {
        self.jobs
            .lock()
            .iter()
            .find(|entry| entry.job.name == name)
            .map(|entry| entry.snapshot())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn drive(entry: Arc<JobEntry>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(entry.job.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        {
            let mut state = entry.state.lock();
            if state.running {
                state.skipped += 1;
                warn!(
                    job = %entry.job.name,
                    skipped = state.skipped,
                    "previous run still in progress, skipping this firing"
                );
                continue;
            }
            state.running = true;
            state.runs += 1;
            state.last_started_at = Some(Utc::now());
        }

        in_flight = Some(tokio::spawn(run_once(entry.clone(), cancel.clone())));
    }

    if let Some(handle) = in_flight {
        if !handle.is_finished() {
            debug!(job = %entry.job.name, "waiting for in-flight run to finish");
        }
        let _ = handle.await;
    }
}

async fn run_once(entry: Arc<JobEntry>, cancel: CancellationToken) {
    let ctx = JobContext::new(entry.job.name.clone(), cancel);
    let span = info_span!("job", name = %ctx.job_name, run_id = %ctx.run_id);
    let handler = entry.job.handler.clone();

    let started = tokio::time::Instant::now();
    // The inner task isolates panics from the driver.
    let outcome = tokio::spawn(async move { handler.run(ctx).await }.instrument(span.clone())).await;
    let elapsed = started.elapsed();

    let mut state = entry.state.lock();
    state.running = false;
    let _enter = span.enter();
    match outcome {
        Ok(Ok(())) => {
            state.last_error = None;
            info!(elapsed = ?elapsed, "job run completed");
        }
        Ok(Err(e)) => {
            state.failures += 1;
            state.last_error = Some(e.to_string());
            error!(error = %e, elapsed = ?elapsed, "job run failed");
        }
        Err(join_error) => {
            state.failures += 1;
            let reason = if join_error.is_panic() {
                "job panicked".to_string()
            } else {
                join_error.to_string()
            };
            error!(error = %reason, elapsed = ?elapsed, "job run aborted");
            state.last_error = Some(reason);
        }
    }
}

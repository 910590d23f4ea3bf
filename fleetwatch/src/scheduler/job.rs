//! Recurring job definitions.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::Result;

/// Per-firing context handed to a job body.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_name: String,
    pub run_id: Uuid,
    pub fired_at: DateTime<Utc>,
    /// Cancelled when the scheduler stops. Bodies should check it at their
    /// suspension points and return early.
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job_name: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            job_name: job_name.into(),
            run_id: Uuid::new_v4(),
            fired_at: Utc::now(),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, ctx: JobContext) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> Result<()> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A named handler fired once at start and then every `interval`.
#[derive(Clone)]
pub struct RecurringJob {
    pub name: String,
    pub interval: Duration,
    pub handler: Arc<dyn JobHandler>,
}

impl RecurringJob {
    pub fn new(name: impl Into<String>, interval: Duration, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            name: name.into(),
            interval,
            handler,
        }
    }
}

impl fmt::Debug for RecurringJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecurringJob")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub name: String,
    pub interval: Duration,
    pub last_started_at: Option<DateTime<Utc>>,
    pub running: bool,
    pub runs: u64,
    /// Firings dropped because the previous run was still going.
    pub skipped: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

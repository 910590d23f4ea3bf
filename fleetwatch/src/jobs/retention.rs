use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::Result;
use crate::logging;
use crate::scheduler::{JobContext, JobHandler};
use crate::tracker::DownDeviceTracker;

/// Prunes stale registry entries and old log files.
pub struct RetentionJob {
    tracker: Arc<DownDeviceTracker>,
    log_dir: PathBuf,
    log_retention_days: i64,
}

impl RetentionJob {
    pub fn new(tracker: Arc<DownDeviceTracker>, log_dir: PathBuf, log_retention_days: i64) -> Self {
        Self {
            tracker,
            log_dir,
            log_retention_days,
        }
    }
}

#[async_trait]
impl JobHandler for RetentionJob {
    async fn run(&self, _ctx: JobContext) -> Result<()> {
        let removed = self.tracker.prune(Utc::now()).await;
        debug!(removed, "registry retention applied");

        if let Err(e) = logging::cleanup_old_logs(&self.log_dir, self.log_retention_days).await {
            warn!(error = %e, "Failed to cleanup old logs");
        }
        Ok(())
    }
}

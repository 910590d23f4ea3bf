use std::sync::Arc;

use async_trait::async_trait;
use fleet_api::FleetApi;
use tracing::{info, warn};

use super::resolve_total;
use crate::Result;
use crate::enricher::{RAW_DATA_HEADER, RateLimitedEnricher, RawRecord};
use crate::scheduler::{JobContext, JobHandler};
use crate::storage::{PersistenceStore, RAW_DATA_FILE};
use crate::tracker::{DownDeviceTracker, Transition};

/// Polls reachability, drives the tracker, then enriches every down device.
pub struct HealthCheckJob {
    api: FleetApi,
    store: PersistenceStore,
    tracker: Arc<DownDeviceTracker>,
    enricher: Arc<RateLimitedEnricher>,
    fallback_total: u64,
}

impl HealthCheckJob {
    pub fn new(
        api: FleetApi,
        store: PersistenceStore,
        tracker: Arc<DownDeviceTracker>,
        enricher: Arc<RateLimitedEnricher>,
        fallback_total: u64,
    ) -> Self {
        Self {
            api,
            store,
            tracker,
            enricher,
            fallback_total,
        }
    }
}

#[async_trait]
impl JobHandler for HealthCheckJob {
    async fn run(&self, ctx: JobContext) -> Result<()> {
        let (total, _) = resolve_total(&self.api, &self.store, self.fallback_total).await;
        if ctx.is_cancelled() {
            return Ok(());
        }

        let health = self.api.device_health(total).await;

        let raw_rows: Vec<RawRecord> = health
            .raw_pages
            .iter()
            .map(|(offset, body)| RawRecord::new(format!("health_offset_{offset}"), body))
            .collect();
        if let Err(e) = self
            .store
            .append_records(RAW_DATA_FILE, &RAW_DATA_HEADER, &raw_rows)
            .await
        {
            warn!(error = %e, "failed to append raw health pages");
        }

        let (mut went_down, mut came_up) = (0usize, 0usize);
        for entry in &health.records {
            match self.tracker.observe(&entry.device_id, entry.status()).await {
                Transition::WentDown => went_down += 1,
                Transition::CameUp => came_up += 1,
                Transition::Unchanged => {}
            }
        }
        info!(
            observed = health.records.len(),
            went_down,
            came_up,
            failed_pages = health.failed_offsets.len(),
            "health observations applied"
        );

        if health.cancelled || ctx.is_cancelled() {
            return Ok(());
        }

        let down = self.tracker.all_down().await;
        self.enricher.enrich(&down, &ctx.cancel).await;

        if !self.tracker.flush().await {
            warn!("down-device registry still not persisted");
        }
        Ok(())
    }
}

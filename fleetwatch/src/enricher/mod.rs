//! Rate-limited detail enrichment of down devices.
//!
//! Devices are processed in chunks. Calls inside a chunk run concurrently
//! (still bounded by the client's semaphore); chunk starts are spaced at
//! least one window apart, and every attempt additionally passes through a
//! sliding-window limiter so retries cannot push a window over its ceiling.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_api::{DeviceStatus, FetchError, FleetApi, WindowRateLimiter};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::{
    CURRENT_DOWN_INFO_FILE, PROCESSED_DATA_FILE, PersistenceStore, RAW_DATA_FILE,
};
use crate::tracker::DownDeviceTracker;

pub const RAW_DATA_HEADER: [&str; 3] = ["key", "fetched_at", "raw_json"];
pub const PROCESSED_DATA_HEADER: [&str; 4] = ["device_id", "status", "signal_strength", "timestamp"];

/// Normalized detail record, one row of `processed_data.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub device_id: String,
    pub status: DeviceStatus,
    pub signal_strength: Option<f64>,
    pub timestamp: Option<String>,
}

/// One row of `raw_data.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub key: String,
    pub fetched_at: DateTime<Utc>,
    pub raw_json: String,
}

impl RawRecord {
    pub fn new(key: impl Into<String>, raw: &serde_json::Value) -> Self {
        Self {
            key: key.into(),
            fetched_at: Utc::now(),
            raw_json: raw.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentReport {
    pub requested: usize,
    pub chunks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub processed: Vec<ProcessedRecord>,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct EnricherConfig {
    pub chunk_size: usize,
    pub calls_per_window: usize,
    pub window: Duration,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            calls_per_window: 100,
            window: Duration::from_secs(60),
        }
    }
}

pub struct RateLimitedEnricher {
    api: FleetApi,
    tracker: Arc<DownDeviceTracker>,
    store: PersistenceStore,
    chunk_size: usize,
    window: Duration,
    limiter: Arc<WindowRateLimiter>,
}

impl RateLimitedEnricher {
    pub fn new(
        api: FleetApi,
        tracker: Arc<DownDeviceTracker>,
        store: PersistenceStore,
        config: EnricherConfig,
    ) -> Self {
        Self {
            api,
            tracker,
            store,
            chunk_size: config.chunk_size.max(1),
            window: config.window,
            limiter: Arc::new(WindowRateLimiter::new(config.calls_per_window, config.window)),
        }
    }

    pub fn limiter(&self) -> &Arc<WindowRateLimiter> {
        &self.limiter
    }

    /// Fetch details for `device_ids`, append them to the raw and processed
    /// logs, and feed each reported status back into the tracker.
    ///
    /// `current_down_device_info.csv` is rewritten on every call, header only
    /// when nothing is down.
    pub async fn enrich(
        &self,
        device_ids: &[String],
        cancel: &CancellationToken,
    ) -> EnrichmentReport {
        let mut report = EnrichmentReport {
            requested: device_ids.len(),
            ..Default::default()
        };

        let mut window_start: Option<Instant> = None;
        for chunk in device_ids.chunks(self.chunk_size) {
            if let Some(started) = window_start {
                let next = started + self.window;
                debug!(wait = ?next.saturating_duration_since(Instant::now()), "waiting for next enrichment window");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        report.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep_until(next) => {}
                }
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            window_start = Some(Instant::now());
            report.chunks += 1;
            self.process_chunk(chunk, &mut report).await;
        }

        let current_down: Vec<&ProcessedRecord> = report
            .processed
            .iter()
            .filter(|r| r.status.is_down())
            .collect();
        if let Err(e) = self
            .store
            .write_csv(CURRENT_DOWN_INFO_FILE, &PROCESSED_DATA_HEADER, &current_down)
            .await
        {
            warn!(error = %e, "failed to write current down-device info");
        }

        info!(
            requested = report.requested,
            chunks = report.chunks,
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            "enrichment finished"
        );
        report
    }

    async fn process_chunk(&self, chunk: &[String], report: &mut EnrichmentReport) {
        let results = join_all(
            chunk
                .iter()
                .map(|id| self.api.device_detail_limited(id, &self.limiter)),
        )
        .await;

        let mut raw_rows = Vec::with_capacity(chunk.len());
        let mut processed_rows = Vec::with_capacity(chunk.len());

        for (device_id, result) in chunk.iter().zip(results) {
            match result {
                Ok((detail, raw)) => {
                    raw_rows.push(RawRecord::new(device_id.as_str(), &raw));
                    processed_rows.push(ProcessedRecord {
                        device_id: device_id.clone(),
                        status: detail.status,
                        signal_strength: detail.signal_strength,
                        timestamp: detail.timestamp,
                    });
                }
                Err(FetchError::Cancelled) => {
                    report.cancelled = true;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(device_id = %device_id, error = %e, "detail fetch failed, skipping device");
                }
            }
        }

        if let Err(e) = self
            .store
            .append_records(RAW_DATA_FILE, &RAW_DATA_HEADER, &raw_rows)
            .await
        {
            warn!(error = %e, "failed to append raw detail payloads");
        }
        if let Err(e) = self
            .store
            .append_records(PROCESSED_DATA_FILE, &PROCESSED_DATA_HEADER, &processed_rows)
            .await
        {
            warn!(error = %e, "failed to append processed detail records");
        }

        // An unrecognized detail status says nothing about reachability.
        for record in processed_rows.iter().filter(|r| r.status != DeviceStatus::Unknown) {
            self.tracker.observe(&record.device_id, record.status).await;
        }

        report.succeeded += processed_rows.len();
        report.processed.extend(processed_rows);
    }
}

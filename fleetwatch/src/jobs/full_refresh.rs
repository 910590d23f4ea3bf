use async_trait::async_trait;
use chrono::Utc;
use fleet_api::{DeviceRecord, FleetApi};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{DeviceCountSnapshot, TotalSource, resolve_total};
use crate::Result;
use crate::scheduler::{JobContext, JobHandler};
use crate::storage::{DEVICE_COUNT_FILE, DEVICE_LIST_FILE, PersistenceStore};

pub const DEVICE_LIST_HEADER: [&str; 5] = ["device_id", "name", "mac_address", "status", "last_seen"];

/// One row of `device_list.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceListRow {
    pub device_id: String,
    pub name: String,
    pub mac_address: String,
    pub status: String,
    pub last_seen: Option<String>,
}

impl From<DeviceRecord> for DeviceListRow {
    fn from(device: DeviceRecord) -> Self {
        Self {
            device_id: device.id,
            name: device.name,
            mac_address: device.mac_address,
            status: device.status.to_string(),
            last_seen: device.last_seen,
        }
    }
}

/// Snapshots the device count and the full roster.
pub struct FullRefreshJob {
    api: FleetApi,
    store: PersistenceStore,
    fallback_total: u64,
}

impl FullRefreshJob {
    pub fn new(api: FleetApi, store: PersistenceStore, fallback_total: u64) -> Self {
        Self {
            api,
            store,
            fallback_total,
        }
    }
}

#[async_trait]
impl JobHandler for FullRefreshJob {
    async fn run(&self, ctx: JobContext) -> Result<()> {
        let (total, source) = resolve_total(&self.api, &self.store, self.fallback_total).await;
        if source == TotalSource::Live {
            let snapshot = DeviceCountSnapshot {
                device_count: total,
                timestamp: Utc::now(),
            };
            if let Err(e) = self.store.write_json(DEVICE_COUNT_FILE, &snapshot).await {
                warn!(error = %e, "failed to write device count snapshot");
            }
        }
        if ctx.is_cancelled() {
            return Ok(());
        }

        let list = self.api.device_list(total).await;
        if list.cancelled {
            info!("full refresh cancelled, keeping previous roster");
            return Ok(());
        }
        if list.records.is_empty() {
            warn!(
                failed_pages = list.failed_offsets.len(),
                "no devices fetched, keeping previous roster"
            );
            return Ok(());
        }

        let rows: Vec<DeviceListRow> = list.records.into_iter().map(DeviceListRow::from).collect();
        self.store
            .write_csv(DEVICE_LIST_FILE, &DEVICE_LIST_HEADER, &rows)
            .await?;
        info!(
            devices = rows.len(),
            total,
            failed_pages = list.failed_offsets.len(),
            "device roster refreshed"
        );
        Ok(())
    }
}

//! The recurring jobs the service registers with the scheduler.

mod full_refresh;
mod health_check;
mod retention;

pub use full_refresh::{DEVICE_LIST_HEADER, DeviceListRow, FullRefreshJob};
pub use health_check::HealthCheckJob;
pub use retention::RetentionJob;

use chrono::{DateTime, Utc};
use fleet_api::FleetApi;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::{DEVICE_COUNT_FILE, PersistenceStore};

pub const FULL_REFRESH_JOB: &str = "full_refresh";
pub const HEALTH_CHECK_JOB: &str = "health_check";
pub const RETENTION_JOB: &str = "retention";

/// Contents of `device_count.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCountSnapshot {
    pub device_count: u64,
    pub timestamp: DateTime<Utc>,
}

/// Where a pagination upper bound came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotalSource {
    Live,
    Snapshot,
    Fallback,
}

/// Upper bound for pagination: the live count, else the last snapshot, else
/// `fallback`.
pub async fn resolve_total(
    api: &FleetApi,
    store: &PersistenceStore,
    fallback: u64,
) -> (u64, TotalSource) {
    match api.device_count().await {
        Ok(count) => return (count, TotalSource::Live),
        Err(e) => warn!(error = %e, "device count unavailable, trying last snapshot"),
    }

    match store.read_json::<DeviceCountSnapshot>(DEVICE_COUNT_FILE).await {
        Ok(snapshot) => {
            debug!(device_count = snapshot.device_count, taken_at = %snapshot.timestamp, "using snapshot device count");
            (snapshot.device_count, TotalSource::Snapshot)
        }
        Err(e) => {
            warn!(error = %e, fallback, "no usable device count, using fallback");
            (fallback, TotalSource::Fallback)
        }
    }
}

//! The down-device registry and its UP/DOWN state machine.
//!
//! A device has a [`DownRecord`] exactly when its most recent observation was
//! DOWN. Every transition rewrites the full registry (`down_devices.json` and
//! `down_devices.csv`) while the registry lock is held, so the files never lag
//! the in-memory state by more than one mutation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use fleet_api::DeviceStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::Result;
use crate::storage::{DOWN_DEVICES_CSV, DOWN_DEVICES_JSON, PersistenceStore};

pub const DOWN_DEVICES_HEADER: [&str; 2] = ["device_id", "first_down_at"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownRecord {
    pub device_id: String,
    pub first_down_at: DateTime<Utc>,
}

/// Effect of one observation on the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentDown,
    CameUp,
    Unchanged,
}

impl Transition {
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

#[derive(Debug, Default)]
struct Registry {
    records: HashMap<String, DownRecord>,
    /// Last registry write failed; the next write must include this state.
    dirty: bool,
}

#[derive(Debug)]
pub struct DownDeviceTracker {
    store: PersistenceStore,
    retention: chrono::Duration,
    registry: Mutex<Registry>,
    writes: AtomicU64,
}

impl DownDeviceTracker {
    /// Empty tracker. Use [`load`](Self::load) to resume from disk.
    pub fn new(store: PersistenceStore, retention: chrono::Duration) -> Self {
        Self {
            store,
            retention,
            registry: Mutex::new(Registry::default()),
            writes: AtomicU64::new(0),
        }
    }

    /// Resume from `down_devices.json`. A missing file is an empty registry.
    pub async fn load(store: PersistenceStore, retention: chrono::Duration) -> Result<Self> {
        let tracker = Self::new(store, retention);
        match tracker
            .store
            .read_json::<BTreeMap<String, DateTime<Utc>>>(DOWN_DEVICES_JSON)
            .await
        {
            Ok(entries) => {
                let mut registry = tracker.registry.lock().await;
                registry.records = entries
                    .into_iter()
                    .map(|(device_id, first_down_at)| {
                        let record = DownRecord {
                            device_id: device_id.clone(),
                            first_down_at,
                        };
                        (device_id, record)
                    })
                    .collect();
                info!(devices = registry.records.len(), "down-device registry loaded");
            }
            Err(e) if e.is_not_found() => {
                debug!("no down-device registry on disk, starting empty");
            }
            Err(e) => return Err(e),
        }
        Ok(tracker)
    }

    pub fn retention(&self) -> chrono::Duration {
        self.retention
    }

    /// Record a DOWN observation at the current time.
    pub async fn mark_down(&self, device_id: &str) -> Transition {
        self.mark_down_at(device_id, Utc::now()).await
    }

    /// Record a DOWN observation. An already-down device keeps its original
    /// `first_down_at` and nothing is written.
    pub async fn mark_down_at(&self, device_id: &str, at: DateTime<Utc>) -> Transition {
        let mut registry = self.registry.lock().await;
        if registry.records.contains_key(device_id) {
            return Transition::Unchanged;
        }
        registry.records.insert(
            device_id.to_string(),
            DownRecord {
                device_id: device_id.to_string(),
                first_down_at: at,
            },
        );
        info!(device_id, "device went down");
        self.persist(&mut registry).await;
        Transition::WentDown
    }

    /// Record a non-DOWN observation.
    pub async fn mark_up(&self, device_id: &str) -> Transition {
        let mut registry = self.registry.lock().await;
        if registry.records.remove(device_id).is_none() {
            return Transition::Unchanged;
        }
        info!(device_id, "device came back up");
        self.persist(&mut registry).await;
        Transition::CameUp
    }

    /// Route an observed status: DOWN marks down, anything else marks up.
    pub async fn observe(&self, device_id: &str, status: DeviceStatus) -> Transition {
        if status.is_down() {
            self.mark_down(device_id).await
        } else {
            self.mark_up(device_id).await
        }
    }

    pub async fn is_down(&self, device_id: &str) -> bool {
        self.registry.lock().await.records.contains_key(device_id)
    }

    /// Ids of every device currently down, sorted.
    pub async fn all_down(&self) -> Vec<String> {
        let registry = self.registry.lock().await;
        let mut ids: Vec<String> = registry.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn get(&self, device_id: &str) -> Option<DownRecord> {
        self.registry.lock().await.records.get(device_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.registry.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove entries whose `first_down_at` is older than the retention window
    /// at `now`. An entry exactly at the boundary is kept.
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut registry = self.registry.lock().await;
        let before = registry.records.len();
        let retention = self.retention;
        registry
            .records
            .retain(|_, record| now.signed_duration_since(record.first_down_at) <= retention);
        let removed = before - registry.records.len();

        if removed > 0 {
            info!(removed, remaining = registry.records.len(), "pruned stale down-device entries");
            self.persist(&mut registry).await;
        } else if registry.dirty {
            self.persist(&mut registry).await;
        }
        removed
    }

    /// Retry a previously failed registry write. Returns whether the registry
    /// is clean afterwards.
    pub async fn flush(&self) -> bool {
        let mut registry = self.registry.lock().await;
        if registry.dirty {
            self.persist(&mut registry).await;
        }
        !registry.dirty
    }

    pub async fn is_dirty(&self) -> bool {
        self.registry.lock().await.dirty
    }

    /// Successful full-registry writes since construction.
    pub fn registry_writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Rewrite both registry files. Failure is logged and leaves the registry
    /// dirty; the in-memory state stays authoritative.
    async fn persist(&self, registry: &mut Registry) {
        match self.write_registry(&registry.records).await {
            Ok(()) => {
                registry.dirty = false;
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                registry.dirty = true;
                warn!(error = %e, "failed to persist down-device registry, will retry on next change");
            }
        }
    }

    async fn write_registry(&self, records: &HashMap<String, DownRecord>) -> Result<()> {
        let snapshot: BTreeMap<&str, DateTime<Utc>> = records
            .values()
            .map(|r| (r.device_id.as_str(), r.first_down_at))
            .collect();
        self.store.write_json(DOWN_DEVICES_JSON, &snapshot).await?;

        let mut rows: Vec<&DownRecord> = records.values().collect();
        rows.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        self.store
            .write_csv(DOWN_DEVICES_CSV, &DOWN_DEVICES_HEADER, &rows)
            .await
    }
}

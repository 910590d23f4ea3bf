//! Wire models for the inventory and health endpoints.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Reachability of a device as reported by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceStatus {
    Up,
    Down,
    #[default]
    Unknown,
}

impl DeviceStatus {
    /// Classify a free-form status string.
    ///
    /// `reachable` / `up` map to [`DeviceStatus::Up`], `unreachable` / `down`
    /// to [`DeviceStatus::Down`], everything else is [`DeviceStatus::Unknown`].
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reachable" | "up" => Self::Up,
            "unreachable" | "down" => Self::Down,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn is_down(&self) -> bool {
        matches!(self, Self::Down)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DeviceStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DeviceStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(Self::parse).unwrap_or_default())
    }
}

/// One device from `/get_device_list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(alias = "device_id", alias = "deviceId")]
    pub id: String,
    #[serde(default, alias = "hostname")]
    pub name: String,
    #[serde(default, rename = "macAddress", alias = "mac_address")]
    pub mac_address: String,
    #[serde(default, alias = "reachabilityHealth")]
    pub status: DeviceStatus,
    #[serde(default, rename = "lastSeen", alias = "last_seen")]
    pub last_seen: Option<String>,
}

/// One entry from `/device_health`. Fields other than the id and reachability
/// are kept verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEntry {
    #[serde(alias = "deviceId", alias = "id")]
    pub device_id: String,
    #[serde(default, rename = "reachabilityHealth")]
    pub reachability_health: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl HealthEntry {
    pub fn status(&self) -> DeviceStatus {
        self.reachability_health
            .as_deref()
            .map(DeviceStatus::parse)
            .unwrap_or_default()
    }
}

/// Response of `/device_detail/{device_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDetail {
    pub device_id: String,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub signal_strength: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Response of `/get_device_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCount {
    pub device_count: u64,
}

/// Offset/limit window over a paginated endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: u64,
    pub limit: u64,
}

impl PageRequest {
    /// Returns `None` for a zero limit, which would never make progress.
    pub fn new(offset: u64, limit: u64) -> Option<Self> {
        (limit > 0).then_some(Self { offset, limit })
    }

    pub fn query(&self) -> Vec<(String, String)> {
        vec![
            ("offset".to_string(), self.offset.to_string()),
            ("limit".to_string(), self.limit.to_string()),
        ]
    }
}

/// `{ "devices": [...] }`, shared by the list and health endpoints. Entries
/// stay untyped so one bad record does not sink the page.
#[derive(Debug, Deserialize)]
pub(crate) struct PageEnvelope {
    #[serde(default)]
    pub devices: Vec<serde_json::Value>,
}

/// Accepts a JSON number, a numeric string, or null.
fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

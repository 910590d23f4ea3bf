//! Service configuration.
//!
//! Values come from an optional TOML file and are then overridden by
//! `FLEETWATCH_*` environment variables. Every option has a default except
//! the API base URL.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use fleet_api::{ClientConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "FLEETWATCH_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "fleetwatch.toml";
const ENV_PREFIX: &str = "FLEETWATCH_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Static bearer token, used when no username/password is configured.
    pub api_token: Option<String>,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub full_refresh_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub retention_interval_secs: u64,
    pub page_size: u64,
    pub page_delay_ms: u64,
    pub max_concurrent_calls: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub request_timeout_secs: u64,
    pub enrichment_chunk_size: usize,
    pub enrichment_calls_per_window: usize,
    pub enrichment_window_secs: u64,
    pub retention_days: i64,
    pub log_retention_days: i64,
    /// Page-count upper bound when neither the API nor the snapshot knows the total.
    pub fallback_device_count: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            username: None,
            password: None,
            api_token: None,
            data_dir: PathBuf::from("data"),
            log_dir: PathBuf::from("logs"),
            full_refresh_interval_secs: 24 * 60 * 60,
            health_check_interval_secs: 15 * 60,
            retention_interval_secs: 60 * 60,
            page_size: 500,
            page_delay_ms: 1000,
            max_concurrent_calls: 10,
            max_retries: 3,
            backoff_base_ms: 1000,
            request_timeout_secs: 60,
            enrichment_chunk_size: 100,
            enrichment_calls_per_window: 100,
            enrichment_window_secs: 60,
            retention_days: 14,
            log_retention_days: 7,
            fallback_device_count: 10_000,
        }
    }
}

impl AppConfig {
    /// Load from the file named by `FLEETWATCH_CONFIG` and the process environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load_with(Path::new(&path), |key| std::env::var(key).ok())
    }

    /// Load from `path` (missing file = defaults), apply overrides from
    /// `lookup`, then validate.
    pub fn load_with(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => {
                info!(path = %path.display(), "loading configuration file");
                Self::from_toml(&contents)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no configuration file, using defaults");
                Self::default()
            }
            Err(e) => return Err(Error::io_path("reading config", path, e)),
        };
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::config(format!("invalid TOML: {e}")))
    }

    /// Override fields from `FLEETWATCH_<FIELD>` variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |field: &str| lookup(&format!("{ENV_PREFIX}{}", field.to_ascii_uppercase()));

        if let Some(v) = get("api_base_url") {
            self.api_base_url = v;
        }
        if let Some(v) = get("username") {
            self.username = Some(v);
        }
        if let Some(v) = get("password") {
            self.password = Some(v);
        }
        if let Some(v) = get("api_token") {
            self.api_token = Some(v);
        }
        if let Some(v) = get("data_dir") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("log_dir") {
            self.log_dir = PathBuf::from(v);
        }

        macro_rules! numeric {
            ($target:ident; $($field:ident),+ $(,)?) => {
                $(
                    if let Some(v) = get(stringify!($field)) {
                        $target.$field = parse_env(stringify!($field), &v)?;
                    }
                )+
            };
        }
        numeric!(
            self;
            full_refresh_interval_secs,
            health_check_interval_secs,
            retention_interval_secs,
            page_size,
            page_delay_ms,
            max_concurrent_calls,
            max_retries,
            backoff_base_ms,
            request_timeout_secs,
            enrichment_chunk_size,
            enrichment_calls_per_window,
            enrichment_window_secs,
            retention_days,
            log_retention_days,
            fallback_device_count,
        );
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(Error::config("api_base_url must be set"));
        }
        let nonzero = [
            ("full_refresh_interval_secs", self.full_refresh_interval_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("retention_interval_secs", self.retention_interval_secs),
            ("page_size", self.page_size),
            ("max_concurrent_calls", self.max_concurrent_calls as u64),
            ("max_retries", self.max_retries as u64),
            ("request_timeout_secs", self.request_timeout_secs),
            ("enrichment_chunk_size", self.enrichment_chunk_size as u64),
            ("enrichment_calls_per_window", self.enrichment_calls_per_window as u64),
            ("enrichment_window_secs", self.enrichment_window_secs),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(Error::config(format!("{name} must be greater than zero")));
        }
        if self.enrichment_chunk_size > self.enrichment_calls_per_window {
            return Err(Error::config(
                "enrichment_chunk_size cannot exceed enrichment_calls_per_window",
            ));
        }
        if self.retention_days <= 0 || self.log_retention_days <= 0 {
            return Err(Error::config("retention periods must be positive"));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::config("username and password must be set together"));
        }
        Ok(())
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            max_concurrent_calls: self.max_concurrent_calls,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            retry: RetryPolicy::new(self.max_retries, Duration::from_millis(self.backoff_base_ms)),
        }
    }

    pub fn full_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.full_refresh_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn enrichment_window(&self) -> Duration {
        Duration::from_secs(self.enrichment_window_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}

fn parse_env<T: FromStr>(field: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| {
        Error::config(format!("{ENV_PREFIX}{}: {e}", field.to_ascii_uppercase()))
    })
}

//! Application configuration document.
//!
//! One JSON file, camelCase keys, every section optional. The path comes
//! from the command line or `ORDER_RELAY_CONFIG`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::health::HealthConfig;
use crate::models::{PrinterProfile, StoreSettings};
use crate::printers::RegistryOptions;
use crate::retry::RetryPolicy;
use crate::templates::TemplateConfig;

pub const CONFIG_ENV: &str = "ORDER_RELAY_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "order-relay.json";

/// Upper bounds for time settings. Larger values overflow date arithmetic.
const MAX_SINCE_BUFFER_MINUTES: i64 = 7 * 24 * 60;
const MAX_LOOKBACK_HOURS: i64 = 366 * 24;
const MAX_WATCH_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceConfig {
    pub site_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    /// Only fetch orders in this status. `None` fetches all.
    pub status_filter: Option<String>,
}

impl SourceConfig {
    pub fn is_configured(&self) -> bool {
        !self.site_url.trim().is_empty()
            && !self.consumer_key.trim().is_empty()
            && !self.consumer_secret.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    /// Overlap subtracted from the last check when building the "since" date.
    pub since_buffer_minutes: i64,
    /// How far back the very first fetch looks.
    pub first_run_lookback_hours: i64,
    pub auto_print: bool,
    pub page_size: u32,
    /// A cycle running longer than this is abandoned and counted as failed.
    pub cycle_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            since_buffer_minutes: 5,
            first_run_lookback_hours: 24,
            auto_print: true,
            page_size: 100,
            cycle_timeout_secs: 300,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrintersConfig {
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub profiles: Vec<PrinterProfile>,
    pub default_template_id: Option<String>,
}

impl Default for PrintersConfig {
    fn default() -> Self {
        let options = RegistryOptions::default();
        Self {
            probe_interval_secs: options.probe_interval.as_secs(),
            probe_timeout_secs: options.probe_timeout.as_secs(),
            connect_timeout_secs: options.connect_timeout.as_secs(),
            profiles: Vec::new(),
            default_template_id: None,
        }
    }
}

impl PrintersConfig {
    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            probe_interval: Duration::from_secs(self.probe_interval_secs.max(1)),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs.max(1)),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub store: StoreSettings,
    pub source: SourceConfig,
    pub sync: SyncConfig,
    pub health: HealthConfig,
    pub printers: PrintersConfig,
    pub retry: RetryPolicy,
    pub templates: Vec<TemplateConfig>,
    pub database_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Config path from an explicit argument, then `ORDER_RELAY_CONFIG`,
    /// then `order-relay.json` in the working directory.
    pub fn resolve_path(arg: Option<&str>) -> PathBuf {
        arg.map(str::to_string)
            .or_else(|| std::env::var(CONFIG_ENV).ok())
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.page_size == 0 {
            return Err(ConfigError::Invalid("sync.pageSize must be at least 1".into()));
        }
        if !(0..=MAX_SINCE_BUFFER_MINUTES).contains(&self.sync.since_buffer_minutes) {
            return Err(ConfigError::Invalid(format!(
                "sync.sinceBufferMinutes must be between 0 and {MAX_SINCE_BUFFER_MINUTES}"
            )));
        }
        if !(0..=MAX_LOOKBACK_HOURS).contains(&self.sync.first_run_lookback_hours) {
            return Err(ConfigError::Invalid(format!(
                "sync.firstRunLookbackHours must be between 0 and {MAX_LOOKBACK_HOURS}"
            )));
        }
        let watched = [
            ("sync.intervalSecs", self.sync.interval_secs),
            ("sync.cycleTimeoutSecs", self.sync.cycle_timeout_secs),
            ("health.checkIntervalSecs", self.health.check_interval_secs),
            ("health.stuckThresholdSecs", self.health.stuck_threshold_secs),
            ("health.alertCooldownSecs", self.health.alert_cooldown_secs),
        ];
        if let Some((name, _)) = watched.iter().find(|(_, v)| *v > MAX_WATCH_SECS) {
            return Err(ConfigError::Invalid(format!(
                "{name} must be at most {MAX_WATCH_SECS} seconds"
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.maxAttempts must be at least 1".into()));
        }
        if let Some(t) = self.templates.iter().find(|t| !t.is_valid()) {
            return Err(ConfigError::Invalid(format!(
                "template {:?} needs an id and a name",
                t.template_id
            )));
        }
        let defaults = self.printers.profiles.iter().filter(|p| p.is_default).count();
        if defaults > 1 {
            return Err(ConfigError::Invalid(format!(
                "{defaults} printer profiles are marked default, at most one is allowed"
            )));
        }
        Ok(())
    }
}

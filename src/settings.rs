//! Settings collaborator.
//!
//! Owns the [`AppConfig`] behind a lock and writes every change back to disk
//! (temp file + rename). The polling interval is also published on a watch
//! channel so the scheduler picks up changes on its next sleep.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{AppConfig, SourceConfig, SyncConfig};
use crate::error::ConfigError;
use crate::health::HealthConfig;
use crate::models::{PrinterProfile, StoreSettings};
use crate::retry::RetryPolicy;
use crate::templates::{TemplateConfig, TemplateType};

/// Whether the order source can be contacted at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigurationState {
    Configured,
    MissingCredentials,
}

pub struct SettingsStore {
    path: Option<PathBuf>,
    config: RwLock<AppConfig>,
    interval_tx: watch::Sender<Duration>,
}

impl SettingsStore {
    /// Store backed by `path`. Nothing is written until the first change.
    pub fn new(config: AppConfig, path: Option<PathBuf>) -> Self {
        let (interval_tx, _) = watch::channel(config.sync.interval());
        Self {
            path,
            config: RwLock::new(config),
            interval_tx,
        }
    }

    pub fn in_memory(config: AppConfig) -> Self {
        Self::new(config, None)
    }

    /// Load `path`, or start from defaults when the file does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            AppConfig::load(path)?
        } else {
            warn!(path = %path.display(), "Config file not found, starting with defaults");
            AppConfig::default()
        };
        Ok(Self::new(config, Some(path.to_path_buf())))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read(&self) -> RwLockReadGuard<'_, AppConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `f` to a copy, validate, persist, then publish.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut AppConfig) -> Result<T, ConfigError>,
    ) -> Result<T, ConfigError> {
        let mut guard = self.config.write().unwrap_or_else(|e| e.into_inner());
        let mut next = guard.clone();
        let out = f(&mut next)?;
        next.validate()?;
        if let Some(path) = &self.path {
            write_atomic(path, &next)?;
        }
        let interval = next.sync.interval();
        *guard = next;
        drop(guard);
        self.interval_tx.send_if_modified(|current| {
            let changed = *current != interval;
            *current = interval;
            changed
        });
        Ok(out)
    }

    pub fn snapshot(&self) -> AppConfig {
        self.read().clone()
    }

    pub fn configuration_state(&self) -> ConfigurationState {
        if self.read().source.is_configured() {
            ConfigurationState::Configured
        } else {
            ConfigurationState::MissingCredentials
        }
    }

    pub fn source(&self) -> SourceConfig {
        self.read().source.clone()
    }

    pub fn set_source(&self, source: SourceConfig) -> Result<(), ConfigError> {
        self.update(|c| {
            c.source = source;
            Ok(())
        })?;
        info!("Order source settings updated");
        Ok(())
    }

    pub fn sync(&self) -> SyncConfig {
        self.read().sync.clone()
    }

    pub fn set_sync(&self, sync: SyncConfig) -> Result<(), ConfigError> {
        self.update(|c| {
            c.sync = sync;
            Ok(())
        })?;
        info!("Sync settings updated");
        Ok(())
    }

    pub fn health(&self) -> HealthConfig {
        self.read().health.clone()
    }

    pub fn retry(&self) -> RetryPolicy {
        self.read().retry.clone()
    }

    pub fn store(&self) -> StoreSettings {
        self.read().store.clone()
    }

    pub fn set_store(&self, store: StoreSettings) -> Result<(), ConfigError> {
        self.update(|c| {
            c.store = store;
            Ok(())
        })
    }

    // -- polling interval --------------------------------------------------

    pub fn poll_interval(&self) -> Duration {
        *self.interval_tx.borrow()
    }

    pub fn subscribe_interval(&self) -> watch::Receiver<Duration> {
        self.interval_tx.subscribe()
    }

    pub fn set_poll_interval(&self, interval: Duration) -> Result<(), ConfigError> {
        let secs = interval.as_secs().max(1);
        self.update(|c| {
            c.sync.interval_secs = secs;
            Ok(())
        })?;
        info!(interval_secs = secs, "Polling interval updated");
        Ok(())
    }

    // -- templates ---------------------------------------------------------

    /// Configured templates followed by any preset whose id is not taken.
    pub fn templates(&self) -> Vec<TemplateConfig> {
        let config = self.read();
        let mut out = config.templates.clone();
        for t in [TemplateType::FullDetails, TemplateType::Delivery, TemplateType::Kitchen] {
            if !out.iter().any(|c| c.template_id == t.id()) {
                out.push(TemplateConfig::preset(t));
            }
        }
        out
    }

    pub fn template(&self, template_id: &str) -> Option<TemplateConfig> {
        self.templates()
            .into_iter()
            .find(|t| t.template_id == template_id)
    }

    /// Template used when a profile does not name one.
    pub fn default_template(&self) -> TemplateConfig {
        let id = self.read().printers.default_template_id.clone();
        id.and_then(|id| self.template(&id))
            .unwrap_or_else(|| TemplateConfig::preset(TemplateType::FullDetails))
    }

    /// Template for a printer profile: its own, else the default.
    pub fn template_for(&self, profile: &PrinterProfile) -> TemplateConfig {
        profile
            .template_id
            .as_deref()
            .and_then(|id| self.template(id))
            .unwrap_or_else(|| self.default_template())
    }

    pub fn upsert_template(&self, mut template: TemplateConfig) -> Result<TemplateConfig, ConfigError> {
        if !template.is_valid() {
            return Err(ConfigError::Invalid(format!(
                "template {:?} needs an id and a name",
                template.template_id
            )));
        }
        template.touch();
        let saved = template.clone();
        self.update(move |c| {
            match c
                .templates
                .iter_mut()
                .find(|t| t.template_id == template.template_id)
            {
                Some(existing) => {
                    template.created_at = existing.created_at;
                    *existing = template;
                }
                None => c.templates.push(template),
            }
            Ok(())
        })?;
        Ok(saved)
    }

    /// Returns whether a configured template was removed. Presets cannot be
    /// deleted, only overridden.
    pub fn delete_template(&self, template_id: &str) -> Result<bool, ConfigError> {
        self.update(|c| {
            let before = c.templates.len();
            c.templates.retain(|t| t.template_id != template_id);
            if c.printers.default_template_id.as_deref() == Some(template_id) {
                c.printers.default_template_id = None;
            }
            Ok(c.templates.len() != before)
        })
    }

    pub fn set_default_template(&self, template_id: Option<String>) -> Result<(), ConfigError> {
        if let Some(id) = &template_id {
            if self.template(id).is_none() {
                return Err(ConfigError::Invalid(format!("unknown template {id:?}")));
            }
        }
        self.update(|c| {
            c.printers.default_template_id = template_id;
            Ok(())
        })
    }

    // -- printer profiles --------------------------------------------------

    pub fn profiles(&self) -> Vec<PrinterProfile> {
        self.read().printers.profiles.clone()
    }

    pub fn save_profiles(&self, profiles: Vec<PrinterProfile>) -> Result<(), ConfigError> {
        self.update(|c| {
            c.printers.profiles = profiles;
            Ok(())
        })
    }
}

/// Write `config` next to `path` and rename it into place.
fn write_atomic(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
    }
    let json = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransportKind;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("order-relay-settings-{}", uuid::Uuid::new_v4()))
            .join("config.json")
    }

    fn configured() -> AppConfig {
        let mut config = AppConfig::default();
        config.source = SourceConfig {
            site_url: "shop.example.com".into(),
            consumer_key: "ck_1".into(),
            consumer_secret: "cs_1".into(),
            status_filter: None,
        };
        config
    }

    #[test]
    fn test_configuration_state() {
        let store = SettingsStore::in_memory(AppConfig::default());
        assert_eq!(store.configuration_state(), ConfigurationState::MissingCredentials);
        store.set_source(configured().source).unwrap();
        assert_eq!(store.configuration_state(), ConfigurationState::Configured);
    }

    #[test]
    fn test_interval_changes_are_published() {
        let store = SettingsStore::in_memory(AppConfig::default());
        let rx = store.subscribe_interval();
        assert_eq!(*rx.borrow(), Duration::from_secs(30));

        store.set_poll_interval(Duration::from_secs(12)).unwrap();
        assert_eq!(*rx.borrow(), Duration::from_secs(12));
        assert_eq!(store.sync().interval_secs, 12);
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_templates_include_presets() {
        let store = SettingsStore::in_memory(AppConfig::default());
        let ids: Vec<String> = store.templates().into_iter().map(|t| t.template_id).collect();
        assert_eq!(ids, vec!["full_details", "delivery", "kitchen"]);
        assert_eq!(store.default_template().template_id, "full_details");
    }

    #[test]
    fn test_template_crud() {
        let store = SettingsStore::in_memory(AppConfig::default());
        let mut custom = TemplateConfig::preset(TemplateType::Kitchen);
        custom.template_id = "bar".into();
        custom.template_name = "Bar ticket".into();
        store.upsert_template(custom.clone()).unwrap();
        assert_eq!(store.template("bar").unwrap().template_name, "Bar ticket");

        custom.footer_text = "Cheers".into();
        store.upsert_template(custom).unwrap();
        assert_eq!(store.template("bar").unwrap().footer_text, "Cheers");
        assert_eq!(store.snapshot().templates.len(), 1);

        store.set_default_template(Some("bar".into())).unwrap();
        assert_eq!(store.default_template().template_id, "bar");

        assert!(store.delete_template("bar").unwrap());
        assert!(!store.delete_template("kitchen").unwrap());
        assert_eq!(store.default_template().template_id, "full_details");
    }

    #[test]
    fn test_invalid_template_rejected() {
        let store = SettingsStore::in_memory(AppConfig::default());
        let mut bad = TemplateConfig::default();
        bad.template_name = " ".into();
        assert!(matches!(store.upsert_template(bad), Err(ConfigError::Invalid(_))));
        assert!(store.set_default_template(Some("nope".into())).is_err());
    }

    #[test]
    fn test_template_for_profile() {
        let store = SettingsStore::in_memory(AppConfig::default());
        let mut profile = PrinterProfile::new(
            "Kitchen",
            TransportKind::Network {
                host: "10.0.0.9".into(),
                port: 9100,
            },
        );
        assert_eq!(store.template_for(&profile).template_id, "full_details");
        profile.template_id = Some("kitchen".into());
        assert_eq!(store.template_for(&profile).template_id, "kitchen");
        profile.template_id = Some("gone".into());
        assert_eq!(store.template_for(&profile).template_id, "full_details");
    }

    #[test]
    fn test_changes_persist_to_disk() {
        let path = temp_path();
        let store = SettingsStore::load_or_default(&path).unwrap();
        assert!(!path.exists());

        store.set_source(configured().source).unwrap();
        let mut profile = PrinterProfile::new(
            "Front",
            TransportKind::Bluetooth {
                address: "00:11:22:33:44:55".into(),
            },
        );
        profile.is_default = true;
        store.save_profiles(vec![profile]).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = SettingsStore::load_or_default(&path).unwrap();
        assert_eq!(reloaded.configuration_state(), ConfigurationState::Configured);
        assert_eq!(reloaded.profiles().len(), 1);
        assert!(reloaded.profiles()[0].is_default);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_invalid_change_is_not_applied() {
        let store = SettingsStore::in_memory(AppConfig::default());
        let mut a = PrinterProfile::new("A", TransportKind::Bluetooth { address: "A".into() });
        let mut b = PrinterProfile::new("B", TransportKind::Bluetooth { address: "B".into() });
        a.is_default = true;
        b.is_default = true;
        assert!(store.save_profiles(vec![a, b]).is_err());
        assert!(store.profiles().is_empty());
    }
}

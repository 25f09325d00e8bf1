//! Diagnostics helpers.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Status report**: sync status, printer states and the running config
//!   with credentials redacted
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::warn;

use crate::config::AppConfig;
use crate::printers::ConnectionState;
use crate::sync::SyncStatus;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Rolling log file prefix; files are named `relay.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "relay";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Status report
// ---------------------------------------------------------------------------

/// Everything an operator needs to see why orders are not printing.
pub fn status_report(
    config: &AppConfig,
    sync: &SyncStatus,
    printers: &HashMap<String, ConnectionState>,
) -> Value {
    let printer_states: serde_json::Map<String, Value> = printers
        .iter()
        .map(|(id, state)| (id.clone(), json!(state)))
        .collect();
    let config = serde_json::to_value(config).unwrap_or(Value::Null);
    json!({
        "about": get_about_info(),
        "sync": sync,
        "printers": printer_states,
        "config": redact_sensitive_fields(config),
    })
}

fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, value) in map {
                if should_redact_key(&key) {
                    redacted.insert(key, Value::String("[REDACTED]".to_string()));
                } else {
                    redacted.insert(key, redact_sensitive_fields(value));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(redact_sensitive_fields).collect())
        }
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    let sensitive_markers = [
        "consumerkey",
        "consumer_key",
        "apikey",
        "api_key",
        "secret",
        "password",
        "token",
        "authorization",
    ];
    sensitive_markers
        .iter()
        .any(|marker| normalized.contains(marker))
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Returns the default log directory.
pub fn get_log_dir() -> PathBuf {
    get_data_dir().join("logs")
}

/// Per-user data directory: `$XDG_DATA_HOME`, `%LOCALAPPDATA%` or
/// `~/.local/share`, plus `order-relay`.
pub fn get_data_dir() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME")
        .or_else(|_| std::env::var("LOCALAPPDATA"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("order-relay")
}

/// Prune old log files in `log_dir`, keeping only the most recent
/// `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first; ties broken by name so dated files keep their order.
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use serial_test::serial;

    #[test]
    fn test_about_info_has_required_fields() {
        let info = get_about_info();
        assert!(info.get("version").is_some());
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
        assert!(info.get("arch").is_some());
    }

    #[test]
    #[serial]
    fn test_log_dir_follows_xdg_data_home() {
        let previous = std::env::var("XDG_DATA_HOME").ok();
        std::env::set_var("XDG_DATA_HOME", "/srv/data");
        assert_eq!(get_log_dir(), PathBuf::from("/srv/data/order-relay/logs"));
        match previous {
            Some(v) => std::env::set_var("XDG_DATA_HOME", v),
            None => std::env::remove_var("XDG_DATA_HOME"),
        }
        assert!(get_log_dir().ends_with("order-relay/logs"));
    }

    #[test]
    fn test_prune_keeps_newest_logs() {
        let dir = std::env::temp_dir().join(format!("relay_logs_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        for day in 1..=14 {
            fs::write(dir.join(format!("relay.2026-01-{day:02}")), "x").unwrap();
        }
        fs::write(dir.join("notes.txt"), "keep").unwrap();

        prune_old_logs(&dir);

        let remaining: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(remaining.iter().filter(|n| n.starts_with("relay.")).count(), MAX_LOG_FILES);
        assert!(remaining.contains(&"notes.txt".to_string()));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_status_report_redacts_credentials() {
        let mut config = AppConfig::default();
        config.source = SourceConfig {
            site_url: "shop.example.com".into(),
            consumer_key: "ck_live".into(),
            consumer_secret: "cs_live".into(),
            status_filter: None,
        };
        let printers = HashMap::from([("p1".to_string(), ConnectionState::PaperOut)]);
        let report = status_report(&config, &SyncStatus::default(), &printers);

        assert_eq!(report["config"]["source"]["siteUrl"], json!("shop.example.com"));
        assert_eq!(report["config"]["source"]["consumerKey"], json!("[REDACTED]"));
        assert_eq!(report["config"]["source"]["consumerSecret"], json!("[REDACTED]"));
        assert!(report["printers"]["p1"].is_string());
        assert_eq!(report["sync"]["newOrderCount"], json!(0));
    }

    #[test]
    fn test_should_redact_key_matches_sensitive_markers() {
        assert!(should_redact_key("consumerSecret"));
        assert!(should_redact_key("Authorization"));
        assert!(!should_redact_key("status"));
        assert!(!should_redact_key("siteUrl"));
    }
}

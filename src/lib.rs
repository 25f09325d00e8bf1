//! Order Relay
//!
//! Keeps an unattended POS terminal's view of remote shop orders fresh and
//! prints a receipt for every new order. The pieces:
//!
//! - [`polling::PollingScheduler`] runs the fetch cycle at a live interval.
//! - [`health::HealthMonitor`] watches the loop and raises debounced alerts.
//! - [`sync::OrderSyncCoordinator`] decides what is new and dispatches it.
//! - [`printers::PrinterRegistry`] owns printer profiles and their
//!   connection state machines.
//! - [`drivers`] turn receipt markup into device bytes.
//! - [`receipt_renderer`] turns an order and a template into markup.
//! - [`retry::RetryingTransport`] retries transient order source failures.
//!
//! [`engine::Engine`] wires them together.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod escpos;
pub mod health;
pub mod markup;
pub mod metadata;
pub mod models;
pub mod notify;
pub mod polling;
pub mod printers;
pub mod receipt_renderer;
pub mod repository;
pub mod retry;
pub mod settings;
pub mod sync;
pub mod templates;

/// Environment variable selecting the log file format (`text` or `json`).
pub const LOG_FORMAT_ENV: &str = "ORDER_RELAY_LOG_FORMAT";

/// Install structured logging: console plus a daily rolling file in
/// `log_dir`. Keep the returned guard alive; dropping it flushes and stops
/// the file writer.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,order_relay=debug"));

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs(log_dir);
    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // ORDER_RELAY_LOG_FORMAT=json switches the file sink to one JSON object per line
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let (text_layer, json_layer) = if json {
        let layer = fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_target(true);
        (None, Some(layer))
    } else {
        let layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true);
        (Some(layer), None)
    };
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(text_layer)
        .with(json_layer)
        .init();

    guard
}

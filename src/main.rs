use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use order_relay::api::HttpOrderSource;
use order_relay::config::AppConfig;
use order_relay::db::SqliteOrderRepository;
use order_relay::diagnostics;
use order_relay::drivers::{DriverRegistry, EscPosOptions};
use order_relay::engine::Engine;
use order_relay::health::SystemClock;
use order_relay::notify::LogNotifier;
use order_relay::settings::{ConfigurationState, SettingsStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let arg = std::env::args().nth(1);
    let config_path = AppConfig::resolve_path(arg.as_deref());

    let _log_guard = order_relay::init_logging(&diagnostics::get_log_dir());
    let about = diagnostics::get_about_info();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        build = %about["buildTimestamp"],
        git_sha = %about["gitSha"],
        "Starting Order Relay"
    );

    let settings = Arc::new(
        SettingsStore::load_or_default(&config_path)
            .with_context(|| format!("loading config {}", config_path.display()))?,
    );
    if settings.configuration_state() == ConfigurationState::MissingCredentials {
        error!(
            path = %config_path.display(),
            "Order source credentials missing; sync cycles will fail until they are set"
        );
    }

    let db_path = settings
        .snapshot()
        .database_path
        .unwrap_or_else(|| diagnostics::get_data_dir().join("orders.db"));
    let repository = Arc::new(
        SqliteOrderRepository::open(&db_path)
            .with_context(|| format!("opening order database {}", db_path.display()))?,
    );
    let source =
        Arc::new(HttpOrderSource::new(settings.clone()).context("creating order source client")?);
    let drivers = DriverRegistry::with_defaults(EscPosOptions::default(), Vec::new());

    let engine = Engine::build(
        settings,
        source,
        repository,
        Arc::new(LogNotifier),
        drivers,
        Arc::new(SystemClock),
    )
    .await;
    engine.start_all().await.context("starting engine")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    engine.shutdown().await;
    Ok(())
}

//! Engine facade.
//!
//! Wires the settings store, order source, repository, notifier and printer
//! drivers into a coordinator, a polling scheduler, a health monitor and the
//! printer monitor, and owns the three background loops. Every loop runs on a
//! child token of one root token, so [`Engine::shutdown`] stops them as a
//! group.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::OrderSource;
use crate::diagnostics;
use crate::drivers::DriverRegistry;
use crate::error::{EngineError, PrinterError};
use crate::health::{Clock, HealthConfig, HealthListener, HealthMonitor};
use crate::models::{OrderRecord, PrinterProfile};
use crate::notify::Notifier;
use crate::polling::PollingScheduler;
use crate::printers::{ConnectionState, PrinterRegistry};
use crate::repository::OrderRepository;
use crate::retry::RetryingTransport;
use crate::settings::SettingsStore;
use crate::sync::{OrderSyncCoordinator, SyncStatus};

/// How long shutdown waits for each loop to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A spawned loop and the token that stops it.
struct LoopHandle {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl LoopHandle {
    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    async fn stop(self) {
        self.cancel.cancel();
        match tokio::time::timeout(SHUTDOWN_GRACE, self.handle).await {
            Ok(Ok(())) => debug!(task = self.name, "background loop finished"),
            Ok(Err(e)) if e.is_panic() => {
                warn!(task = self.name, "background loop had panicked")
            }
            Ok(Err(_)) => {}
            Err(_) => warn!(task = self.name, "background loop did not stop in time"),
        }
    }
}

fn take(slot: &Mutex<Option<LoopHandle>>) -> Option<LoopHandle> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

// ---------------------------------------------------------------------------
// Sync loop
// ---------------------------------------------------------------------------

/// The polling scheduler's task, restartable by the health monitor.
struct SyncLoop {
    scheduler: Arc<PollingScheduler>,
    shutdown: CancellationToken,
    running: Mutex<Option<LoopHandle>>,
}

impl SyncLoop {
    /// Spawn the scheduler unless a live task already exists. Returns whether
    /// a task was spawned.
    fn ensure_running(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        if self.shutdown.is_cancelled() {
            return false;
        }
        let cancel = self.shutdown.child_token();
        let handle = self.scheduler.start(cancel.clone());
        *running = Some(LoopHandle {
            name: "sync",
            cancel,
            handle,
        });
        true
    }

    /// Replace the scheduler task with a fresh one. The old task is
    /// cancelled and aborted, which drops whatever cycle it was stuck in.
    fn restart(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if self.shutdown.is_cancelled() {
            return false;
        }
        if let Some(old) = running.take() {
            old.cancel.cancel();
            old.handle.abort();
        }
        let cancel = self.shutdown.child_token();
        let handle = self.scheduler.start(cancel.clone());
        *running = Some(LoopHandle {
            name: "sync",
            cancel,
            handle,
        });
        true
    }

    async fn stop(&self) {
        self.scheduler.stop();
        if let Some(handle) = take(&self.running) {
            handle.stop().await;
        }
    }
}

/// Health monitor callbacks. A task that is gone is respawned, a task
/// stuck inside a cycle is replaced, and a task that is only sleeping is
/// woken for an immediate cycle.
struct SyncRecovery {
    sync: Arc<SyncLoop>,
}

impl HealthListener for SyncRecovery {
    fn on_timeout(&self, idle: Duration) {
        if self.sync.ensure_running() {
            warn!(idle_secs = idle.as_secs(), "Sync loop had exited, restarted");
        } else if self.sync.scheduler.is_in_cycle() {
            if self.sync.restart() {
                warn!(idle_secs = idle.as_secs(), "Sync cycle hung, scheduler restarted");
            }
        } else {
            warn!(idle_secs = idle.as_secs(), "Sync loop stalled, forcing a cycle");
            self.sync.scheduler.force_cycle();
        }
    }

    fn on_recovered(&self, idle: Duration) {
        info!(idle_secs = idle.as_secs(), "Sync loop healthy again");
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    settings: Arc<SettingsStore>,
    repository: Arc<dyn OrderRepository>,
    printers: Arc<PrinterRegistry>,
    coordinator: Arc<OrderSyncCoordinator>,
    sync: Arc<SyncLoop>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    health: Mutex<Option<(Arc<HealthMonitor>, LoopHandle)>>,
    printer_monitor: Mutex<Option<LoopHandle>>,
}

impl Engine {
    /// Build the engine and register the configured printer profiles. No
    /// loop is started.
    pub async fn build(
        settings: Arc<SettingsStore>,
        source: Arc<dyn OrderSource>,
        repository: Arc<dyn OrderRepository>,
        notifier: Arc<dyn Notifier>,
        drivers: DriverRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = settings.snapshot();
        let transport: Arc<dyn OrderSource> =
            Arc::new(RetryingTransport::new(source, config.retry.clone()));
        let printers = Arc::new(PrinterRegistry::new(
            Arc::new(drivers),
            config.printers.registry_options(),
        ));
        for profile in config.printers.profiles {
            printers.upsert_profile(profile).await;
        }

        let coordinator = Arc::new(OrderSyncCoordinator::new(
            settings.clone(),
            transport,
            repository.clone(),
            printers.clone(),
            notifier,
            clock.clone(),
        ));
        let scheduler = Arc::new(
            PollingScheduler::new(
                coordinator.clone(),
                settings.subscribe_interval(),
                clock.clone(),
            )
            .with_cycle_timeout(config.sync.cycle_timeout()),
        );
        let shutdown = CancellationToken::new();

        info!(
            profiles = printers.profiles().len(),
            configuration = ?settings.configuration_state(),
            "Engine ready"
        );
        Self {
            settings,
            repository,
            printers,
            coordinator,
            sync: Arc::new(SyncLoop {
                scheduler,
                shutdown: shutdown.clone(),
                running: Mutex::new(None),
            }),
            clock,
            shutdown,
            health: Mutex::new(None),
            printer_monitor: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn printers(&self) -> &Arc<PrinterRegistry> {
        &self.printers
    }

    pub fn coordinator(&self) -> &Arc<OrderSyncCoordinator> {
        &self.coordinator
    }

    pub fn repository(&self) -> &Arc<dyn OrderRepository> {
        &self.repository
    }

    // -- sync --------------------------------------------------------------

    /// Start polling. `Some(interval)` also stores a new interval, which a
    /// running loop picks up on its next sleep.
    pub fn start_sync(&self, interval: Option<Duration>) -> Result<(), EngineError> {
        if let Some(interval) = interval {
            self.settings.set_poll_interval(interval)?;
        }
        if self.sync.ensure_running() {
            info!(
                interval_secs = self.settings.poll_interval().as_secs(),
                "Sync started"
            );
        }
        Ok(())
    }

    pub async fn stop_sync(&self) {
        self.sync.stop().await;
        info!("Sync stopped");
    }

    pub fn force_sync(&self) {
        self.sync.scheduler.force_cycle();
    }

    pub fn sync_status(&self) -> SyncStatus {
        let scheduler = &self.sync.scheduler;
        SyncStatus {
            running: scheduler.is_active(),
            configuration: Some(self.settings.configuration_state()),
            last_attempt: scheduler.last_attempt_ms().and_then(to_datetime),
            last_success: scheduler.last_success_ms().and_then(to_datetime),
            last_checked: self.coordinator.last_checked(),
            last_error: scheduler.last_error(),
            new_order_count: self.coordinator.new_order_count(),
            in_processing_count: self.coordinator.in_processing_count(),
        }
    }

    // -- health ------------------------------------------------------------

    /// (Re)start the health monitor with `config`.
    pub async fn start_health_monitor(&self, config: HealthConfig) {
        self.stop_health_monitor().await;
        let monitor = Arc::new(HealthMonitor::new(
            config,
            self.sync.scheduler.clone(),
            Arc::new(SyncRecovery {
                sync: self.sync.clone(),
            }),
            self.clock.clone(),
        ));
        let cancel = self.shutdown.child_token();
        let handle = monitor.start(cancel.clone());
        *self.health.lock().unwrap_or_else(|e| e.into_inner()) = Some((
            monitor,
            LoopHandle {
                name: "health",
                cancel,
                handle,
            },
        ));
    }

    pub async fn stop_health_monitor(&self) {
        let current = self.health.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((_, handle)) = current {
            handle.stop().await;
        }
    }

    pub fn health_monitor(&self) -> Option<Arc<HealthMonitor>> {
        self.health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(m, _)| m.clone())
    }

    // -- printers ----------------------------------------------------------

    pub fn start_printer_monitor(&self) {
        let mut slot = self.printer_monitor.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let cancel = self.shutdown.child_token();
        let handle = self.printers.start_monitor(cancel.clone());
        *slot = Some(LoopHandle {
            name: "printer-monitor",
            cancel,
            handle,
        });
    }

    pub async fn stop_printer_monitor(&self) {
        if let Some(handle) = take(&self.printer_monitor) {
            handle.stop().await;
        }
    }

    pub fn connection_state(&self, profile_id: &str) -> ConnectionState {
        self.printers.connection_state(profile_id)
    }

    /// Print `order` on a profile. `template_id` overrides the profile's
    /// template; unknown ids fall back to it.
    pub async fn dispatch_print(
        &self,
        order: &OrderRecord,
        profile_id: &str,
        template_id: Option<&str>,
    ) -> bool {
        let Some(profile) = self.printers.profile(profile_id) else {
            warn!(order_id = order.id, profile_id, "print requested for unknown printer");
            return false;
        };
        let template = template_id
            .and_then(|id| self.settings.template(id))
            .unwrap_or_else(|| self.settings.template_for(&profile));
        let store = self.settings.store();
        let ok = self
            .printers
            .dispatch_print(order, profile_id, &template, &store)
            .await;
        if ok {
            if let Err(e) = self.repository.mark_printed(order.id) {
                debug!(order_id = order.id, error = %e, "printed order is not stored locally");
            }
        }
        ok
    }

    pub async fn print_test_page(&self, profile_id: &str) -> Result<bool, PrinterError> {
        self.printers
            .print_test_page(profile_id, &self.settings.store())
            .await
    }

    /// Save a profile in the registry and in the settings file.
    pub async fn upsert_profile(
        &self,
        profile: PrinterProfile,
    ) -> Result<PrinterProfile, EngineError> {
        let saved = self.printers.upsert_profile(profile).await;
        self.persist_profiles()?;
        Ok(saved)
    }

    pub async fn remove_profile(&self, profile_id: &str) -> Result<PrinterProfile, EngineError> {
        let removed = self.printers.remove_profile(profile_id).await?;
        self.persist_profiles()?;
        Ok(removed)
    }

    pub fn set_default_profile(&self, profile_id: &str) -> Result<(), EngineError> {
        self.printers.set_default(profile_id)?;
        self.persist_profiles()
    }

    fn persist_profiles(&self) -> Result<(), EngineError> {
        self.settings.save_profiles(self.printers.profiles())?;
        Ok(())
    }

    pub fn connection_states(&self) -> HashMap<String, ConnectionState> {
        self.printers.connection_states()
    }

    /// Diagnostics snapshot with credentials redacted.
    pub fn status_report(&self) -> Value {
        diagnostics::status_report(
            &self.settings.snapshot(),
            &self.sync_status(),
            &self.connection_states(),
        )
    }

    // -- lifecycle ---------------------------------------------------------

    /// Start sync, health monitor and printer monitor from the settings.
    pub async fn start_all(&self) -> Result<(), EngineError> {
        self.start_printer_monitor();
        self.start_sync(None)?;
        self.start_health_monitor(self.settings.health()).await;
        Ok(())
    }

    /// Stop every loop and close printer links.
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.sync.scheduler.stop();
        self.shutdown.cancel();

        let mut loops: Vec<LoopHandle> = Vec::new();
        loops.extend(take(&self.sync.running));
        loops.extend(
            self.health
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .map(|(_, h)| h),
        );
        loops.extend(take(&self.printer_monitor));
        for handle in loops {
            handle.stop().await;
        }

        for profile in self.printers.profiles() {
            if let Err(e) = self.printers.disconnect(&profile.id).await {
                debug!(profile_id = %profile.id, error = %e, "disconnect on shutdown failed");
            }
        }
        info!("Engine stopped");
    }
}

fn to_datetime(ms: i64) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp_millis(ms)
}

//! Order sync coordinator.
//!
//! One cycle fetches orders changed since the last check, stores the ones
//! that are new or changed, and for every new (processing, unread) order
//! prints a receipt on the default printer and raises a notification.
//!
//! The `printed` and `notified` flags are read back from the repository
//! before acting and written only after the action happened, so a crash
//! between the two re-prints on the next cycle instead of losing the
//! receipt.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::{CallContext, OrderQuery, OrderSource};
use crate::error::SyncError;
use crate::health::Clock;
use crate::models::{OrderClass, OrderRecord, STATUS_PROCESSING};
use crate::notify::Notifier;
use crate::polling::CycleStep;
use crate::printers::PrinterRegistry;
use crate::repository::OrderRepository;
use crate::settings::{ConfigurationState, SettingsStore};

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub fetched: usize,
    pub stored: usize,
    pub new_orders: usize,
    pub printed: usize,
    pub notified: usize,
}

/// Snapshot for UI collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub running: bool,
    pub configuration: Option<ConfigurationState>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub new_order_count: usize,
    pub in_processing_count: usize,
}

pub struct OrderSyncCoordinator {
    settings: Arc<SettingsStore>,
    source: Arc<dyn OrderSource>,
    repository: Arc<dyn OrderRepository>,
    printers: Arc<PrinterRegistry>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    /// Serializes whole cycles.
    cycle_lock: tokio::sync::Mutex<()>,
    /// Upper end of the last fetch window that returned orders.
    last_checked: Mutex<Option<DateTime<Utc>>>,
    /// Orders currently being printed/notified.
    in_flight: Mutex<HashSet<i64>>,
    new_count: AtomicUsize,
    in_processing_count: AtomicUsize,
}

impl OrderSyncCoordinator {
    pub fn new(
        settings: Arc<SettingsStore>,
        source: Arc<dyn OrderSource>,
        repository: Arc<dyn OrderRepository>,
        printers: Arc<PrinterRegistry>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            source,
            repository,
            printers,
            notifier,
            clock,
            cycle_lock: tokio::sync::Mutex::new(()),
            last_checked: Mutex::new(None),
            in_flight: Mutex::new(HashSet::new()),
            new_count: AtomicUsize::new(0),
            in_processing_count: AtomicUsize::new(0),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.clock.now_ms())
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        *self.last_checked.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn new_order_count(&self) -> usize {
        self.new_count.load(Ordering::SeqCst)
    }

    pub fn in_processing_count(&self) -> usize {
        self.in_processing_count.load(Ordering::SeqCst)
    }

    /// Lower bound of the next fetch window.
    pub fn since_date(&self) -> Result<DateTime<Utc>, SyncError> {
        let sync = self.settings.sync();
        let (anchor, back) = match self.last_checked() {
            Some(last) => (last, TimeDelta::try_minutes(sync.since_buffer_minutes)),
            None => (self.now(), TimeDelta::try_hours(sync.first_run_lookback_hours)),
        };
        back.and_then(|back| anchor.checked_sub_signed(back))
            .ok_or_else(|| {
                SyncError::InvalidWindow(format!(
                    "buffer {} min / lookback {} h from {anchor}",
                    sync.since_buffer_minutes, sync.first_run_lookback_hours
                ))
            })
    }

    /// Fetch, store, and act on new orders.
    pub async fn run_once(&self) -> Result<CycleReport, SyncError> {
        if self.settings.configuration_state() == ConfigurationState::MissingCredentials {
            return Err(SyncError::ConfigurationAbsent(
                "site URL, consumer key and consumer secret are required".into(),
            ));
        }

        let _cycle = self.cycle_lock.lock().await;
        let started = self.now();
        let query = OrderQuery {
            status: self.settings.source().status_filter,
            since: Some(self.since_date()?),
        };
        debug!(since = ?query.since, status = ?query.status, "fetching orders");

        let orders = self
            .source
            .fetch_orders(&query, CallContext::default())
            .await?;
        if !orders.is_empty() {
            *self.last_checked.lock().unwrap_or_else(|e| e.into_inner()) = Some(started);
        }

        self.process_batch(orders).await
    }

    /// Store a fetched batch and act on new orders. Callers must hold the
    /// cycle lock or otherwise not race another batch.
    async fn process_batch(&self, fetched: Vec<OrderRecord>) -> Result<CycleReport, SyncError> {
        let mut report = CycleReport {
            fetched: fetched.len(),
            ..Default::default()
        };

        let mut current = Vec::with_capacity(fetched.len());
        let mut changed = Vec::new();
        for mut order in fetched {
            match self.repository.get(order.id)? {
                Some(stored) => {
                    if order.differs_remotely(&stored) {
                        changed.push(order.clone());
                    }
                    order.carry_flags_from(&stored);
                }
                None => changed.push(order.clone()),
            }
            current.push(order);
        }
        if !changed.is_empty() {
            report.stored = self.repository.upsert_orders(&changed)?;
        }

        for order in &current {
            if order.classify() != OrderClass::New {
                continue;
            }
            report.new_orders += 1;
            let (printed, notified) = self.handle_new_order(order).await;
            report.printed += usize::from(printed);
            report.notified += usize::from(notified);
        }

        self.refresh_counts();
        if report.new_orders > 0 || report.stored > 0 {
            info!(
                fetched = report.fetched,
                stored = report.stored,
                new_orders = report.new_orders,
                printed = report.printed,
                "orders synced"
            );
        }
        Ok(report)
    }

    /// Print and notify for one new order, each at most once. Returns which
    /// of the two happened in this call.
    async fn handle_new_order(&self, order: &OrderRecord) -> (bool, bool) {
        let Some(_guard) = InFlight::claim(&self.in_flight, order.id) else {
            debug!(order_id = order.id, "order already being handled");
            return (false, false);
        };

        let mut printed = false;
        if !order.printed && self.settings.sync().auto_print {
            printed = self.print_on_default(order).await;
            if printed {
                if let Err(e) = self.repository.mark_printed(order.id) {
                    warn!(order_id = order.id, error = %e, "failed to record printed flag");
                }
            }
        }

        let mut notified = false;
        if !order.notified {
            self.notifier.on_new_order(order);
            notified = true;
            if let Err(e) = self.repository.mark_notified(order.id) {
                warn!(order_id = order.id, error = %e, "failed to record notified flag");
            }
        }
        (printed, notified)
    }

    async fn print_on_default(&self, order: &OrderRecord) -> bool {
        let Some(profile) = self.printers.default_profile() else {
            debug!(order_id = order.id, "no default printer, receipt not printed");
            return false;
        };
        let template = self.settings.template_for(&profile);
        let store = self.settings.store();
        self.printers
            .dispatch_print(order, &profile.id, &template, &store)
            .await
    }

    fn refresh_counts(&self) {
        match self.repository.list_by_status(STATUS_PROCESSING) {
            Ok(processing) => {
                let unread = processing.iter().filter(|o| !o.read).count();
                self.new_count.store(unread, Ordering::SeqCst);
                self.in_processing_count
                    .store(processing.len() - unread, Ordering::SeqCst);
            }
            Err(e) => warn!(error = %e, "failed to count new orders"),
        }
    }

    /// Mark an order as seen by the operator.
    pub fn mark_read(&self, id: i64) -> Result<(), SyncError> {
        self.repository.mark_read(id)?;
        self.refresh_counts();
        Ok(())
    }

    pub fn mark_unread(&self, id: i64) -> Result<(), SyncError> {
        self.repository.mark_unread(id)?;
        self.refresh_counts();
        Ok(())
    }

    /// Change an order's status remotely and store the returned copy.
    pub async fn update_order_status(
        &self,
        id: i64,
        status: &str,
    ) -> Result<OrderRecord, SyncError> {
        if self.settings.configuration_state() == ConfigurationState::MissingCredentials {
            return Err(SyncError::ConfigurationAbsent(
                "cannot update orders without credentials".into(),
            ));
        }
        let mut order = self
            .source
            .update_order_status(id, status, CallContext::default())
            .await?;
        if let Some(stored) = self.repository.get(id)? {
            order.carry_flags_from(&stored);
        }
        self.repository.upsert_orders(std::slice::from_ref(&order))?;
        self.refresh_counts();
        info!(order_id = id, status, "order status updated");
        Ok(order)
    }
}

#[async_trait]
impl CycleStep for OrderSyncCoordinator {
    async fn run_cycle(&self) -> Result<usize, SyncError> {
        Ok(self.run_once().await?.new_orders)
    }
}

/// Membership in the in-flight set for the lifetime of the guard.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<i64>>,
    id: i64,
}

impl<'a> InFlight<'a> {
    fn claim(set: &'a Mutex<HashSet<i64>>, id: i64) -> Option<Self> {
        let inserted = set.lock().unwrap_or_else(|e| e.into_inner()).insert(id);
        inserted.then_some(Self { set, id })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

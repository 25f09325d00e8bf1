//! Printer registry and per-profile connection state machine.
//!
//! The registry owns every configured [`PrinterProfile`] together with the
//! driver chosen for it and one [`ConnectionState`]. Connect, disconnect,
//! probe and send on a profile are serialized by a per-profile async lock.
//! Driver failures never escape as errors: they become state transitions,
//! and the background monitor reconnects on its next pass.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::drivers::{DeviceSignal, DriverRegistry, PrinterDriver, ProbeStatus};
use crate::error::PrinterError;
use crate::escpos::PaperWidth;
use crate::models::{OrderRecord, PrinterProfile, StoreSettings};
use crate::receipt_renderer::{render_minimal, render_order, render_test_page, RenderContext};
use crate::templates::TemplateConfig;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    PaperOut,
    Overheated,
    LowBattery,
}

impl ConnectionState {
    pub fn is_degraded(self) -> bool {
        matches!(
            self,
            ConnectionState::PaperOut | ConnectionState::Overheated | ConnectionState::LowBattery
        )
    }

    /// A driver link is open: connected, possibly with a device warning.
    pub fn is_linked(self) -> bool {
        self == ConnectionState::Connected || self.is_degraded()
    }

    fn from_signal(signal: DeviceSignal) -> Self {
        match signal {
            DeviceSignal::PaperOut => ConnectionState::PaperOut,
            DeviceSignal::Overheated => ConnectionState::Overheated,
            DeviceSignal::LowBattery => ConnectionState::LowBattery,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    ConnectStarted,
    ConnectSucceeded,
    ConnectFailed,
    ProbeSucceeded,
    ProbeFailed,
    Signal(DeviceSignal),
    Disconnect,
}

/// Pure transition function. Events that make no sense in a state leave it
/// unchanged.
pub fn next_state(state: ConnectionState, event: StateEvent) -> ConnectionState {
    use ConnectionState::*;
    match (state, event) {
        (_, StateEvent::Disconnect) => Disconnected,

        (Disconnected | Error, StateEvent::ConnectStarted) => Connecting,
        (_, StateEvent::ConnectStarted) => state,
        (_, StateEvent::ConnectSucceeded) => Connected,
        (_, StateEvent::ConnectFailed) => Error,

        (Connected | PaperOut | Overheated | LowBattery | Error, StateEvent::ProbeSucceeded) => {
            Connected
        }
        (Connected | PaperOut | Overheated | LowBattery | Connecting, StateEvent::ProbeFailed) => {
            Error
        }
        (Connected | PaperOut | Overheated | LowBattery, StateEvent::Signal(signal)) => {
            ConnectionState::from_signal(signal)
        }
        _ => state,
    }
}

/// Published on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub profile_id: String,
    pub from: ConnectionState,
    pub to: ConnectionState,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub probe_interval: Duration,
    /// Upper bound for one probe so a hung device cannot stall the loop.
    pub probe_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

struct Slot {
    profile: RwLock<PrinterProfile>,
    driver: Arc<dyn PrinterDriver>,
    state: Mutex<ConnectionState>,
    op_lock: tokio::sync::Mutex<()>,
    /// Completed connect attempts; lets waiters see that an attempt finished
    /// while they were queued on `op_lock`.
    attempts: AtomicU64,
}

impl Slot {
    fn new(profile: PrinterProfile, driver: Arc<dyn PrinterDriver>) -> Self {
        Self {
            profile: RwLock::new(profile),
            driver,
            state: Mutex::new(ConnectionState::Disconnected),
            op_lock: tokio::sync::Mutex::new(()),
            attempts: AtomicU64::new(0),
        }
    }

    fn profile(&self) -> PrinterProfile {
        self.profile.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct PrinterRegistry {
    drivers: Arc<DriverRegistry>,
    options: RegistryOptions,
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    events: broadcast::Sender<StateChange>,
}

impl PrinterRegistry {
    pub fn new(drivers: Arc<DriverRegistry>, options: RegistryOptions) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            drivers,
            options,
            slots: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    fn slot(&self, profile_id: &str) -> Result<Arc<Slot>, PrinterError> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(profile_id)
            .cloned()
            .ok_or_else(|| PrinterError::UnknownProfile(profile_id.to_string()))
    }

    fn all_slots(&self) -> Vec<Arc<Slot>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn transition(&self, profile_id: &str, slot: &Slot, event: StateEvent) -> ConnectionState {
        let (from, to) = {
            let mut state = slot.state.lock().unwrap_or_else(|e| e.into_inner());
            let from = *state;
            *state = next_state(from, event);
            (from, *state)
        };
        if from != to {
            info!(profile_id, from = ?from, to = ?to, "printer state changed");
            let _ = self.events.send(StateChange {
                profile_id: profile_id.to_string(),
                from,
                to,
            });
        }
        to
    }

    // -----------------------------------------------------------------------
    // Profiles
    // -----------------------------------------------------------------------

    /// Insert or replace a profile. A profile whose transport or driver
    /// changed gets a fresh slot; the old link is closed.
    pub async fn upsert_profile(&self, profile: PrinterProfile) -> PrinterProfile {
        if profile.is_default {
            self.clear_default_except(&profile.id);
        }
        let driver = self.drivers.for_profile(&profile);
        let replaced = {
            let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
            match slots.get(&profile.id) {
                Some(existing) => {
                    let old = existing.profile();
                    if old.transport == profile.transport && old.driver == profile.driver {
                        *existing.profile.write().unwrap_or_else(|e| e.into_inner()) =
                            profile.clone();
                        None
                    } else {
                        let new_slot = Arc::new(Slot::new(profile.clone(), driver));
                        slots
                            .insert(profile.id.clone(), new_slot)
                            .map(|slot| (slot, old.transport.address()))
                    }
                }
                None => {
                    slots.insert(profile.id.clone(), Arc::new(Slot::new(profile.clone(), driver)));
                    None
                }
            }
        };
        if let Some((old_slot, address)) = replaced {
            let _guard = old_slot.op_lock.lock().await;
            old_slot.driver.disconnect(&address).await;
        }
        info!(profile_id = %profile.id, name = %profile.name, "printer profile saved");
        profile
    }

    pub async fn remove_profile(&self, profile_id: &str) -> Result<PrinterProfile, PrinterError> {
        let slot = self
            .slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(profile_id)
            .ok_or_else(|| PrinterError::UnknownProfile(profile_id.to_string()))?;
        let profile = slot.profile();
        let _guard = slot.op_lock.lock().await;
        slot.driver.disconnect(&profile.transport.address()).await;
        info!(profile_id, "printer profile removed");
        Ok(profile)
    }

    pub fn profiles(&self) -> Vec<PrinterProfile> {
        let mut out: Vec<PrinterProfile> = self.all_slots().iter().map(|s| s.profile()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn profile(&self, profile_id: &str) -> Option<PrinterProfile> {
        self.slot(profile_id).ok().map(|s| s.profile())
    }

    pub fn default_profile(&self) -> Option<PrinterProfile> {
        self.all_slots()
            .iter()
            .map(|s| s.profile())
            .find(|p| p.is_default)
    }

    /// Make `profile_id` the only default profile.
    pub fn set_default(&self, profile_id: &str) -> Result<(), PrinterError> {
        let slot = self.slot(profile_id)?;
        self.clear_default_except(profile_id);
        slot.profile.write().unwrap_or_else(|e| e.into_inner()).is_default = true;
        info!(profile_id, "default printer profile set");
        Ok(())
    }

    fn clear_default_except(&self, profile_id: &str) {
        for (id, slot) in self.slots.read().unwrap_or_else(|e| e.into_inner()).iter() {
            if id != profile_id {
                slot.profile.write().unwrap_or_else(|e| e.into_inner()).is_default = false;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Unknown profiles read as disconnected.
    pub fn connection_state(&self, profile_id: &str) -> ConnectionState {
        self.slot(profile_id)
            .map(|s| s.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn connection_states(&self) -> HashMap<String, ConnectionState> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, slot)| (id.clone(), slot.state()))
            .collect()
    }

    /// Connect a profile. Already linked profiles are returned as they are;
    /// callers queued behind an in-flight attempt get that attempt's result.
    pub async fn connect(&self, profile_id: &str) -> Result<ConnectionState, PrinterError> {
        let slot = self.slot(profile_id)?;
        Ok(self.connect_slot(profile_id, &slot).await)
    }

    async fn connect_slot(&self, profile_id: &str, slot: &Slot) -> ConnectionState {
        let current = slot.state();
        if current.is_linked() {
            return current;
        }
        let seen = slot.attempts.load(Ordering::SeqCst);
        let _guard = slot.op_lock.lock().await;
        let current = slot.state();
        if current.is_linked() || slot.attempts.load(Ordering::SeqCst) != seen {
            debug!(profile_id, state = ?current, "connect collapsed into previous attempt");
            return current;
        }

        let address = slot.profile().transport.address();
        self.transition(profile_id, slot, StateEvent::ConnectStarted);
        let ok = match tokio::time::timeout(self.options.connect_timeout, slot.driver.connect(&address))
            .await
        {
            Ok(ok) => ok,
            Err(_) => {
                warn!(profile_id, address = %address, "printer connect timed out");
                false
            }
        };
        slot.attempts.fetch_add(1, Ordering::SeqCst);
        if !ok {
            warn!(profile_id, address = %address, driver = slot.driver.id(), "printer connect failed");
        }
        let event = if ok {
            StateEvent::ConnectSucceeded
        } else {
            StateEvent::ConnectFailed
        };
        self.transition(profile_id, slot, event)
    }

    /// Close a profile's link. Disconnecting a disconnected profile is a no-op.
    pub async fn disconnect(&self, profile_id: &str) -> Result<ConnectionState, PrinterError> {
        let slot = self.slot(profile_id)?;
        let _guard = slot.op_lock.lock().await;
        if slot.state() == ConnectionState::Disconnected {
            return Ok(ConnectionState::Disconnected);
        }
        slot.driver.disconnect(&slot.profile().transport.address()).await;
        Ok(self.transition(profile_id, &slot, StateEvent::Disconnect))
    }

    /// One bounded liveness probe. Profiles without an open link are left
    /// alone.
    pub async fn probe_once(&self, profile_id: &str) -> Result<ConnectionState, PrinterError> {
        let slot = self.slot(profile_id)?;
        let _guard = slot.op_lock.lock().await;
        if !slot.state().is_linked() {
            return Ok(slot.state());
        }
        let address = slot.profile().transport.address();
        let status = tokio::time::timeout(self.options.probe_timeout, slot.driver.probe(&address))
            .await
            .unwrap_or_else(|_| {
                warn!(profile_id, address = %address, "printer probe timed out");
                ProbeStatus::Unresponsive
            });
        let event = match status {
            ProbeStatus::Responsive => StateEvent::ProbeSucceeded,
            ProbeStatus::Degraded(signal) => StateEvent::Signal(signal),
            ProbeStatus::Unresponsive => StateEvent::ProbeFailed,
        };
        Ok(self.transition(profile_id, &slot, event))
    }

    /// Record a condition the device pushed on its own.
    pub fn report_device_signal(
        &self,
        profile_id: &str,
        signal: DeviceSignal,
    ) -> Result<ConnectionState, PrinterError> {
        let slot = self.slot(profile_id)?;
        Ok(self.transition(profile_id, &slot, StateEvent::Signal(signal)))
    }

    /// One pass of the background monitor over the default and keep-alive
    /// profiles: reconnect what is not linked, probe what is.
    pub async fn monitor_tick(&self) {
        let watched: Vec<String> = self
            .profiles()
            .into_iter()
            .filter(|p| p.is_default || p.keep_alive)
            .map(|p| p.id)
            .collect();
        for id in watched {
            let result = if self.connection_state(&id).is_linked() {
                self.probe_once(&id).await
            } else {
                self.connect(&id).await
            };
            if let Err(e) = result {
                debug!(profile_id = %id, error = %e, "printer monitor skipped profile");
            }
        }
    }

    /// Spawn the background monitor. It stops when `cancel` fires.
    pub fn start_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = self.options.probe_interval;
        info!(interval_ms = interval.as_millis() as u64, "Printer monitor started");
        tokio::spawn(async move {
            loop {
                registry.monitor_tick().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("Printer monitor stopped");
        })
    }

    pub async fn discover(&self) -> BTreeSet<String> {
        self.drivers.discover_all().await
    }

    // -----------------------------------------------------------------------
    // Printing
    // -----------------------------------------------------------------------

    /// Render `order` for a profile and send it. Returns `true` only when
    /// the driver accepted the bytes.
    pub async fn dispatch_print(
        &self,
        order: &OrderRecord,
        profile_id: &str,
        template: &TemplateConfig,
        store: &StoreSettings,
    ) -> bool {
        let slot = match self.slot(profile_id) {
            Ok(slot) => slot,
            Err(e) => {
                warn!(order_id = order.id, error = %e, "print dispatch skipped");
                return false;
            }
        };
        let profile = slot.profile();
        let ctx = RenderContext::new(store.clone(), PaperWidth::from_mm(profile.paper_width_mm));
        let effective = template.restricted_by(&profile.sections);
        let markup = match render_order(order, &effective, &ctx) {
            Ok(markup) => markup,
            Err(e) => {
                warn!(order_id = order.id, error = %e, "template render failed, printing minimal receipt");
                render_minimal(order, &ctx)
            }
        };
        let ok = self.print_markup(profile_id, &slot, &markup.to_string()).await;
        if ok {
            info!(order_id = order.id, profile_id, "order printed");
        }
        ok
    }

    pub async fn print_test_page(
        &self,
        profile_id: &str,
        store: &StoreSettings,
    ) -> Result<bool, PrinterError> {
        let slot = self.slot(profile_id)?;
        let profile = slot.profile();
        let ctx = RenderContext::new(store.clone(), PaperWidth::from_mm(profile.paper_width_mm));
        let markup = render_test_page(&profile, &ctx);
        Ok(self.print_markup(profile_id, &slot, &markup.to_string()).await)
    }

    async fn print_markup(&self, profile_id: &str, slot: &Slot, markup: &str) -> bool {
        if !slot.state().is_linked() && !self.connect_slot(profile_id, slot).await.is_linked() {
            warn!(profile_id, "printer not connected, print dropped");
            return false;
        }
        let _guard = slot.op_lock.lock().await;
        let profile = slot.profile();
        let bytes = slot
            .driver
            .compile(markup, PaperWidth::from_mm(profile.paper_width_mm));
        if bytes.is_empty() {
            warn!(profile_id, driver = slot.driver.id(), "driver produced no output");
            return false;
        }
        let ok = slot.driver.send(&profile.transport.address(), &bytes).await;
        if !ok {
            self.transition(profile_id, slot, StateEvent::ProbeFailed);
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::EscPosOptions;
    use crate::models::{LineItem, TransportKind};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Driver whose results are scripted per call. Empty scripts succeed.
    #[derive(Default)]
    struct RecordingDriver {
        connect_results: Mutex<VecDeque<bool>>,
        probe_results: Mutex<VecDeque<ProbeStatus>>,
        send_ok: Mutex<bool>,
        connect_delay: Duration,
        connects: AtomicUsize,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingDriver {
        fn new() -> Self {
            Self {
                send_ok: Mutex::new(true),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl PrinterDriver for RecordingDriver {
        fn id(&self) -> &str {
            "recording"
        }
        async fn connect(&self, _address: &str) -> bool {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if !self.connect_delay.is_zero() {
                tokio::time::sleep(self.connect_delay).await;
            }
            self.connect_results.lock().unwrap().pop_front().unwrap_or(true)
        }
        async fn disconnect(&self, _address: &str) {}
        async fn probe(&self, _address: &str) -> ProbeStatus {
            self.probe_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ProbeStatus::Responsive)
        }
        async fn send(&self, _address: &str, bytes: &[u8]) -> bool {
            self.sent.lock().unwrap().push(bytes.to_vec());
            *self.send_ok.lock().unwrap()
        }
        async fn discover(&self) -> BTreeSet<String> {
            BTreeSet::from(["00:11:22:33:44:55".to_string()])
        }
        fn compile(&self, markup: &str, _paper: PaperWidth) -> Vec<u8> {
            markup.as_bytes().to_vec()
        }
    }

    fn registry_with(driver: Arc<RecordingDriver>) -> Arc<PrinterRegistry> {
        let mut drivers = DriverRegistry::with_defaults(EscPosOptions::default(), Vec::new());
        drivers.register(driver);
        Arc::new(PrinterRegistry::new(
            Arc::new(drivers),
            RegistryOptions {
                probe_interval: Duration::from_millis(100),
                probe_timeout: Duration::from_millis(200),
                connect_timeout: Duration::from_millis(500),
            },
        ))
    }

    fn profile(id: &str, is_default: bool) -> PrinterProfile {
        let mut p = PrinterProfile::new(
            format!("Printer {id}"),
            TransportKind::Network {
                host: "10.0.0.9".into(),
                port: 9100,
            },
        );
        p.id = id.to_string();
        p.is_default = is_default;
        p.driver = Some("recording".into());
        p
    }

    fn order() -> OrderRecord {
        let mut order = OrderRecord::new(100, "100", "processing");
        order.items.push(LineItem {
            product_id: 1,
            name: "Tea".into(),
            quantity: 1,
            unit_price: 2.0,
            line_total: 2.0,
            options: Vec::new(),
        });
        order
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        assert_eq!(next_state(Disconnected, StateEvent::ConnectStarted), Connecting);
        assert_eq!(next_state(Connecting, StateEvent::ConnectSucceeded), Connected);
        assert_eq!(next_state(Connecting, StateEvent::ConnectFailed), Error);
        assert_eq!(next_state(Connected, StateEvent::ProbeFailed), Error);
        assert_eq!(
            next_state(Connected, StateEvent::Signal(DeviceSignal::PaperOut)),
            PaperOut
        );
        assert_eq!(next_state(Overheated, StateEvent::ProbeSucceeded), Connected);
        assert_eq!(next_state(Error, StateEvent::Disconnect), Disconnected);
        assert_eq!(next_state(Connected, StateEvent::Disconnect), Disconnected);
        // events that do not apply leave the state alone
        assert_eq!(next_state(Disconnected, StateEvent::ProbeFailed), Disconnected);
        assert_eq!(
            next_state(Disconnected, StateEvent::Signal(DeviceSignal::LowBattery)),
            Disconnected
        );
        assert_eq!(next_state(Connected, StateEvent::ConnectStarted), Connected);
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_are_idempotent() {
        let driver = Arc::new(RecordingDriver::new());
        let registry = registry_with(driver.clone());
        registry.upsert_profile(profile("p", true)).await;

        assert_eq!(registry.disconnect("p").await.unwrap(), ConnectionState::Disconnected);
        assert_eq!(registry.connect("p").await.unwrap(), ConnectionState::Connected);
        assert_eq!(registry.connect("p").await.unwrap(), ConnectionState::Connected);
        assert_eq!(driver.connects.load(Ordering::SeqCst), 1);

        assert_eq!(registry.disconnect("p").await.unwrap(), ConnectionState::Disconnected);
        assert_eq!(registry.disconnect("p").await.unwrap(), ConnectionState::Disconnected);
        assert!(matches!(
            registry.connect("missing").await,
            Err(PrinterError::UnknownProfile(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_collapse() {
        let driver = Arc::new(RecordingDriver {
            connect_delay: Duration::from_millis(50),
            connect_results: Mutex::new(VecDeque::from([false, true])),
            ..RecordingDriver::new()
        });
        let registry = registry_with(driver.clone());
        registry.upsert_profile(profile("p", true)).await;

        let (a, b, c) = tokio::join!(
            registry.connect("p"),
            registry.connect("p"),
            registry.connect("p")
        );
        assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), ConnectionState::Error);
        assert_eq!(b.unwrap(), ConnectionState::Error);
        assert_eq!(c.unwrap(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_probe_failures_then_recovery() {
        let driver = Arc::new(RecordingDriver {
            // first connect succeeds, then two reconnects fail, then one works
            connect_results: Mutex::new(VecDeque::from([true, false, false, true])),
            probe_results: Mutex::new(VecDeque::from([ProbeStatus::Unresponsive])),
            ..RecordingDriver::new()
        });
        let registry = registry_with(driver.clone());
        registry.upsert_profile(profile("p", true)).await;
        let mut changes = registry.subscribe();

        registry.connect("p").await.unwrap();
        let mut seen = vec![registry.connection_state("p")];
        for _ in 0..4 {
            registry.monitor_tick().await;
            seen.push(registry.connection_state("p"));
        }
        use ConnectionState::*;
        assert_eq!(seen, vec![Connected, Error, Error, Error, Connected]);
        assert_eq!(driver.connects.load(Ordering::SeqCst), 4);

        let first = changes.recv().await.unwrap();
        assert_eq!((first.from, first.to), (Disconnected, Connecting));
    }

    #[tokio::test]
    async fn test_device_signals_degrade_and_probe_restores() {
        let driver = Arc::new(RecordingDriver {
            probe_results: Mutex::new(VecDeque::from([
                ProbeStatus::Degraded(DeviceSignal::PaperOut),
                ProbeStatus::Responsive,
            ])),
            ..RecordingDriver::new()
        });
        let registry = registry_with(driver);
        registry.upsert_profile(profile("p", true)).await;
        registry.connect("p").await.unwrap();

        assert_eq!(registry.probe_once("p").await.unwrap(), ConnectionState::PaperOut);
        assert_eq!(registry.probe_once("p").await.unwrap(), ConnectionState::Connected);
        assert_eq!(
            registry.report_device_signal("p", DeviceSignal::LowBattery).unwrap(),
            ConnectionState::LowBattery
        );
    }

    #[tokio::test]
    async fn test_single_default_profile() {
        let registry = registry_with(Arc::new(RecordingDriver::new()));
        registry.upsert_profile(profile("a", true)).await;
        registry.upsert_profile(profile("b", true)).await;
        assert_eq!(registry.default_profile().map(|p| p.id), Some("b".to_string()));

        registry.set_default("a").unwrap();
        let defaults: Vec<String> = registry
            .profiles()
            .into_iter()
            .filter(|p| p.is_default)
            .map(|p| p.id)
            .collect();
        assert_eq!(defaults, vec!["a".to_string()]);

        registry.remove_profile("a").await.unwrap();
        assert!(registry.default_profile().is_none());
        assert!(registry.set_default("a").is_err());
    }

    #[tokio::test]
    async fn test_dispatch_connects_first_and_applies_profile_sections() {
        let driver = Arc::new(RecordingDriver::new());
        let registry = registry_with(driver.clone());
        let mut p = profile("p", true);
        p.sections.item_prices = false;
        registry.upsert_profile(p).await;

        let ok = registry
            .dispatch_print(&order(), "p", &TemplateConfig::default(), &StoreSettings::default())
            .await;
        assert!(ok);
        assert_eq!(registry.connection_state("p"), ConnectionState::Connected);

        let sent = driver.sent.lock().unwrap();
        let text = String::from_utf8(sent[0].clone()).unwrap();
        assert!(text.contains("[L]Tea[R]1\n"));
        assert!(text.ends_with("[CUT]\n"));
    }

    #[tokio::test]
    async fn test_dispatch_falls_back_to_minimal_receipt() {
        let driver = Arc::new(RecordingDriver::new());
        let registry = registry_with(driver.clone());
        registry.upsert_profile(profile("p", true)).await;
        let mut broken = TemplateConfig::default();
        broken.template_id.clear();

        assert!(
            registry
                .dispatch_print(&order(), "p", &broken, &StoreSettings::default())
                .await
        );
        let text = String::from_utf8(driver.sent.lock().unwrap()[0].clone()).unwrap();
        assert!(text.contains("[L]Tea[R]1\n"));
        assert!(!text.contains("Thank you"));
    }

    #[tokio::test]
    async fn test_failed_send_moves_to_error() {
        let driver = Arc::new(RecordingDriver::new());
        *driver.send_ok.lock().unwrap() = false;
        let registry = registry_with(driver.clone());
        registry.upsert_profile(profile("p", true)).await;

        assert!(
            !registry
                .dispatch_print(&order(), "p", &TemplateConfig::default(), &StoreSettings::default())
                .await
        );
        assert_eq!(registry.connection_state("p"), ConnectionState::Error);
        assert!(
            !registry
                .dispatch_print(&order(), "missing", &TemplateConfig::default(), &StoreSettings::default())
                .await
        );
    }

    #[tokio::test]
    async fn test_unavailable_vendor_profile_degrades_to_error() {
        let registry = registry_with(Arc::new(RecordingDriver::new()));
        let mut p = profile("star", true);
        p.driver = Some("star".into());
        registry.upsert_profile(p).await;

        assert_eq!(registry.connect("star").await.unwrap(), ConnectionState::Error);
        assert!(!registry.print_test_page("star", &StoreSettings::default()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_on_cancel() {
        let driver = Arc::new(RecordingDriver::new());
        let registry = registry_with(driver.clone());
        registry.upsert_profile(profile("p", true)).await;
        let cancel = CancellationToken::new();
        let handle = registry.start_monitor(cancel.clone());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(registry.connection_state("p"), ConnectionState::Connected);
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
        assert!(registry.discover().await.contains("00:11:22:33:44:55"));
    }
}

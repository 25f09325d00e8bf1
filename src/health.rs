//! Watchdog for the polling loop.
//!
//! Every check interval the monitor compares the loop's last-activity
//! timestamp with a stuck threshold. Alerts are edge triggered: one timeout
//! when the loop becomes stuck, repeated only after a cooldown while it stays
//! stuck, and exactly one recovery when it starts moving again.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Wall clock in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self(AtomicI64::new(start_ms))
    }

    pub fn set(&self, ms: i64) {
        self.0.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Configuration and collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
    /// Idle time after which an active loop counts as stuck. Never below the
    /// check interval.
    pub stuck_threshold_secs: u64,
    pub alert_cooldown_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            stuck_threshold_secs: 180,
            alert_cooldown_secs: 120,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    fn threshold_ms(&self) -> i64 {
        secs_to_ms(self.stuck_threshold_secs.max(self.check_interval_secs))
    }

    fn cooldown_ms(&self) -> i64 {
        secs_to_ms(self.alert_cooldown_secs)
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

/// The loop being watched.
pub trait HealthTarget: Send + Sync {
    /// Whether the loop is supposed to be running right now.
    fn is_active(&self) -> bool;

    /// Epoch milliseconds of the last cycle attempt, if any.
    fn last_activity_ms(&self) -> Option<i64>;
}

pub trait HealthListener: Send + Sync {
    fn on_timeout(&self, idle: Duration);
    fn on_recovered(&self, idle: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    Timeout { idle_ms: i64 },
    Recovered { idle_ms: i64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingHealthState {
    pub last_activity_ms: i64,
    pub is_stuck: bool,
    pub last_alert_ms: i64,
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct HealthMonitor {
    config: HealthConfig,
    target: Arc<dyn HealthTarget>,
    listener: Arc<dyn HealthListener>,
    clock: Arc<dyn Clock>,
    state: Mutex<PollingHealthState>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        target: Arc<dyn HealthTarget>,
        listener: Arc<dyn HealthListener>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            target,
            listener,
            clock,
            state: Mutex::new(PollingHealthState::default()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn state(&self) -> PollingHealthState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One evaluation. The decision is taken under the state lock; the
    /// listener is called after the lock is released.
    pub fn check(&self) -> Option<HealthEvent> {
        let now = self.clock.now_ms();
        let event = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            decide(&mut state, &self.config, self.target.as_ref(), now)
        };

        match event {
            Some(HealthEvent::Timeout { idle_ms }) => {
                warn!(idle_ms, "polling loop looks stuck");
                self.listener.on_timeout(ms_to_duration(idle_ms));
            }
            Some(HealthEvent::Recovered { idle_ms }) => {
                info!(idle_ms, "polling loop recovered");
                self.listener.on_recovered(ms_to_duration(idle_ms));
            }
            None => {}
        }
        event
    }

    /// Run `check` every check interval until `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = self.config.check_interval();
        info!(interval_secs = interval.as_secs(), "Health monitor started");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                monitor.check();
            }
            *monitor.state.lock().unwrap_or_else(|e| e.into_inner()) =
                PollingHealthState::default();
            info!("Health monitor stopped");
        })
    }
}

fn decide(
    state: &mut PollingHealthState,
    config: &HealthConfig,
    target: &dyn HealthTarget,
    now: i64,
) -> Option<HealthEvent> {
    if !target.is_active() {
        let was_stuck = state.is_stuck;
        state.is_stuck = false;
        return was_stuck.then_some(HealthEvent::Recovered { idle_ms: 0 });
    }

    // Missing or bogus timestamps read as "just now".
    let last = target.last_activity_ms().filter(|t| *t > 0).unwrap_or(now);
    state.last_activity_ms = last;
    let idle_ms = (now - last).max(0);

    if idle_ms >= config.threshold_ms() {
        let alert = !state.is_stuck || now - state.last_alert_ms >= config.cooldown_ms();
        state.is_stuck = true;
        if alert {
            state.last_alert_ms = now;
            return Some(HealthEvent::Timeout { idle_ms });
        }
        debug!(idle_ms, "still stuck, alert suppressed by cooldown");
        None
    } else if state.is_stuck {
        state.is_stuck = false;
        Some(HealthEvent::Recovered { idle_ms })
    } else {
        None
    }
}

fn ms_to_duration(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct FakeTarget {
        active: AtomicBool,
        last: AtomicI64,
    }

    impl FakeTarget {
        fn new(last: i64) -> Arc<Self> {
            Arc::new(Self {
                active: AtomicBool::new(true),
                last: AtomicI64::new(last),
            })
        }
    }

    impl HealthTarget for FakeTarget {
        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
        fn last_activity_ms(&self) -> Option<i64> {
            Some(self.last.load(Ordering::SeqCst))
        }
    }

    #[derive(Default)]
    struct CountingListener {
        timeouts: AtomicUsize,
        recoveries: AtomicUsize,
    }

    impl HealthListener for CountingListener {
        fn on_timeout(&self, _idle: Duration) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
        fn on_recovered(&self, _idle: Duration) {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
        }
    }

    const START: i64 = 1_700_000_000_000;

    fn monitor(
        target: Arc<FakeTarget>,
    ) -> (HealthMonitor, Arc<CountingListener>, Arc<ManualClock>) {
        let listener = Arc::new(CountingListener::default());
        let clock = Arc::new(ManualClock::new(START));
        let monitor = HealthMonitor::new(
            HealthConfig {
                check_interval_secs: 30,
                stuck_threshold_secs: 60,
                alert_cooldown_secs: 120,
            },
            target,
            listener.clone(),
            clock.clone(),
        );
        (monitor, listener, clock)
    }

    #[test]
    fn test_timeout_alerts_are_debounced() {
        let target = FakeTarget::new(START);
        let (monitor, listener, clock) = monitor(target);

        clock.advance(Duration::from_secs(60));
        // stuck continuously for 10 cooldown windows, checked every 30s
        let window = Duration::from_secs(120 * 10);
        let mut elapsed = Duration::ZERO;
        while elapsed < window {
            monitor.check();
            clock.advance(Duration::from_secs(30));
            elapsed += Duration::from_secs(30);
        }
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 10);
        assert_eq!(listener.recoveries.load(Ordering::SeqCst), 0);
        assert!(monitor.state().is_stuck);
    }

    #[test]
    fn test_concurrent_checks_fire_one_timeout() {
        let target = FakeTarget::new(START);
        let (monitor, listener, clock) = monitor(target.clone());
        clock.advance(Duration::from_secs(90));

        let barrier = std::sync::Barrier::new(8);
        let fired = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    barrier.wait();
                    if matches!(monitor.check(), Some(HealthEvent::Timeout { .. })) {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 1);
        assert!(monitor.state().is_stuck);

        // same for the recovery edge
        target.last.store(clock.now_ms(), Ordering::SeqCst);
        let barrier = std::sync::Barrier::new(8);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    barrier.wait();
                    monitor.check();
                });
            }
        });
        assert_eq!(listener.recoveries.load(Ordering::SeqCst), 1);
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_huge_windows_do_not_overflow() {
        let config = HealthConfig {
            check_interval_secs: 30,
            stuck_threshold_secs: u64::MAX,
            alert_cooldown_secs: u64::MAX / 10,
        };
        assert_eq!(config.threshold_ms(), i64::MAX);
        assert_eq!(config.cooldown_ms(), i64::MAX);

        let listener = Arc::new(CountingListener::default());
        let clock = Arc::new(ManualClock::new(START));
        let monitor = HealthMonitor::new(config, FakeTarget::new(START), listener.clone(), clock.clone());
        clock.advance(Duration::from_secs(3600));
        assert_eq!(monitor.check(), None);
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recovery_fires_once_per_stuck_period() {
        let target = FakeTarget::new(START);
        let (monitor, listener, clock) = monitor(target.clone());

        clock.advance(Duration::from_secs(90));
        assert!(matches!(monitor.check(), Some(HealthEvent::Timeout { idle_ms: 90_000 })));

        target.last.store(clock.now_ms(), Ordering::SeqCst);
        clock.advance(Duration::from_secs(5));
        assert_eq!(monitor.check(), Some(HealthEvent::Recovered { idle_ms: 5_000 }));
        assert_eq!(monitor.check(), None);
        assert_eq!(monitor.check(), None);
        assert_eq!(listener.recoveries.load(Ordering::SeqCst), 1);
        assert!(!monitor.state().is_stuck);
    }

    #[test]
    fn test_inactive_loop_clears_stuck_state() {
        let target = FakeTarget::new(START);
        let (monitor, listener, clock) = monitor(target.clone());

        clock.advance(Duration::from_secs(300));
        monitor.check();
        target.active.store(false, Ordering::SeqCst);
        assert_eq!(monitor.check(), Some(HealthEvent::Recovered { idle_ms: 0 }));
        assert_eq!(monitor.check(), None);
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(listener.recoveries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_timestamp_reads_as_now() {
        let target = FakeTarget::new(0);
        let (monitor, listener, clock) = monitor(target);
        clock.advance(Duration::from_secs(3600));
        assert_eq!(monitor.check(), None);
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.state().last_activity_ms, clock.now_ms());
    }

    #[test]
    fn test_threshold_never_below_check_interval() {
        let target = FakeTarget::new(START);
        let listener = Arc::new(CountingListener::default());
        let clock = Arc::new(ManualClock::new(START));
        let monitor = HealthMonitor::new(
            HealthConfig {
                check_interval_secs: 30,
                stuck_threshold_secs: 5,
                alert_cooldown_secs: 120,
            },
            target,
            listener,
            clock.clone(),
        );
        clock.advance(Duration::from_secs(20));
        assert_eq!(monitor.check(), None);
        clock.advance(Duration::from_secs(10));
        assert!(monitor.check().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_checks_until_cancelled() {
        let target = FakeTarget::new(START);
        let (monitor, listener, clock) = monitor(target);
        clock.advance(Duration::from_secs(600));
        let monitor = Arc::new(monitor);
        let cancel = CancellationToken::new();
        let handle = monitor.start(cancel.clone());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 1);
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(monitor.state(), PollingHealthState::default());
    }
}

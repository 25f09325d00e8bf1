//! Periodic fetch loop.
//!
//! The interval is read from a watch channel at the top of every cycle, so a
//! settings change takes effect on the next sleep without restarting the
//! loop. A failed cycle is logged and the loop carries on. A cycle that
//! outlives the cycle timeout is dropped and counts as failed.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::health::{Clock, HealthTarget};

/// Shortest sleep between cycles, whatever the settings say.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(300);

/// One fetch-and-process step. Returns the number of orders it handled.
#[async_trait]
pub trait CycleStep: Send + Sync {
    async fn run_cycle(&self) -> Result<usize, SyncError>;
}

pub struct PollingScheduler {
    step: Arc<dyn CycleStep>,
    interval: watch::Receiver<Duration>,
    clock: Arc<dyn Clock>,
    cycle_timeout: Duration,
    active: AtomicBool,
    in_cycle: AtomicBool,
    /// Bumped by every `start`; a loop whose generation is stale exits
    /// without touching shared flags.
    generation: AtomicU64,
    last_attempt_ms: AtomicI64,
    last_success_ms: AtomicI64,
    last_error: Mutex<Option<String>>,
    wake: Notify,
}

impl PollingScheduler {
    pub fn new(
        step: Arc<dyn CycleStep>,
        interval: watch::Receiver<Duration>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            step,
            interval,
            clock,
            cycle_timeout: DEFAULT_CYCLE_TIMEOUT,
            active: AtomicBool::new(false),
            in_cycle: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            last_attempt_ms: AtomicI64::new(0),
            last_success_ms: AtomicI64::new(0),
            last_error: Mutex::new(None),
            wake: Notify::new(),
        }
    }

    pub fn with_cycle_timeout(mut self, timeout: Duration) -> Self {
        self.cycle_timeout = timeout.max(MIN_INTERVAL);
        self
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// A cycle is executing right now (as opposed to sleeping between
    /// cycles).
    pub fn is_in_cycle(&self) -> bool {
        self.in_cycle.load(Ordering::SeqCst)
    }

    /// Epoch ms of the last finished cycle, successful or not. `None` before
    /// the first cycle.
    pub fn last_attempt_ms(&self) -> Option<i64> {
        positive(self.last_attempt_ms.load(Ordering::SeqCst))
    }

    pub fn last_success_ms(&self) -> Option<i64> {
        positive(self.last_success_ms.load(Ordering::SeqCst))
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn current_interval(&self) -> Duration {
        (*self.interval.borrow()).max(MIN_INTERVAL)
    }

    /// Cut the current sleep short and run a cycle now.
    pub fn force_cycle(&self) {
        self.wake.notify_one();
    }

    /// Ask the loop to exit after the cycle in flight, if any.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        // Wakes a sleeping loop without leaving a permit for the next run.
        self.wake.notify_waiters();
    }

    /// Run cycles until stopped or cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let generation = self.begin();
        self.run_loop(cancel, generation).await;
    }

    /// Spawn the loop. Any loop started earlier stops touching the shared
    /// state; callers replacing a stuck task should still abort it.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        // Flagged before the spawn so a stop() racing it is not lost.
        let generation = self.begin();
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run_loop(cancel, generation).await })
    }

    fn begin(&self) -> u64 {
        self.in_cycle.store(false, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn run_loop(&self, cancel: CancellationToken, generation: u64) {
        info!(interval_secs = self.current_interval().as_secs(), generation, "Polling loop started");

        loop {
            if !self.is_active() || cancel.is_cancelled() || !self.is_current(generation) {
                break;
            }

            self.in_cycle.store(true, Ordering::SeqCst);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout(self.cycle_timeout, self.step.run_cycle()) => r
                    .unwrap_or_else(|_| Err(SyncError::TimedOut(self.cycle_timeout.as_secs()))),
            };
            if !self.is_current(generation) {
                break;
            }
            self.in_cycle.store(false, Ordering::SeqCst);

            match outcome {
                Ok(handled) => {
                    if handled > 0 {
                        info!(handled, "Sync cycle complete");
                    } else {
                        debug!("Sync cycle complete, nothing new");
                    }
                    self.last_success_ms
                        .store(self.clock.now_ms(), Ordering::SeqCst);
                    self.set_last_error(None);
                }
                Err(e) => {
                    warn!(error = %e, "Sync cycle failed");
                    self.set_last_error(Some(e.to_string()));
                }
            }
            self.last_attempt_ms
                .store(self.clock.now_ms(), Ordering::SeqCst);

            if !self.is_active() {
                break;
            }

            let interval = self.current_interval();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => debug!("Sync cycle woken early"),
                _ = tokio::time::sleep(interval) => {}
            }
        }

        if self.is_current(generation) {
            self.in_cycle.store(false, Ordering::SeqCst);
            self.active.store(false, Ordering::SeqCst);
        }
        info!(generation, "Polling loop stopped");
    }

    fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }
}

impl HealthTarget for PollingScheduler {
    fn is_active(&self) -> bool {
        PollingScheduler::is_active(self)
    }

    fn last_activity_ms(&self) -> Option<i64> {
        self.last_attempt_ms()
    }
}

fn positive(ms: i64) -> Option<i64> {
    (ms > 0).then_some(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::health::ManualClock;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingStep {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl CycleStep for CountingStep {
        async fn run_cycle(&self) -> Result<usize, SyncError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(SourceError::Timeout("shop".into()).into());
            }
            Ok(0)
        }
    }

    fn scheduler(
        step: Arc<CountingStep>,
        secs: u64,
    ) -> (Arc<PollingScheduler>, watch::Sender<Duration>) {
        let (tx, rx) = watch::channel(Duration::from_secs(secs));
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        (Arc::new(PollingScheduler::new(step, rx, clock)), tx)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_a_cycle_per_interval() {
        let step = Arc::new(CountingStep::default());
        let (scheduler, _tx) = scheduler(step.clone(), 10);
        let cancel = CancellationToken::new();
        let handle = scheduler.start(cancel.clone());

        settle().await;
        assert_eq!(step.calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(step.calls.load(Ordering::SeqCst), 3);

        cancel.cancel();
        handle.await.unwrap();
        assert!(!scheduler.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycles_do_not_stop_the_loop() {
        let step = Arc::new(CountingStep {
            fail_first: 2,
            ..Default::default()
        });
        let (scheduler, _tx) = scheduler(step.clone(), 5);
        let cancel = CancellationToken::new();
        let handle = scheduler.start(cancel.clone());

        settle().await;
        assert!(scheduler.last_error().is_some());
        assert!(scheduler.last_success_ms().is_none());
        assert!(scheduler.last_attempt_ms().is_some());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(step.calls.load(Ordering::SeqCst), 3);
        assert!(scheduler.last_error().is_none());
        assert!(scheduler.last_success_ms().is_some());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_applies_to_next_sleep() {
        let step = Arc::new(CountingStep::default());
        let (scheduler, tx) = scheduler(step.clone(), 60);
        let cancel = CancellationToken::new();
        let handle = scheduler.start(cancel.clone());
        settle().await;

        tx.send(Duration::from_secs(5)).unwrap();
        // the 60s sleep already in progress still has to elapse
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(step.calls.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(step.calls.load(Ordering::SeqCst), 4);

        cancel.cancel();
        handle.await.unwrap();
    }

    /// Hangs on the first call, returns immediately afterwards.
    #[derive(Default)]
    struct HangOnceStep {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CycleStep for HangOnceStep {
        async fn run_cycle(&self) -> Result<usize, SyncError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            Ok(1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_cycle_is_abandoned_after_timeout() {
        let step = Arc::new(HangOnceStep::default());
        let (tx, rx) = watch::channel(Duration::from_secs(5));
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let scheduler = Arc::new(
            PollingScheduler::new(step.clone(), rx, clock)
                .with_cycle_timeout(Duration::from_secs(30)),
        );
        let cancel = CancellationToken::new();
        let handle = scheduler.start(cancel.clone());

        settle().await;
        assert!(scheduler.is_in_cycle());
        assert!(scheduler.last_attempt_ms().is_none());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!scheduler.is_in_cycle());
        assert!(scheduler.last_error().unwrap().contains("timed out"));
        assert!(scheduler.last_attempt_ms().is_some());

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(step.calls.load(Ordering::SeqCst), 2);
        assert!(scheduler.last_error().is_none());

        cancel.cancel();
        handle.await.unwrap();
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_loop_leaves_shared_state_alone() {
        let step = Arc::new(HangOnceStep::default());
        let (_tx, rx) = watch::channel(Duration::from_secs(5));
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let scheduler = Arc::new(PollingScheduler::new(step.clone(), rx, clock));

        let first_cancel = CancellationToken::new();
        let first = scheduler.start(first_cancel.clone());
        settle().await;
        assert!(scheduler.is_in_cycle());

        let second = scheduler.start(CancellationToken::new());
        first_cancel.cancel();
        first.await.unwrap();
        settle().await;

        // the first loop's exit did not clear the second loop's flags
        assert!(scheduler.is_active());
        assert_eq!(step.calls.load(Ordering::SeqCst), 2);

        scheduler.stop();
        second.await.unwrap();
        assert!(!scheduler.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_force_cycle() {
        let step = Arc::new(CountingStep::default());
        let (scheduler, _tx) = scheduler(step.clone(), 300);
        let handle = scheduler.start(CancellationToken::new());
        settle().await;

        scheduler.force_cycle();
        settle().await;
        assert_eq!(step.calls.load(Ordering::SeqCst), 2);

        scheduler.stop();
        handle.await.unwrap();
        assert!(!scheduler.is_active());
        assert_eq!(step.calls.load(Ordering::SeqCst), 2);
    }
}

//! Debounce coordinator.
//!
//! Tool registration via `#[mesh::tool]` happens as static initializers run
//! at process startup, which can trigger in quick, irregular bursts
//! depending on module load order. The coordinator collapses a burst into a
//! single fire once a quiet period passes with no further registrations,
//! so the startup pipeline's schema-extraction step runs once, not once per
//! registration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

const MIN_QUIET_PERIOD: Duration = Duration::from_millis(50);
const MAX_QUIET_PERIOD: Duration = Duration::from_millis(250);

/// Coordinates a single fire after a burst of `notify()` calls goes quiet.
/// Once `close()` is called (startup has completed and moved on), further
/// `notify()` calls are ignored rather than silently queued.
pub struct DebounceCoordinator {
    quiet_period: Duration,
    notify: Arc<Notify>,
    generation: Arc<AtomicU64>,
    closed: AtomicBool,
}

impl DebounceCoordinator {
    /// `quiet_period` is clamped to `[50ms, 250ms]` to match the window the
    /// startup pipeline expects registrations to settle within.
    pub fn new(quiet_period: Duration) -> Self {
        let quiet_period = quiet_period.clamp(MIN_QUIET_PERIOD, MAX_QUIET_PERIOD);
        Self {
            quiet_period,
            notify: Arc::new(Notify::new()),
            generation: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    /// Record an event (e.g. a tool registration). Bumps the generation
    /// counter so any in-flight quiet-period wait restarts its timer.
    pub fn notify(&self) {
        if self.closed.load(Ordering::SeqCst) {
            warn!("debounce coordinator received a registration after startup completed; ignoring");
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Block until `quiet_period` elapses with no intervening `notify()`
    /// call, then fire exactly once. Callers should call this once at
    /// startup, not per-registration.
    pub async fn wait_for_quiet(&self) {
        loop {
            let generation_before = self.generation.load(Ordering::SeqCst);
            tokio::select! {
                _ = tokio::time::sleep(self.quiet_period) => {
                    if self.generation.load(Ordering::SeqCst) == generation_before {
                        debug!("debounce quiet period elapsed, firing");
                        return;
                    }
                }
                _ = self.notify.notified() => {
                    continue;
                }
            }
        }
    }

    /// Mark the debounce window closed. Subsequent `notify()` calls are
    /// logged and dropped instead of participating in a future quiet-period
    /// wait, since startup has already consumed the initial registration
    /// snapshot.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn fires_once_after_quiet_period_following_a_burst() {
        let coordinator = DebounceCoordinator::new(Duration::from_millis(50));
        coordinator.notify();
        coordinator.notify();
        coordinator.notify();

        let start = Instant::now();
        coordinator.wait_for_quiet().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn restarts_the_quiet_timer_on_late_notify() {
        let coordinator = Arc::new(DebounceCoordinator::new(Duration::from_millis(60)));
        coordinator.notify();

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_for_quiet().await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        coordinator.notify();

        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn ignores_notify_after_close() {
        let coordinator = DebounceCoordinator::new(Duration::from_millis(50));
        coordinator.close();
        coordinator.notify();
        assert!(coordinator.is_closed());
    }

    #[test]
    fn clamps_quiet_period_to_the_documented_range() {
        let too_short = DebounceCoordinator::new(Duration::from_millis(1));
        assert_eq!(too_short.quiet_period, MIN_QUIET_PERIOD);

        let too_long = DebounceCoordinator::new(Duration::from_secs(5));
        assert_eq!(too_long.quiet_period, MAX_QUIET_PERIOD);
    }
}

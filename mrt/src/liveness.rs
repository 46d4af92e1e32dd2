//! Inactivity tracking and the per-record liveness checker.
//!
//! Every receiver peer and every sender connection owns an
//! [`Inactivity`] counter. Inbound traffic resets it to zero; a periodic
//! checker task adds one period per tick and, once the counter passes the
//! threshold, runs the record's finaliser and exits.
//!
//! The checker is the **only** path that frees a record. An explicit close
//! (RCLS / ACLS / `disconnect`) does not tear anything down itself; it
//! pushes the counter over the threshold with [`Inactivity::force_expire`]
//! and lets the next tick do the work.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::lock;

/// Amount by which a forced expiry overshoots the threshold.
const FORCE_MARGIN: Duration = Duration::from_millis(1);

/// Cumulative time since the last inbound activity on one record.
#[derive(Debug)]
pub struct Inactivity {
    elapsed: Mutex<Duration>,
    threshold: Duration,
}

impl Inactivity {
    pub fn new(threshold: Duration) -> Self {
        Self {
            elapsed: Mutex::new(Duration::ZERO),
            threshold,
        }
    }

    /// Record inbound activity.
    pub fn reset(&self) {
        *lock(&self.elapsed) = Duration::ZERO;
    }

    /// Push the counter past the threshold so the next tick tears down.
    pub fn force_expire(&self) {
        *lock(&self.elapsed) = self.threshold + FORCE_MARGIN;
    }

    /// Add one period; `true` once the counter exceeds the threshold.
    pub fn tick(&self, period: Duration) -> bool {
        let mut elapsed = lock(&self.elapsed);
        *elapsed = elapsed.saturating_add(period);
        *elapsed > self.threshold
    }

    pub fn elapsed(&self) -> Duration {
        *lock(&self.elapsed)
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() > self.threshold
    }
}

/// Spawn the checker for one record.
///
/// `on_expire` runs exactly once, on the checker task, after which the task
/// ends. It must not block.
pub(crate) fn spawn_checker<F>(
    label: String,
    clock: Arc<Inactivity>,
    period: Duration,
    on_expire: F,
) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if clock.tick(period) {
                log::info!(
                    "[liveness] {label} inactive for {:?}; tearing down",
                    clock.elapsed()
                );
                on_expire();
                return;
            }
            log::trace!("[liveness] {label} inactive for {:?}", clock.elapsed());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PERIOD: Duration = Duration::from_millis(10);

    #[test]
    fn ticks_accumulate_until_threshold() {
        let clock = Inactivity::new(PERIOD * 3);
        assert!(!clock.tick(PERIOD));
        assert!(!clock.tick(PERIOD));
        assert!(!clock.tick(PERIOD)); // exactly at threshold is still alive
        assert!(clock.tick(PERIOD));
    }

    #[test]
    fn reset_clears_counter() {
        let clock = Inactivity::new(PERIOD * 2);
        clock.tick(PERIOD);
        clock.tick(PERIOD);
        clock.reset();
        assert_eq!(clock.elapsed(), Duration::ZERO);
        assert!(!clock.tick(PERIOD));
    }

    #[test]
    fn force_expire_overshoots_threshold() {
        let clock = Inactivity::new(PERIOD * 5);
        clock.force_expire();
        assert!(clock.is_expired());
        assert!(clock.tick(PERIOD));
    }

    #[tokio::test]
    async fn checker_fires_once_after_silence() {
        let clock = Arc::new(Inactivity::new(PERIOD * 2));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let handle = spawn_checker("test".into(), Arc::clone(&clock), PERIOD, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("checker never expired")
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn checker_stays_alive_while_reset() {
        let clock = Arc::new(Inactivity::new(PERIOD * 10));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let handle = spawn_checker("test".into(), Arc::clone(&clock), PERIOD, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..20 {
            clock.reset();
            tokio::time::sleep(PERIOD / 2).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        clock.force_expire();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("forced expiry ignored")
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use tokio::sync::Notify;

/// Fixed-interval trigger with `max_instances = 1`, coalesced misfires, and a
/// misfire grace period (§4.14). Missed ticks while a cycle is still running
/// are collapsed into at most one follow-up run, never queued.
pub struct Scheduler {
    interval: Duration,
    misfire_grace: Duration,
    running: AtomicBool,
    stopped: AtomicBool,
    last_run_time_ms: AtomicI64,
    next_run_time_ms: AtomicI64,
    notify: Notify,
}

impl Scheduler {
    pub fn new(interval: Duration, misfire_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            interval,
            misfire_grace,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            last_run_time_ms: AtomicI64::new(0),
            next_run_time_ms: AtomicI64::new(0),
            notify: Notify::new(),
        })
    }

    pub fn last_run_time(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_run_time_ms.load(Ordering::SeqCst);
        if ms == 0 {
            None
        } else {
            DateTime::from_timestamp_millis(ms)
        }
    }

    pub fn next_run_time(&self) -> Option<DateTime<Utc>> {
        let ms = self.next_run_time_ms.load(Ordering::SeqCst);
        if ms == 0 {
            None
        } else {
            DateTime::from_timestamp_millis(ms)
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Drives `on_tick` at a fixed interval. Ticks that fire while a previous
    /// call to `on_tick` is still running are coalesced: `tokio::time::interval`
    /// with `MissedTickBehavior::Delay` only ever queues one pending wakeup.
    /// A coalesced tick that fires more than `misfire_grace` after its
    /// nominal time is dropped rather than run late (§4.14).
    pub async fn run<F, Fut>(self: &Arc<Self>, mut on_tick: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut expected_fire = tokio::time::Instant::now() + self.interval;

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {
                    if self.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    continue;
                }
            }

            let late_by = tokio::time::Instant::now().saturating_duration_since(expected_fire);
            if late_by > self.misfire_grace {
                warn!("scheduler tick dropped: fired {late_by:?} late, beyond misfire grace {:?}", self.misfire_grace);
                expected_fire = tokio::time::Instant::now() + self.interval;
                continue;
            }
            expected_fire += self.interval;

            if self.running.swap(true, Ordering::SeqCst) {
                warn!("scheduler tick skipped: previous cycle still running");
                continue;
            }

            let now = Utc::now();
            self.next_run_time_ms.store((now + self.interval).timestamp_millis(), Ordering::SeqCst);

            on_tick().await;

            self.last_run_time_ms.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
        }
    }

    pub fn misfire_grace(&self) -> Duration {
        self.misfire_grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn runs_ticks_at_fixed_interval() {
        let scheduler = Scheduler::new(Duration::from_millis(50), Duration::from_secs(1));
        let count = Arc::new(AtomicU32::new(0));

        let scheduler_clone = scheduler.clone();
        let count_clone = count.clone();
        let handle = tokio::spawn(async move {
            scheduler_clone
                .run(|| {
                    let count = count_clone.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await;
        });

        tokio::time::advance(Duration::from_millis(170)).await;
        tokio::task::yield_now().await;
        scheduler.stop();
        let _ = tokio::time::timeout(Duration::from_millis(100), handle).await;

        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn stop_is_idempotent() {
        let scheduler = Scheduler::new(Duration::from_secs(1), Duration::from_secs(1));
        scheduler.stop();
        scheduler.stop();
        assert!(scheduler.stopped.load(Ordering::SeqCst));
    }
}

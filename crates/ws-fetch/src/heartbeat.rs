//! Single-deadline timers and the heartbeat schedule built on them.

use std::future;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};

/// A re-armable one-shot deadline.
#[derive(Debug, Default)]
pub(crate) struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    /// (Re)arm the timer to fire `after` from now, replacing any prior deadline.
    ///
    /// A delay too large to represent as an instant never fires.
    pub fn arm(&mut self, after: Duration) {
        self.deadline = Instant::now().checked_add(after);
    }

    pub const fn disarm(&mut self) {
        self.deadline = None;
    }

    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Resolve when `deadline` passes; never resolve for `None`.
pub(crate) async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Liveness probe schedule.
///
/// A zero interval disables probing.
#[derive(Debug)]
pub(crate) struct Heartbeat {
    interval: Duration,
    timer: Timer,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            timer: Timer::default(),
        }
    }

    pub fn start(&mut self) {
        if self.interval.is_zero() {
            return;
        }
        self.timer.arm(self.interval);
    }

    pub const fn stop(&mut self) {
        self.timer.disarm();
    }

    pub const fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Called when the deadline passes. Returns whether a probe should be
    /// sent; the schedule continues only while the socket is open.
    pub fn on_due(&mut self, open: bool) -> bool {
        if open {
            self.start();
        } else {
            self.stop();
        }
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_at_deadline() {
        let mut timer = Timer::default();
        timer.arm(Duration::from_millis(100));
        let start = Instant::now();

        expired(timer.deadline()).await;
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_timer_never_fires() {
        let mut timer = Timer::default();
        timer.arm(Duration::from_millis(10));
        timer.disarm();

        let fired = tokio::time::timeout(Duration::from_secs(60), expired(timer.deadline())).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_delay_never_fires() {
        let mut timer = Timer::default();
        timer.arm(Duration::from_millis(10));
        timer.arm(Duration::MAX);
        assert!(timer.deadline().is_none());

        let mut heartbeat = Heartbeat::new(Duration::MAX);
        heartbeat.start();
        assert!(heartbeat.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_rearms_while_open() {
        let mut heartbeat = Heartbeat::new(Duration::from_millis(50));
        heartbeat.start();
        let first = heartbeat.deadline().unwrap();

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(heartbeat.on_due(true));
        assert_eq!(heartbeat.deadline().unwrap() - first, Duration::from_millis(50));

        assert!(!heartbeat.on_due(false));
        assert!(heartbeat.deadline().is_none());
    }

    #[test]
    fn test_zero_interval_disables() {
        let mut heartbeat = Heartbeat::new(Duration::ZERO);
        heartbeat.start();
        assert!(heartbeat.deadline().is_none());
    }
}

use std::time::Duration;

/// Backoff schedule applied after abnormal closures.
///
/// Delays grow linearly from `start` by `step` per attempt, without a cap,
/// until a connection opens and [`ReconnectPolicy::reset`] is called.
#[derive(Clone, Debug)]
pub(crate) struct ReconnectPolicy {
    start: Duration,
    step: Duration,
    current: Duration,
}

impl ReconnectPolicy {
    pub const fn new(start: Duration, step: Duration) -> Self {
        Self {
            start,
            step,
            current: start,
        }
    }

    /// Automatic reconnection is off when both `start` and `step` are zero.
    pub fn is_enabled(&self) -> bool {
        !self.start.saturating_add(self.step).is_zero()
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_add(self.step);
        delay
    }

    pub const fn reset(&mut self) {
        self.current = self.start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_linear_backoff() {
        let mut policy = ReconnectPolicy::new(Duration::ZERO, Duration::from_millis(150));
        assert!(policy.is_enabled());

        let delays: Vec<_> = (0..4).map(|_| policy.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::ZERO,
                Duration::from_millis(150),
                Duration::from_millis(300),
                Duration::from_millis(450),
            ]
        );
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut policy = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(2));
        policy.next_delay();
        policy.next_delay();
        policy.reset();
        assert_eq!(policy.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_schedule_disables() {
        let policy = ReconnectPolicy::new(Duration::ZERO, Duration::ZERO);
        assert!(!policy.is_enabled());
    }

    #[test]
    fn test_constant_delay_without_step() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(500), Duration::ZERO);
        assert!(policy.is_enabled());
        assert_eq!(policy.next_delay(), Duration::from_millis(500));
        assert_eq!(policy.next_delay(), Duration::from_millis(500));
    }
}

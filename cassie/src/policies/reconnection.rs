//! Delays between consecutive reconnection attempts.

use std::fmt::Debug;
use std::time::Duration;

/// Produces a fresh [`ReconnectionSchedule`] whenever a series of
/// reconnection attempts starts.
pub trait ReconnectionPolicy: Send + Sync + Debug {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule>;
}

/// A sequence of delays. A schedule is discarded after a successful attempt.
pub trait ReconnectionSchedule: Send + Sync {
    fn next_delay(&mut self) -> Duration;
}

/// Waits the same amount of time before every attempt.
#[derive(Debug, Clone)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ConstantSchedule { delay: self.delay })
    }
}

struct ConstantSchedule {
    delay: Duration,
}

impl ReconnectionSchedule for ConstantSchedule {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }
}

/// Doubles the delay after every attempt, up to `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialReconnectionPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(600))
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ExponentialSchedule {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            attempts: 0,
        })
    }
}

struct ExponentialSchedule {
    base_delay: Duration,
    max_delay: Duration,
    attempts: u32,
}

impl ReconnectionSchedule for ExponentialSchedule {
    fn next_delay(&mut self) -> Duration {
        // Shifting further would overflow the factor.
        let factor = 1u32.checked_shl(self.attempts.min(31)).unwrap_or(u32::MAX);
        self.attempts = self.attempts.saturating_add(1);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_schedule_doubles_up_to_the_cap() {
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
        let mut schedule = policy.new_schedule();
        let delays: Vec<_> = (0..6).map(|_| schedule.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );

        // A new schedule starts over.
        assert_eq!(policy.new_schedule().next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn exponential_schedule_survives_many_attempts() {
        let mut schedule = ExponentialReconnectionPolicy::default().new_schedule();
        for _ in 0..200 {
            assert!(schedule.next_delay() <= Duration::from_secs(600));
        }
    }

    #[test]
    fn constant_schedule() {
        let mut schedule = ConstantReconnectionPolicy::new(Duration::from_secs(2)).new_schedule();
        assert_eq!(schedule.next_delay(), Duration::from_secs(2));
        assert_eq!(schedule.next_delay(), Duration::from_secs(2));
    }
}

//! Exponential reconnect backoff.

use std::time::Duration;

use workspace_agent_core::AgentSettings;

/// Reconnect delay schedule: `min(max, min * multiplier^attempts)`.
///
/// `attempts` counts failures since the last successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    multiplier: f64,
    attempts: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(min: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            min,
            max: max.max(min),
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
            attempts: 0,
        }
    }

    #[must_use]
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.reconnect_min_delay_ms),
            Duration::from_millis(settings.reconnect_max_delay_ms),
            settings.reconnect_multiplier,
        )
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay after `attempts` consecutive failures.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = self.multiplier.powi(i32::try_from(attempts).unwrap_or(i32::MAX));
        let secs = self.min.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay to wait now; counts one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Forget past failures after a successful connect.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_backoff() -> Backoff {
        Backoff::from_settings(&AgentSettings::default())
    }

    #[test]
    fn test_sequence_grows_by_multiplier() {
        let mut backoff = default_backoff();
        let delays: Vec<u128> = (0..4).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, [1000, 1500, 2250, 3375]);
        assert_eq!(backoff.attempts(), 4);
    }

    #[test]
    fn test_delay_is_capped() {
        let backoff = default_backoff();
        assert_eq!(backoff.delay_for(9).as_millis(), 30_000);
        assert_eq!(backoff.delay_for(50), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = default_backoff();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_degenerate_multiplier_is_constant() {
        let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(1), 0.5);
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    }
}

//! Exponential reconnect backoff with jitter

use std::time::Duration;

use crate::config::BackoffConfig;

/// Delay policy between a disconnect and the next connection attempt
///
/// `delay(n) = min(initial * multiplier^(n-1), max) * (1 ± jitter)`
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let exponent = i32::try_from(self.attempt - 1).unwrap_or(i32::MAX);
        let base = (self.config.initial_ms as f64 * self.config.multiplier.powi(exponent))
            .min(self.config.max_ms as f64);

        let spread = self.config.jitter * (fastrand::f64() * 2.0 - 1.0);
        let millis = (base * (1.0 + spread)).max(0.0);
        Duration::from_millis(millis.round() as u64)
    }

    /// Back to the initial delay
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Largest delay this policy can produce
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis((self.config.max_ms as f64 * (1.0 + self.config.jitter)).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            initial_ms: 1_000,
            max_ms: 8_000,
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_exponential_growth_capped() {
        let mut backoff = Backoff::new(config(0.0));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 8_000, 8_000]);
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = Backoff::new(config(0.0));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut backoff = Backoff::new(config(0.2));
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay().as_millis() as u64;
            assert!((800..=1_200).contains(&delay), "delay {} out of band", delay);
        }
        assert_eq!(backoff.max_delay(), Duration::from_millis(9_600));
    }

    #[test]
    fn test_many_attempts_do_not_overflow() {
        let mut backoff = Backoff::new(config(0.0));
        for _ in 0..10_000 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_millis(8_000));
    }
}

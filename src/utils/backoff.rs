//! Exponential backoff for reconnects and discovery retries.

use std::cmp::min;
use std::time::Duration;

use rand::Rng;

pub struct ExponentialBackoff {
    attempt: u32,
    delay: Duration,

    config_initial_delay: Duration,
    config_max_delay: Duration,
    config_factor_eighths: u32,
    config_max_attempts: Option<u32>,
    config_jitter: bool,
}

impl ExponentialBackoff {
    /// `max_attempts` of `None` retries forever.
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
        let result = ExponentialBackoff {
            attempt: 0,
            delay: initial_delay,
            config_initial_delay: initial_delay,
            config_max_delay: max_delay,
            config_factor_eighths: 8 * 2,
            config_max_attempts: max_attempts,
            config_jitter: false,
        };

        assert!(result.config_factor_eighths >= 8);

        result
    }

    /// Add up to 25% random delay so many clients do not retry in lockstep.
    pub fn with_jitter(mut self) -> Self {
        self.config_jitter = true;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.delay = self.config_initial_delay;
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config_max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        self.attempt += 1;

        let current = self.delay;
        self.delay = min(
            current * self.config_factor_eighths / 8,
            self.config_max_delay,
        );

        if self.config_jitter && !current.is_zero() {
            let extra_ms = rand::rng().random_range(0..=current.as_millis() as u64 / 4);
            Some(current + Duration::from_millis(extra_ms))
        } else {
            Some(current)
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[rstest]
    #[case::initial(0, 100, 100, 10_000, 16, None, Some(100), 200)]
    #[case::doubling(3, 800, 100, 10_000, 16, None, Some(800), 1600)]
    #[case::capped(5, 8000, 100, 10_000, 16, None, Some(8000), 10_000)]
    #[case::at_max(9, 10_000, 100, 10_000, 16, None, Some(10_000), 10_000)]
    #[case::factor_1_5(1, 200, 100, 10_000, 12, None, Some(200), 300)]
    #[case::exhausted(3, 800, 100, 10_000, 16, Some(3), None, 800)]
    #[case::last_allowed(2, 400, 100, 10_000, 16, Some(3), Some(400), 800)]
    fn test_next_delay(
        #[case] attempt: u32,
        #[case] delay_ms: u64,
        #[case] initial_ms: u64,
        #[case] max_ms: u64,
        #[case] factor: u32,
        #[case] max_attempts: Option<u32>,
        #[case] expected: Option<u64>,
        #[case] expected_next_ms: u64,
    ) {
        let mut eb = ExponentialBackoff {
            attempt,
            delay: ms(delay_ms),
            config_initial_delay: ms(initial_ms),
            config_max_delay: ms(max_ms),
            config_factor_eighths: factor,
            config_max_attempts: max_attempts,
            config_jitter: false,
        };

        assert_eq!(eb.next_delay(), expected.map(ms));
        assert_eq!(eb.delay, ms(expected_next_ms));
    }

    #[test]
    fn test_reset_and_jitter_bounds() {
        let mut eb = ExponentialBackoff::new(ms(100), ms(1000), Some(5)).with_jitter();
        let first = eb.next_delay().unwrap_or_default();
        assert!(first >= ms(100) && first <= ms(125));
        let _ = eb.next_delay();
        assert_eq!(eb.attempts(), 2);
        eb.reset();
        assert_eq!(eb.attempts(), 0);
        assert_eq!(eb.delay, ms(100));
    }
}

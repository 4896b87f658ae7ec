use std::time::Duration;

/// Delay before the `attempt`-th retry: `min(initial * 2^(attempt-1), max)`.
///
/// `attempt` is 1-based; 0 is treated as 1. Saturates instead of
/// overflowing for large attempt counts.
///
/// # Examples
///
/// ```
/// use agwc::backoff::backoff_delay;
/// use std::time::Duration;
/// let initial = Duration::from_millis(1000);
/// let max = Duration::from_millis(30_000);
/// assert_eq!(backoff_delay(1, initial, max), initial);
/// assert_eq!(backoff_delay(6, initial, max), max);
/// ```
#[must_use]
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}

/// Stateful exponential backoff: the n-th call to [`next_delay`] after a
/// reset yields `backoff_delay(n, initial, max)`.
///
/// [`next_delay`]: ExponentialBackoff::next_delay
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Creates a new `ExponentialBackoff` with the given bounds.
    #[must_use]
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Compute the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        backoff_delay(self.attempt, self.initial, self.max)
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset the backoff to its initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_millis(1000);
    const MAX: Duration = Duration::from_millis(30_000);

    #[test]
    fn test_first_attempt_is_initial_delay() {
        assert_eq!(backoff_delay(1, SEC, MAX), SEC);
    }

    #[test]
    fn test_delay_doubles_until_capped() {
        let delays: Vec<u128> = (1..=7)
            .map(|n| backoff_delay(n, SEC, MAX).as_millis())
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn test_matches_closed_form_for_all_small_attempts() {
        for n in 1..=40u32 {
            let expected = SEC
                .as_millis()
                .saturating_mul(1u128 << (n - 1))
                .min(MAX.as_millis());
            assert_eq!(backoff_delay(n, SEC, MAX).as_millis(), expected, "attempt {n}");
        }
    }

    #[test]
    fn test_attempt_zero_is_treated_as_one() {
        assert_eq!(backoff_delay(0, SEC, MAX), SEC);
    }

    #[test]
    fn test_overflow_safety_with_huge_attempt() {
        let max = Duration::from_secs(u64::MAX);
        assert_eq!(backoff_delay(u32::MAX, SEC, MAX), MAX);
        assert!(backoff_delay(u32::MAX, SEC, max) > Duration::ZERO);
    }

    #[test]
    fn test_stateful_backoff_follows_formula_and_resets() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let delays: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.attempt(), 6);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}

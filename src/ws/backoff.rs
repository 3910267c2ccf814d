//! Reconnection delay policies.

use std::time::Duration;

use rand::Rng;

use super::config::Config;

/// Share of the exponential delay that may be added as random jitter.
const JITTER_RATIO: f64 = 0.3;

/// Maps a reconnection attempt number (starting at 1) to the delay before that attempt.
pub trait BackoffPolicy: Send + Sync + 'static {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with additive jitter of up to 30% of the exponential value.
///
/// `delay(n) = min(base * 2^(n-1) + jitter, max)` where `jitter` is drawn uniformly from
/// `[0, 0.3 * min(base * 2^(n-1), max)]`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl ExponentialBackoff {
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// The delay without jitter. Non-decreasing in `attempt` and never above `max`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 2_u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Compute the delay for `attempt` drawing jitter from `rng`.
    ///
    /// Deterministic for a seeded `rng`.
    pub fn compute_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponential = self.base_delay(attempt);
        let jitter = exponential.mul_f64(rng.random_range(0.0..=JITTER_RATIO));
        exponential.saturating_add(jitter).min(self.max)
    }
}

impl From<&Config> for ExponentialBackoff {
    fn from(config: &Config) -> Self {
        Self::new(config.reconnect_base_delay, config.reconnect_max_delay)
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.compute_delay(attempt, &mut rand::rng())
    }
}

/// Always waits the same amount of time. Useful for deterministic tests.
#[expect(
    clippy::exhaustive_structs,
    reason = "Single-field policy, constructed directly by callers"
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff(pub Duration);

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Waits `step * attempt`. Useful for deterministic tests that need growing delays.
#[expect(
    clippy::exhaustive_structs,
    reason = "Single-field policy, constructed directly by callers"
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff(pub Duration);

impl BackoffPolicy for LinearBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.0.saturating_mul(attempt.max(1))
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn base_delay_doubles_until_cap() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30));

        let delays: Vec<_> = (1..=7).map(|n| backoff.base_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn attempt_zero_is_first_attempt() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(30));

        assert_eq!(backoff.base_delay(0), Duration::from_millis(100));
    }

    #[test]
    fn huge_attempts_do_not_overflow() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut rng = StdRng::seed_from_u64(7);

        assert_eq!(backoff.base_delay(u32::MAX), Duration::from_secs(30));
        assert!(backoff.compute_delay(u32::MAX, &mut rng) <= Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_thirty_percent_and_cap() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut rng = StdRng::seed_from_u64(42);

        for attempt in 1..=10 {
            let base = backoff.base_delay(attempt);
            for _ in 0..100 {
                let delay = backoff.compute_delay(attempt, &mut rng);
                assert!(delay >= base, "attempt {attempt}: {delay:?} < {base:?}");
                assert!(
                    delay.as_secs_f64() <= base.as_secs_f64() * (1.0 + JITTER_RATIO) + 1e-6,
                    "attempt {attempt}: {delay:?} has too much jitter"
                );
                assert!(delay <= Duration::from_secs(30), "cap exceeded: {delay:?}");
            }
        }
    }

    #[test]
    fn seeded_rng_is_deterministic() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(250), Duration::from_secs(30));

        let first: Vec<_> = {
            let mut rng = StdRng::seed_from_u64(9);
            (1..=5).map(|n| backoff.compute_delay(n, &mut rng)).collect()
        };
        let second: Vec<_> = {
            let mut rng = StdRng::seed_from_u64(9);
            (1..=5).map(|n| backoff.compute_delay(n, &mut rng)).collect()
        };

        assert_eq!(first, second);
    }

    #[test]
    fn test_doubles() {
        assert_eq!(
            FixedBackoff(Duration::from_millis(100)).delay(4),
            Duration::from_millis(100)
        );
        assert_eq!(
            LinearBackoff(Duration::from_millis(100)).delay(3),
            Duration::from_millis(300)
        );
    }
}

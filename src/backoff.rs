//! Reconnect policy for the status channel.
//!
//! Bounded exponential backoff: the n-th consecutive failed attempt waits
//! `initial * factor^(n-1)`, capped at `max`, minus a random jitter of up to
//! `jitter_ratio` of that delay. Jitter is subtracted, so no delay exceeds
//! `max`.

use std::time::Duration;

use rand::Rng;

const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_FACTOR: u32 = 2;
const DEFAULT_JITTER_RATIO: f64 = 0.2;

/// Parameters of the reconnect backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry. Defaults to **1 second**.
    pub initial_delay: Duration,
    /// Upper bound of any delay. Defaults to **30 seconds**.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays. Defaults to **2**.
    pub factor: u32,
    /// Fraction of each delay that may be shaved off at random, clamped to
    /// `0.0..=1.0`; a non-finite value means no jitter. Defaults to **0.2**.
    pub jitter_ratio: f64,
    /// Consecutive failed attempts after which reconnecting stops.
    /// `None` (the default) retries until the session is closed.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            factor: DEFAULT_FACTOR,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Values below 1 are clamped to 1 (constant delay).
    #[must_use]
    pub fn with_factor(mut self, factor: u32) -> Self {
        self.factor = factor.max(1);
        self
    }

    /// Clamped to `0.0..=1.0`; NaN and infinities disable jitter.
    #[must_use]
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = sanitize_ratio(ratio);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay for the given 1-based attempt, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.factor.max(1).checked_pow(exponent).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

fn sanitize_ratio(ratio: f64) -> f64 {
    if ratio.is_finite() {
        ratio.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Attempt counter driving a [`BackoffPolicy`].
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Register a failed attempt and return how long to wait before the next
    /// one, or `None` once `max_attempts` failures have been registered.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self
            .policy
            .max_attempts
            .is_some_and(|max| self.attempt >= max)
        {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);

        let base = self.policy.base_delay(self.attempt);
        let ratio = sanitize_ratio(self.policy.jitter_ratio);
        let jitter_range = Duration::try_from_secs_f64(base.as_secs_f64() * ratio)
            .map_or(base, |range| range.min(base));
        if jitter_range.is_zero() {
            return Some(base);
        }
        let jitter = rand::rng().random_range(Duration::ZERO..=jitter_range);
        Some(base.saturating_sub(jitter))
    }

    /// Forget past failures, typically after a successful handshake.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of failed attempts registered since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000))
            .with_jitter_ratio(0.0)
    }

    #[test]
    fn delays_grow_exponentially_up_to_max() {
        let mut backoff = Backoff::new(no_jitter());
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = no_jitter();
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = no_jitter().with_jitter_ratio(0.5);
        let mut backoff = Backoff::new(policy.clone());
        for attempt in 1..=20 {
            let delay = backoff.next_delay().unwrap();
            let base = policy.base_delay(attempt);
            assert!(delay <= base, "attempt {attempt}: {delay:?} > {base:?}");
            assert!(delay >= base / 2, "attempt {attempt}: {delay:?} < {base:?}/2");
        }
    }

    #[test]
    fn max_attempts_exhausts() {
        let mut backoff = Backoff::new(no_jitter().with_max_attempts(2));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempt(), 2);
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut backoff = Backoff::new(no_jitter());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn factor_is_clamped() {
        let policy = no_jitter().with_factor(0);
        assert_eq!(policy.factor, 1);
        assert_eq!(policy.base_delay(5), Duration::from_millis(100));
    }

    #[test]
    fn non_finite_jitter_ratio_disables_jitter() {
        for ratio in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let policy = no_jitter().with_jitter_ratio(ratio);
            assert_eq!(policy.jitter_ratio, 0.0);
            let mut backoff = Backoff::new(policy);
            assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        }

        // The public field bypasses the setter.
        let mut policy = no_jitter();
        policy.jitter_ratio = f64::NAN;
        let mut backoff = Backoff::new(policy);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn full_jitter_on_huge_delays_does_not_overflow() {
        let policy = BackoffPolicy::default()
            .with_initial_delay(Duration::MAX)
            .with_max_delay(Duration::MAX)
            .with_jitter_ratio(1.0);
        let delay = Backoff::new(policy).next_delay().unwrap();
        assert!(delay <= Duration::MAX);
    }
}

use rand::Rng;
use std::time::Duration;
use tracing::warn;

/// Default number of crash-triggered relaunches.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;
/// Default backoff base unit in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 10;

/// Decision returned by the retry policy after a launch terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Not a crash: the result is final.
    Finish,
    /// Crash within budget: relaunch after `delay` (includes 1-based attempt number).
    Retry { attempt: u32, delay: Duration },
    /// Crash with the budget used up: the crash is final.
    Exhausted,
}

/// Retry policy for crashed launches.
///
/// Counts crash-triggered relaunches against a fixed limit and computes the
/// jittered backoff before each one. The counter is never reset: one policy
/// covers the whole lifetime of a supervisor.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    limit: u32,
    base_delay_ms: u64,
    attempts: u32,
}

impl RetryPolicy {
    pub fn new(limit: u32, base_delay_ms: u64) -> Self {
        Self {
            limit,
            base_delay_ms,
            attempts: 0,
        }
    }

    /// Replace the limit and base delay, keeping the attempt counter.
    pub fn reconfigure(&mut self, limit: u32, base_delay_ms: u64) {
        self.limit = limit;
        self.base_delay_ms = base_delay_ms;
    }

    /// Decide what to do after a launch terminated.
    ///
    /// Non-crashes always finish. A crash increments the attempt counter
    /// before the delay is computed, so the first relaunch backs off by
    /// roughly one base unit, the second by two, and so on.
    pub fn evaluate(&mut self, crashed: bool) -> RetryDecision {
        if !crashed {
            return RetryDecision::Finish;
        }

        if self.attempts >= self.limit {
            warn!(
                attempts = self.attempts,
                limit = self.limit,
                "crash retries exhausted, giving up"
            );
            return RetryDecision::Exhausted;
        }

        self.attempts += 1;
        let delay = self.jitter();
        warn!(
            attempt = self.attempts,
            limit = self.limit,
            delay_ms = delay.as_millis() as u64,
            "process crashed, relaunching"
        );
        RetryDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    /// Backoff before the next relaunch, derived from the current attempt count.
    pub fn jitter(&self) -> Duration {
        Duration::from_millis(jitter_ms(self.base_delay_ms, self.attempts))
    }

    /// Relaunches performed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_LIMIT, DEFAULT_RETRY_DELAY_MS)
    }
}

/// Linear backoff with a 50% jitter band.
///
/// With `v = base_delay_ms * attempts`, returns a value drawn uniformly from
/// `[v/2, v/2 + v)`. Returns 0 when `base_delay_ms` is 0 or no attempt has
/// been made yet.
pub fn jitter_ms(base_delay_ms: u64, attempts: u32) -> u64 {
    let v = base_delay_ms.saturating_mul(u64::from(attempts));
    if v == 0 {
        return 0;
    }
    let mut rng = rand::rng();
    (v / 2).saturating_add(rng.random_range(0..v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.limit(), 3);
        assert_eq!(policy.base_delay_ms(), 10);
        assert_eq!(policy.attempts(), 0);
    }

    #[test]
    fn test_reconfigure_keeps_attempts() {
        let mut policy = RetryPolicy::new(2, 0);
        policy.evaluate(true);
        policy.reconfigure(10, 200);
        assert_eq!(policy.limit(), 10);
        assert_eq!(policy.base_delay_ms(), 200);
        assert_eq!(policy.attempts(), 1);
    }

    #[test]
    fn test_non_crash_finishes_without_counting() {
        let mut policy = RetryPolicy::new(2, 0);
        assert_eq!(policy.evaluate(false), RetryDecision::Finish);
        assert_eq!(policy.attempts(), 0);
    }

    #[test]
    fn test_crash_retries_until_exhausted() {
        let mut policy = RetryPolicy::new(2, 0);
        assert_eq!(
            policy.evaluate(true),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::ZERO
            }
        );
        assert_eq!(
            policy.evaluate(true),
            RetryDecision::Retry {
                attempt: 2,
                delay: Duration::ZERO
            }
        );
        assert_eq!(policy.evaluate(true), RetryDecision::Exhausted);
        // Exhaustion does not push the counter past the limit.
        assert_eq!(policy.attempts(), 2);
    }

    #[test]
    fn test_zero_limit_is_exhausted_immediately() {
        let mut policy = RetryPolicy::new(0, 10);
        assert_eq!(policy.evaluate(true), RetryDecision::Exhausted);
        assert_eq!(policy.attempts(), 0);
    }

    #[test]
    fn test_jitter_zero_base_is_always_zero() {
        for attempts in 0..50 {
            assert_eq!(jitter_ms(0, attempts), 0);
        }
    }

    #[test]
    fn test_jitter_zero_attempts_is_zero() {
        assert_eq!(jitter_ms(100, 0), 0);
        assert_eq!(RetryPolicy::new(3, 100).jitter(), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        for (base, attempts) in [(1u64, 1u32), (10, 1), (10, 3), (200, 7), (3, 5)] {
            let v = base * u64::from(attempts);
            for _ in 0..500 {
                let d = jitter_ms(base, attempts);
                assert!(d >= v / 2, "{d} below band for base={base} attempts={attempts}");
                assert!(d < v / 2 + v, "{d} above band for base={base} attempts={attempts}");
            }
        }
    }

    #[test]
    fn test_retry_delay_uses_incremented_attempt() {
        let mut policy = RetryPolicy::new(5, 100);
        let RetryDecision::Retry { attempt, delay } = policy.evaluate(true) else {
            panic!("expected retry");
        };
        assert_eq!(attempt, 1);
        let ms = delay.as_millis() as u64;
        assert!((50..150).contains(&ms));

        let RetryDecision::Retry { attempt, delay } = policy.evaluate(true) else {
            panic!("expected retry");
        };
        assert_eq!(attempt, 2);
        let ms = delay.as_millis() as u64;
        assert!((100..300).contains(&ms));
    }

    #[test]
    fn test_jitter_saturates_instead_of_overflowing() {
        let d = jitter_ms(u64::MAX, 2);
        assert!(d >= u64::MAX / 2);
    }
}

//! Retry policy and request accounting for the kintone client.
//!
//! The policy is applied by one explicit loop in `client::send_with_retry`;
//! counters live in a caller-owned [`RequestStats`] injected at client
//! construction, so orchestrated runs never share global mutable state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::RetrySettings;

// ============================================================================
// RetryPolicy
// ============================================================================

/// Exponential backoff with a cap and symmetric ±20% jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetrySettings::default())
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `attempt` (1-based):
    /// `base · 2^(attempt−1)`, capped at `max_delay`. Pure, for testability;
    /// jitter is layered on by [`RetryPolicy::jittered`].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.max_delay)
    }

    /// Apply symmetric random jitter (±20%) to a computed delay.
    pub fn jittered(&self, base: Duration) -> Duration {
        let factor = rand::thread_rng().gen_range(0.8..=1.2);
        base.mul_f64(factor)
    }
}

// ============================================================================
// RequestStats
// ============================================================================

/// Caller-owned request/retry counters, shared with the client via `Arc`.
/// Cheap to clone; `reset` zeroes both between logical operations.
#[derive(Debug, Clone, Default)]
pub struct RequestStats(Arc<StatsInner>);

#[derive(Debug, Default)]
struct StatsInner {
    api_requests: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time copy of the counters, recorded on the run row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub api_requests: u64,
    pub retries: u64,
}

impl RequestStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// One logical call issued (one page fetch, one batch chunk, one read).
    pub fn record_request(&self) {
        self.0.api_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// One retry attempt; independent of the request counter.
    pub fn record_retry(&self) {
        self.0.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            api_requests: self.0.api_requests.load(Ordering::Relaxed),
            retries: self.0.retries.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.0.api_requests.store(0, Ordering::Relaxed);
        self.0.retries.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(30_000),
        }
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(3), Duration::from_millis(2_000));
        assert_eq!(p.delay_for(7), Duration::from_millis(30_000));
        assert_eq!(p.delay_for(100), Duration::from_millis(30_000));
    }

    #[test]
    fn test_backoff_non_decreasing() {
        let p = policy();
        let mut prev = Duration::ZERO;
        for attempt in 1..=32 {
            let d = p.delay_for(attempt);
            assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            assert!(d <= p.max_delay);
            prev = d;
        }
    }

    #[test]
    fn test_stats_count_and_reset() {
        let stats = RequestStats::new();
        let shared = stats.clone();

        shared.record_request();
        shared.record_request();
        shared.record_retry();

        let snap = stats.snapshot();
        assert_eq!(snap.api_requests, 2);
        assert_eq!(snap.retries, 1);

        stats.reset();
        let snap = shared.snapshot();
        assert_eq!(snap.api_requests, 0);
        assert_eq!(snap.retries, 0);
    }

    proptest! {
        /// Jittered delay always lies within ±20% of the computed base.
        #[test]
        fn prop_jitter_within_bounds(base_ms in 1u64..60_000, attempt in 1u32..12) {
            let p = RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(600_000),
            };
            let base = p.delay_for(attempt);
            let jittered = p.jittered(base);
            prop_assert!(jittered >= base.mul_f64(0.8));
            prop_assert!(jittered <= base.mul_f64(1.2));
        }
    }
}

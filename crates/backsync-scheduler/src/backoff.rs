//! Retry backoff policy and the empty-scan backoff cache.

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Computes how long a failed resource waits before becoming retry-eligible.
///
/// The delay doubles per failed attempt, capped at `max_delay_us`, with a
/// bounded random jitter so that a burst of same-cycle failures does not
/// become retry-eligible in lockstep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failure (microseconds). Default is 60 seconds.
    pub base_delay_us: u64,
    /// Upper bound on the delay (microseconds). Default is 8 hours.
    pub max_delay_us: u64,
    /// Maximum random jitter added on top (microseconds). Default is
    /// 30 seconds. Zero disables jitter.
    pub jitter_us: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_us: 60 * 1_000_000,
            max_delay_us: 8 * 3600 * 1_000_000,
            jitter_us: 30 * 1_000_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next retry, given the number of failures so far.
    /// `retry_count` of 0 or 1 both yield the base delay.
    pub fn delay_us(&self, retry_count: u32) -> u64 {
        let mut delay = self.base_delay_us;
        for _ in 1..retry_count {
            delay = delay.saturating_mul(2);
            if delay >= self.max_delay_us {
                break;
            }
        }
        delay = delay.min(self.max_delay_us);
        if self.jitter_us > 0 {
            delay = delay.saturating_add(rand::thread_rng().gen_range(0..=self.jitter_us));
        }
        delay
    }

    /// Absolute retry-eligibility time for the next attempt.
    pub fn retry_at_us(&self, retry_count: u32, now_us: u64) -> u64 {
        now_us.saturating_add(self.delay_us(retry_count))
    }
}

/// TTL flag store suppressing re-scans after an empty dispatch cycle.
///
/// A flag expires implicitly: there is no explicit clear operation. Expired
/// flags are dropped lazily on the next lookup.
pub struct BackoffCache {
    flags: DashMap<String, u64>,
}

impl BackoffCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            flags: DashMap::new(),
        }
    }

    /// Set the skip flag for `key` until `now_us + ttl_us`.
    pub fn hold(&self, key: &str, ttl_us: u64, now_us: u64) {
        debug!(key = key, ttl_us, "backoff flag set");
        self.flags
            .insert(key.to_string(), now_us.saturating_add(ttl_us));
    }

    /// Returns true if the skip flag for `key` is still within its window.
    pub fn skip(&self, key: &str, now_us: u64) -> bool {
        match self.flags.get(key).map(|expiry| *expiry) {
            Some(expiry) if now_us < expiry => true,
            Some(_) => {
                self.flags.remove(key);
                false
            }
            None => false,
        }
    }
}

impl Default for BackoffCache {
    fn default() -> Self {
        Self::new()
    }
}

//! Per-key retry delays with exponential backoff and jitter.
//!
//! The controller runtime guarantees at most one in-flight reconcile per
//! Broker key but leaves the retry schedule to the error policy. The error
//! policy asks [`KeyedBackoff`] for the next delay of a key, and a successful
//! reconcile resets that key. Only attempt counters live here; no reconcile
//! progress is carried between passes. A key that has not failed for
//! [`IDLE_FACTOR`] times the maximum delay is dropped, so Brokers deleted
//! while failing do not linger.
//!
//! # Example
//!
//! ```ignore
//! use channel_broker::backoff::{BackoffConfig, KeyedBackoff};
//!
//! let backoff = KeyedBackoff::new(BackoffConfig::default());
//! let delay = backoff.next_delay("test-namespace/test-broker", false);
//! ```

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::time::Instant;
use tracing::trace;

/// Multiple of `max_delay` after which an idle key is forgotten
pub const IDLE_FACTOR: u32 = 2;

/// Backoff schedule for failed reconciles.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Delay after the first failure that only a spec edit can fix
    pub spec_change_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in 0.5..1.5
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            spec_change_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Default schedule with a different ceiling
    pub fn with_max_delay(max_delay: Duration) -> Self {
        Self {
            max_delay,
            ..Default::default()
        }
    }

    /// Same schedule without jitter, for deterministic delays
    pub fn without_jitter() -> Self {
        Self {
            jitter: false,
            ..Default::default()
        }
    }
}

/// Failure counters keyed by `namespace/name`.
#[derive(Debug, Default)]
pub struct KeyedBackoff {
    config: BackoffConfig,
    attempts: DashMap<String, Attempts>,
}

#[derive(Debug)]
struct Attempts {
    count: u32,
    last_failure: Instant,
}

impl KeyedBackoff {
    /// Create a tracker with the given schedule
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: DashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying.
    pub fn next_delay(&self, key: &str, requires_spec_change: bool) -> Duration {
        let now = Instant::now();
        self.prune_idle(now);

        let attempt = {
            let mut entry = self.attempts.entry(key.to_string()).or_insert(Attempts {
                count: 0,
                last_failure: now,
            });
            let attempt = entry.count;
            entry.count = entry.count.saturating_add(1);
            entry.last_failure = now;
            attempt
        };

        let delay = self.delay_for(attempt, requires_spec_change);
        trace!(key, attempt, delay_ms = delay.as_millis() as u64, "computed backoff");
        delay
    }

    /// Forget the failures recorded for `key`
    pub fn reset(&self, key: &str) {
        self.attempts.remove(key);
    }

    /// Number of consecutive failures recorded for `key`
    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts.get(key).map(|a| a.count).unwrap_or(0)
    }

    /// Number of keys with recorded failures
    pub fn tracked_keys(&self) -> usize {
        self.attempts.len()
    }

    fn prune_idle(&self, now: Instant) {
        let idle = self.config.max_delay.saturating_mul(IDLE_FACTOR);
        self.attempts
            .retain(|_, a| now.saturating_duration_since(a.last_failure) < idle);
    }

    fn delay_for(&self, attempt: u32, requires_spec_change: bool) -> Duration {
        let base = if requires_spec_change {
            self.config.spec_change_delay
        } else {
            self.config.initial_delay
        };
        let max = self.config.max_delay.as_secs_f64();

        // Exponential growth, capped at max_delay
        let exponent = attempt.min(32) as i32;
        let mut secs =
            (base.as_secs_f64() * self.config.backoff_multiplier.powi(exponent)).min(max);

        if self.config.jitter {
            secs = (secs * rand::thread_rng().gen_range(0.5..1.5)).min(max);
        }

        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "test-namespace/test-broker";

    #[test]
    fn test_delays_double_until_capped() {
        let backoff = KeyedBackoff::new(BackoffConfig::without_jitter());

        assert_eq!(backoff.next_delay(KEY, false), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(KEY, false), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(KEY, false), Duration::from_secs(4));

        for _ in 0..20 {
            backoff.next_delay(KEY, false);
        }
        assert_eq!(backoff.next_delay(KEY, false), Duration::from_secs(300));
    }

    #[test]
    fn test_spec_change_failures_start_slower() {
        let backoff = KeyedBackoff::new(BackoffConfig::without_jitter());
        assert_eq!(backoff.next_delay(KEY, true), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(KEY, true), Duration::from_secs(60));
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let backoff = KeyedBackoff::new(BackoffConfig::without_jitter());
        backoff.next_delay(KEY, false);
        backoff.next_delay(KEY, false);
        assert_eq!(backoff.attempts(KEY), 2);

        backoff.reset(KEY);
        assert_eq!(backoff.attempts(KEY), 0);
        assert_eq!(backoff.next_delay(KEY, false), Duration::from_secs(1));
    }

    #[test]
    fn test_keys_are_independent() {
        let backoff = KeyedBackoff::new(BackoffConfig::without_jitter());
        backoff.next_delay(KEY, false);
        backoff.next_delay(KEY, false);

        assert_eq!(
            backoff.next_delay("other-namespace/other-broker", false),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_max_delay_override_caps_schedule() {
        let backoff = KeyedBackoff::new(BackoffConfig {
            jitter: false,
            ..BackoffConfig::with_max_delay(Duration::from_secs(3))
        });
        backoff.next_delay(KEY, false);
        backoff.next_delay(KEY, false);
        assert_eq!(backoff.next_delay(KEY, false), Duration::from_secs(3));
    }

    /// Story: A Broker deleted while failing stops being tracked
    #[tokio::test(start_paused = true)]
    async fn story_idle_keys_are_forgotten() {
        let backoff = KeyedBackoff::new(BackoffConfig::without_jitter());
        backoff.next_delay(KEY, false);
        backoff.next_delay(KEY, false);

        tokio::time::advance(Duration::from_secs(599)).await;
        backoff.next_delay("other-namespace/other-broker", false);
        assert_eq!(backoff.attempts(KEY), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        backoff.next_delay("other-namespace/other-broker", false);
        assert_eq!(backoff.attempts(KEY), 0);
        assert_eq!(backoff.tracked_keys(), 1);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = KeyedBackoff::new(BackoffConfig::default());
        for _ in 0..50 {
            backoff.reset(KEY);
            let delay = backoff.next_delay(KEY, false);
            assert!(delay >= Duration::from_millis(500), "delay {:?} too short", delay);
            assert!(delay <= Duration::from_millis(1500), "delay {:?} too long", delay);
        }
    }
}

//! Retry and backoff policy.
//!
//! One policy shape drives both the URL poll loop after a spawn and the
//! per-method retries of the connectivity prober.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with optional jitter and a ceiling, plus long
/// cooldown cycles for full relay outages.
///
/// The delay for attempt `k` (zero-based) is
/// `min(base * backoff^k + uniform(0, base * backoff^k), ceiling)`,
/// with the jitter term dropped when `jitter` is false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per cycle
    pub max_attempts: u32,
    /// Delay before the first retry, in seconds
    pub base_delay_secs: f64,
    /// Multiplier applied per attempt
    pub backoff: f64,
    /// Add uniform jitter in `[0, base component]`
    pub jitter: bool,
    /// Upper bound on any single delay, in seconds
    pub ceiling_secs: f64,
    /// Extra cycles after the first one is exhausted
    pub cooldown_cycles: u32,
    /// Pause before each extra cycle, in seconds
    pub cooldown_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_secs: 2.0,
            backoff: 1.5,
            jitter: true,
            ceiling_secs: 30.0,
            cooldown_cycles: 5,
            cooldown_secs: 60,
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the delay for `attempt`, before the ceiling.
    pub fn base_component(&self, attempt: u32) -> f64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay_secs.max(0.0) * self.backoff.max(1.0).powi(exponent);
        if raw.is_finite() {
            raw
        } else {
            f64::MAX
        }
    }

    /// Delay to wait after a failed `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_component(attempt);
        let jitter = if self.jitter && base > 0.0 {
            rand::thread_rng().gen_range(0.0..=base.min(self.ceiling()))
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).min(self.ceiling()))
    }

    /// Pause between cycles.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Total number of cycles (the first one plus the cooldown cycles).
    pub fn total_cycles(&self) -> u32 {
        self.cooldown_cycles.saturating_add(1)
    }

    fn ceiling(&self) -> f64 {
        if self.ceiling_secs.is_finite() {
            self.ceiling_secs.max(0.0)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_stay_within_ceiling() {
        let policy = RetryPolicy {
            base_delay_secs: 1.0,
            ceiling_secs: 30.0,
            ..RetryPolicy::default()
        };
        for attempt in 0..10 {
            let delay = policy.delay_for(attempt).as_secs_f64();
            assert!((0.0..=30.0).contains(&delay), "attempt {attempt}: {delay}");
        }
    }

    #[test]
    fn test_base_component_non_decreasing() {
        let policy = RetryPolicy {
            base_delay_secs: 1.0,
            ceiling_secs: 30.0,
            ..RetryPolicy::default()
        };
        for attempt in 0..9 {
            assert!(policy.base_component(attempt + 1) >= policy.base_component(attempt));
        }
    }

    #[test]
    fn test_without_jitter_is_deterministic() {
        let policy = RetryPolicy {
            base_delay_secs: 1.0,
            backoff: 2.0,
            jitter: false,
            ceiling_secs: 5.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_at_most_doubles() {
        let policy = RetryPolicy {
            base_delay_secs: 1.0,
            backoff: 1.0,
            ceiling_secs: 100.0,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.delay_for(4).as_secs_f64();
            assert!((1.0..=2.0).contains(&delay));
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(u32::MAX).as_secs_f64() <= policy.ceiling_secs);
    }

    #[test]
    fn test_total_cycles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.total_cycles(), 6);
        assert_eq!(policy.cooldown(), Duration::from_secs(60));
    }
}

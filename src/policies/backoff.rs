//! # Agent refork backoff.
//!
//! [`BackoffPolicy`] computes how long the master waits before forking a new agent
//! after the previous one crashed in steady state.
//!
//! The delay for the `n`-th consecutive crash (0-indexed) is `first × factor^n`,
//! clamped to `max`, then jittered. The counter resets once an agent reports
//! `agent-start` again. The default used by the master is a constant one second
//! and never stops reforking.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use procvisor::{BackoffPolicy, JitterPolicy};
//!
//! let constant = BackoffPolicy::constant(Duration::from_secs(1));
//! assert_eq!(constant.next(0), Duration::from_secs(1));
//! assert_eq!(constant.next(7), Duration::from_secs(1));
//!
//! let growing = BackoffPolicy {
//!     first: Duration::from_millis(500),
//!     max: Duration::from_secs(8),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//! assert_eq!(growing.next(2), Duration::from_secs(2));
//! assert_eq!(growing.next(10), Duration::from_secs(8));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Delay policy for consecutive agent crashes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first crash.
    pub first: Duration,
    /// Upper bound of the delay.
    pub max: Duration,
    /// Growth per consecutive crash (`1.0` = constant).
    pub factor: f64,
    /// Randomization applied to the clamped delay.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Constant one second, no jitter.
    fn default() -> Self {
        Self::constant(Duration::from_secs(1))
    }
}

impl BackoffPolicy {
    /// Fixed delay regardless of how many crashes happened in a row.
    pub const fn constant(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Delay before the fork that follows the `attempt`-th consecutive crash.
    ///
    /// The base is derived from `attempt` alone; jitter never feeds back into
    /// later delays.
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };
        self.jitter.apply(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_one_second_forever() {
        let policy = BackoffPolicy::default();
        for attempt in [0, 1, 5, 1_000, u32::MAX] {
            assert_eq!(policy.next(attempt), Duration::from_secs(1));
        }
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = BackoffPolicy {
            first: Duration::from_millis(250),
            max: Duration::from_secs(4),
            factor: 2.0,
            jitter: JitterPolicy::None,
        };
        assert_eq!(policy.next(0), Duration::from_millis(250));
        assert_eq!(policy.next(1), Duration::from_millis(500));
        assert_eq!(policy.next(4), Duration::from_secs(4));
        assert_eq!(policy.next(400), Duration::from_secs(4));
    }

    #[test]
    fn test_first_above_max_is_clamped() {
        let policy = BackoffPolicy {
            first: Duration::from_secs(10),
            max: Duration::from_secs(3),
            factor: 1.0,
            jitter: JitterPolicy::None,
        };
        assert_eq!(policy.next(0), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_stays_below_base() {
        let policy = BackoffPolicy {
            jitter: JitterPolicy::Full,
            ..BackoffPolicy::constant(Duration::from_secs(1))
        };
        for attempt in 0..20 {
            assert!(policy.next(attempt) <= Duration::from_secs(1));
        }
    }
}

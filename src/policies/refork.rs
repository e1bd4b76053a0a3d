//! # App worker refork policy.
//!
//! [`ReforkPolicy`] decides whether an app worker that crashed in steady state is
//! replaced. [`ReforkWindow`] enforces the rate limit: at most `limit` reforks within
//! any sliding `window`; past that the master stops replacing workers and logs an error.
//!
//! ```text
//! app-exit ─► all started? ─► disable_refork? ─► enabled(production)? ─► window.allow(now)?
//!                 no: fatal        yes: skip            no: skip              no: refuse + error
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Whether and how often crashed app workers are replaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReforkPolicy {
    /// `None` = refork only in production.
    pub enabled: Option<bool>,
    /// Maximum reforks inside `window`.
    pub limit: usize,
    /// Sliding window of the rate limit.
    pub window: Duration,
}

impl Default for ReforkPolicy {
    /// Production only, 60 reforks per 60 seconds.
    fn default() -> Self {
        Self {
            enabled: None,
            limit: 60,
            window: Duration::from_secs(60),
        }
    }
}

impl ReforkPolicy {
    /// Resolves the `None` sentinel against the environment.
    #[inline]
    pub fn is_enabled(&self, production: bool) -> bool {
        self.enabled.unwrap_or(production)
    }
}

/// Sliding-window counter of recent reforks.
#[derive(Debug)]
pub struct ReforkWindow {
    limit: usize,
    window: Duration,
    recent: VecDeque<Instant>,
}

impl ReforkWindow {
    pub fn new(policy: &ReforkPolicy) -> Self {
        Self {
            limit: policy.limit,
            window: policy.window,
            recent: VecDeque::with_capacity(policy.limit.min(1024)),
        }
    }

    /// Records a refork at `now` if the window still has room.
    pub fn allow(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.recent.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.recent.len() >= self.limit {
            return false;
        }
        self.recent.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_follows_production_by_default() {
        let policy = ReforkPolicy::default();
        assert!(policy.is_enabled(true));
        assert!(!policy.is_enabled(false));

        let forced = ReforkPolicy {
            enabled: Some(true),
            ..policy
        };
        assert!(forced.is_enabled(false));
    }

    #[test]
    fn test_window_refuses_past_limit_and_recovers() {
        let policy = ReforkPolicy {
            enabled: Some(true),
            limit: 2,
            window: Duration::from_secs(60),
        };
        let mut window = ReforkWindow::new(&policy);
        let start = Instant::now();

        assert!(window.allow(start));
        assert!(window.allow(start + Duration::from_secs(1)));
        assert!(!window.allow(start + Duration::from_secs(2)));
        assert!(window.allow(start + Duration::from_secs(61)));
    }

    #[test]
    fn test_zero_limit_never_allows() {
        let policy = ReforkPolicy {
            enabled: Some(true),
            limit: 0,
            window: Duration::from_secs(1),
        };
        assert!(!ReforkWindow::new(&policy).allow(Instant::now()));
    }
}

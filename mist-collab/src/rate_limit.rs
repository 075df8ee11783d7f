//! Per-session byte budget over a fixed window.
//!
//! The limiter is advisory: callers ask [`RateLimiter::can_send`] before
//! sending and honor the answer. Nothing here blocks or queues.
//!
//! Window expiry is a clock comparison on the next call, not a timer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::session::SessionId;

/// Default accounting window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// 50 kbit/s expressed in bytes per one-second window.
pub const DEFAULT_MAX_BYTES_PER_WINDOW: usize = 50 * 1024 / 8;

/// Limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    pub window: Duration,
    pub max_bytes_per_window: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_bytes_per_window: DEFAULT_MAX_BYTES_PER_WINDOW,
        }
    }
}

/// Bytes accepted for one session in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub window_start: Instant,
    pub bytes_sent: usize,
}

impl RateBudget {
    fn fresh(now: Instant) -> Self {
        Self {
            window_start: now,
            bytes_sent: 0,
        }
    }
}

/// Table of per-session budgets.
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: LimiterConfig,
    budgets: HashMap<SessionId, RateBudget>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            budgets: HashMap::new(),
        }
    }

    /// Check and reserve `message_size` bytes for `session_id`.
    pub fn can_send(&mut self, session_id: &SessionId, message_size: usize) -> bool {
        self.can_send_at(session_id, message_size, Instant::now())
    }

    /// [`can_send`](Self::can_send) against an explicit clock.
    ///
    /// A refused call leaves the stored budget untouched.
    pub fn can_send_at(&mut self, session_id: &SessionId, message_size: usize, now: Instant) -> bool {
        let mut budget = self
            .budgets
            .get(session_id)
            .copied()
            .unwrap_or_else(|| RateBudget::fresh(now));

        if now.saturating_duration_since(budget.window_start) > self.config.window {
            budget = RateBudget::fresh(now);
        }

        if budget.bytes_sent.saturating_add(message_size) > self.config.max_bytes_per_window {
            log::debug!(
                "Rate limit: session {session_id} refused {message_size} bytes ({} already sent)",
                budget.bytes_sent
            );
            return false;
        }

        budget.bytes_sent += message_size;
        self.budgets.insert(session_id.clone(), budget);
        true
    }

    /// Bytes still available in the session's current window, as of the last call.
    pub fn remaining(&self, session_id: &SessionId) -> usize {
        let sent = self.budgets.get(session_id).map_or(0, |b| b.bytes_sent);
        self.config.max_bytes_per_window.saturating_sub(sent)
    }

    pub fn budget(&self, session_id: &SessionId) -> Option<&RateBudget> {
        self.budgets.get(session_id)
    }

    /// Drop the budget for a departed session.
    pub fn forget(&mut self, session_id: &SessionId) {
        self.budgets.remove(session_id);
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cap() {
        assert_eq!(DEFAULT_MAX_BYTES_PER_WINDOW, 6400);
        let config = LimiterConfig::default();
        assert_eq!(config.window, Duration::from_secs(1));
    }

    #[test]
    fn test_window_example() {
        let mut limiter = RateLimiter::default();
        let id = SessionId::from("a");
        let start = Instant::now();

        assert!(limiter.can_send_at(&id, 4000, start));
        // 8000 > 6400 within the same window
        assert!(!limiter.can_send_at(&id, 4000, start + Duration::from_millis(500)));
        // Window elapsed
        assert!(limiter.can_send_at(&id, 4000, start + Duration::from_millis(1001)));
    }

    #[test]
    fn test_refusal_does_not_mutate() {
        let mut limiter = RateLimiter::default();
        let id = SessionId::from("a");
        let start = Instant::now();

        assert!(limiter.can_send_at(&id, 6000, start));
        let before = *limiter.budget(&id).unwrap();

        assert!(!limiter.can_send_at(&id, 401, start + Duration::from_millis(10)));
        assert_eq!(*limiter.budget(&id).unwrap(), before);
        assert_eq!(limiter.remaining(&id), 400);

        // Exactly filling the window is allowed.
        assert!(limiter.can_send_at(&id, 400, start + Duration::from_millis(20)));
        assert_eq!(limiter.remaining(&id), 0);
    }

    #[test]
    fn test_window_boundary_is_exclusive() {
        let mut limiter = RateLimiter::default();
        let id = SessionId::from("a");
        let start = Instant::now();

        assert!(limiter.can_send_at(&id, 6400, start));
        // Exactly one window later has not *exceeded* the window yet.
        assert!(!limiter.can_send_at(&id, 1, start + Duration::from_secs(1)));
        assert!(limiter.can_send_at(&id, 1, start + Duration::from_millis(1001)));
    }

    #[test]
    fn test_oversized_first_message_leaves_no_budget() {
        let mut limiter = RateLimiter::default();
        let id = SessionId::from("a");

        assert!(!limiter.can_send(&id, 10_000));
        assert!(limiter.budget(&id).is_none());
    }

    #[test]
    fn test_cumulative_never_exceeds_cap() {
        let mut limiter = RateLimiter::default();
        let id = SessionId::from("a");
        let start = Instant::now();

        let mut accepted = 0;
        for i in 0..100 {
            let size = 37 + (i * 13) % 300;
            if limiter.can_send_at(&id, size, start + Duration::from_millis(i as u64)) {
                accepted += size;
            }
        }
        assert!(accepted <= DEFAULT_MAX_BYTES_PER_WINDOW);
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut limiter = RateLimiter::default();
        let a = SessionId::from("a");
        let b = SessionId::from("b");

        assert!(limiter.can_send(&a, 6400));
        assert!(!limiter.can_send(&a, 1));
        assert!(limiter.can_send(&b, 6400));
    }

    #[test]
    fn test_forget_resets_budget() {
        let mut limiter = RateLimiter::default();
        let id = SessionId::from("a");

        assert!(limiter.can_send(&id, 6400));
        limiter.forget(&id);
        assert_eq!(limiter.remaining(&id), 6400);
        assert!(limiter.can_send(&id, 6400));
    }

    #[test]
    fn test_custom_config() {
        let mut limiter = RateLimiter::new(LimiterConfig {
            window: Duration::from_millis(100),
            max_bytes_per_window: 10,
        });
        let id = SessionId::from("a");
        let start = Instant::now();

        assert!(limiter.can_send_at(&id, 10, start));
        assert!(!limiter.can_send_at(&id, 1, start + Duration::from_millis(50)));
        assert!(limiter.can_send_at(&id, 10, start + Duration::from_millis(101)));
    }
}

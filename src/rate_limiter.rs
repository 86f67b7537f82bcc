//! Per-key rolling-window rate limiting.
//!
//! Each key owns a [`KeyWindow`] holding the claim timestamps of the last 60
//! seconds plus an optional cooldown deadline (set when the provider itself
//! answers 429). The [`RateLimiter`] is the stateless policy applied to those
//! windows; the key pool owns the windows and serializes access to them.
//!
//! Time is always passed in explicitly so the pool can evaluate every key
//! against one consistent `now`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Length of the rolling window
pub const WINDOW: Duration = Duration::from_secs(60);

/// Claim history for a single key.
#[derive(Debug, Clone, Default)]
pub struct KeyWindow {
    hits: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

impl KeyWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries that have aged out of the window.
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= WINDOW {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.cooldown_until.is_some_and(|until| until <= now) {
            self.cooldown_until = None;
        }
    }

    /// Number of claims inside the window ending at `now`.
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.hits.len()
    }

    fn record(&mut self, now: Instant) {
        self.hits.push_back(now);
    }

    fn cool_down(&mut self, until: Instant) {
        self.cooldown_until = Some(match self.cooldown_until {
            Some(existing) => existing.max(until),
            None => until,
        });
    }
}

/// Rolling-window policy for one provider's keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimiter {
    requests_per_minute: Option<u32>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: Option<u32>) -> Self {
        Self {
            requests_per_minute,
        }
    }

    /// A limiter that never rejects.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// True when the key is cooling down or has used its full quota within
    /// the last 60 seconds.
    pub fn is_limited(&self, window: &mut KeyWindow, now: Instant) -> bool {
        let used = window.count(now);
        if window.cooldown_until.is_some() {
            return true;
        }
        match self.requests_per_minute {
            Some(limit) => used >= limit as usize,
            None => false,
        }
    }

    /// Earliest instant at which a limited key frees a slot. `None` when the
    /// key is not limited.
    pub fn next_available_at(&self, window: &mut KeyWindow, now: Instant) -> Option<Instant> {
        if !self.is_limited(window, now) {
            return None;
        }

        let window_free = match self.requests_per_minute {
            Some(limit) if window.hits.len() >= limit as usize => {
                window.hits.front().map(|oldest| *oldest + WINDOW)
            }
            _ => None,
        };

        match (window_free, window.cooldown_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Charge one claim against the key.
    pub fn record(&self, window: &mut KeyWindow, now: Instant) {
        window.prune(now);
        window.record(now);
    }

    /// Block the key until `now + duration`, regardless of the window count.
    pub fn penalize(&self, window: &mut KeyWindow, now: Instant, duration: Duration) {
        window.cool_down(now + duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_limits() {
        let limiter = RateLimiter::unlimited();
        let mut window = KeyWindow::new();
        let now = Instant::now();
        for _ in 0..1000 {
            limiter.record(&mut window, now);
        }
        assert!(!limiter.is_limited(&mut window, now));
        assert_eq!(limiter.next_available_at(&mut window, now), None);
    }

    #[test]
    fn test_limit_reached_on_kth_claim() {
        let limiter = RateLimiter::new(Some(3));
        let mut window = KeyWindow::new();
        let start = Instant::now();

        for i in 0..3 {
            assert!(!limiter.is_limited(&mut window, start + Duration::from_secs(i)));
            limiter.record(&mut window, start + Duration::from_secs(i));
        }

        let later = start + Duration::from_secs(10);
        assert!(limiter.is_limited(&mut window, later));
        assert_eq!(
            limiter.next_available_at(&mut window, later),
            Some(start + WINDOW)
        );
    }

    #[test]
    fn test_window_frees_when_oldest_ages_out() {
        let limiter = RateLimiter::new(Some(2));
        let mut window = KeyWindow::new();
        let start = Instant::now();

        limiter.record(&mut window, start);
        limiter.record(&mut window, start + Duration::from_secs(30));

        assert!(limiter.is_limited(&mut window, start + Duration::from_secs(59)));
        assert!(!limiter.is_limited(&mut window, start + Duration::from_secs(60)));
        assert_eq!(window.count(start + Duration::from_secs(60)), 1);
        assert_eq!(window.count(start + Duration::from_secs(90)), 0);
    }

    #[test]
    fn test_penalize_blocks_until_cooldown_expires() {
        let limiter = RateLimiter::unlimited();
        let mut window = KeyWindow::new();
        let start = Instant::now();

        limiter.penalize(&mut window, start, Duration::from_secs(20));
        assert!(limiter.is_limited(&mut window, start + Duration::from_secs(5)));
        assert_eq!(
            limiter.next_available_at(&mut window, start + Duration::from_secs(5)),
            Some(start + Duration::from_secs(20))
        );
        assert!(!limiter.is_limited(&mut window, start + Duration::from_secs(20)));
    }

    #[test]
    fn test_cooldown_and_window_take_the_later_deadline() {
        let limiter = RateLimiter::new(Some(1));
        let mut window = KeyWindow::new();
        let start = Instant::now();

        limiter.record(&mut window, start);
        limiter.penalize(&mut window, start, Duration::from_secs(5));

        assert_eq!(
            limiter.next_available_at(&mut window, start + Duration::from_secs(1)),
            Some(start + WINDOW)
        );
    }
}

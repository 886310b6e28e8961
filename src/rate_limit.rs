//! Per-identity sliding-window rate limiting.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_REQUESTS: usize = 5;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Identities with no request for this many windows are forgotten.
pub const DEFAULT_EVICT_AFTER_WINDOWS: u32 = 10;

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    evict_after: Duration,
    records: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            evict_after: window.saturating_mul(DEFAULT_EVICT_AFTER_WINDOWS),
            records: HashMap::new(),
        }
    }

    /// Forget identities that have been idle for `windows` windows.
    pub fn with_eviction_after(mut self, windows: u32) -> Self {
        self.evict_after = self.window.saturating_mul(windows.max(1));
        self
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a request for `identity` now, if it is within its limit.
    pub fn allow(&mut self, identity: &str) -> bool {
        self.allow_at(identity, Instant::now())
    }

    /// Same as [`allow`](Self::allow) with an explicit clock reading.
    pub fn allow_at(&mut self, identity: &str, now: Instant) -> bool {
        self.evict_idle(now);

        let window = self.window;
        let times = self.records.entry(identity.to_string()).or_default();
        while let Some(&oldest) = times.front() {
            if now.saturating_duration_since(oldest) >= window {
                times.pop_front();
            } else {
                break;
            }
        }

        if times.len() >= self.max_requests {
            return false;
        }

        times.push_back(now);
        true
    }

    /// Number of identities currently tracked.
    pub fn tracked_identities(&self) -> usize {
        self.records.len()
    }

    fn evict_idle(&mut self, now: Instant) {
        let evict_after = self.evict_after;
        self.records.retain(|_, times| match times.back() {
            Some(&newest) => now.saturating_duration_since(newest) < evict_after,
            None => false,
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_after_max_within_window() {
        let mut limiter = RateLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();
        for i in 0..5 {
            assert!(limiter.allow_at("alice", start + Duration::from_secs(i)));
        }
        assert!(!limiter.allow_at("alice", start + Duration::from_secs(10)));
        assert!(!limiter.allow_at("alice", start + Duration::from_secs(59)));
    }

    #[test]
    fn allows_again_once_oldest_expires() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();
        assert!(limiter.allow_at("bob", start));
        assert!(limiter.allow_at("bob", start + Duration::from_secs(30)));
        assert!(!limiter.allow_at("bob", start + Duration::from_secs(59)));
        assert!(limiter.allow_at("bob", start + Duration::from_secs(60)));
        assert!(!limiter.allow_at("bob", start + Duration::from_secs(61)));
    }

    #[test]
    fn rejected_requests_are_not_recorded() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();
        assert!(limiter.allow_at("c", start));
        for s in 1..10 {
            assert!(!limiter.allow_at("c", start + Duration::from_secs(s)));
        }
        assert!(limiter.allow_at("c", start + Duration::from_secs(10)));
    }

    #[test]
    fn identities_are_independent() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.allow_at("a", now));
        assert!(!limiter.allow_at("a", now));
        assert!(limiter.allow_at("b", now));
    }

    #[test]
    fn idle_identities_are_evicted() {
        let mut limiter =
            RateLimiter::new(5, Duration::from_secs(1)).with_eviction_after(2);
        let start = Instant::now();
        assert!(limiter.allow_at("old", start));
        assert!(limiter.allow_at("fresh", start + Duration::from_secs(1)));
        assert_eq!(limiter.tracked_identities(), 2);

        assert!(limiter.allow_at("fresh", start + Duration::from_secs(2)));
        assert_eq!(limiter.tracked_identities(), 1);
    }
}

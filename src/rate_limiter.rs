//! Per-client fixed-window rate limiter.
//!
//! Counts requests per client identity (normally the peer IP) over a window:
//! - The first request of a client, or the first after its window elapsed,
//!   opens a new window with `count = 1`
//! - Every further request in the window increments the count
//! - A request is allowed while `count <= max_requests`
//!
//! The read-increment-compare step for one client runs under the map's shard
//! lock, so parallel requests from the same client are never undercounted.
//! Requests from different clients only contend when they hash to the same
//! shard.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

// ============================================================================
// Configuration
// ============================================================================

/// Request budget per client and window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum number of requests allowed per client within the window
    pub max_requests: u32,
    /// Length of one window
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self { max_requests, window }
    }

    /// Returns `true` if the configuration can ever allow a request.
    pub fn is_valid(&self) -> bool {
        self.max_requests > 0 && !self.window.is_zero()
    }
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Window state of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindowEntry {
    /// Requests seen in the current window, including refused ones
    pub count: u32,
    /// When the current window opened
    pub window_start: Instant,
}

impl RateWindowEntry {
    fn open(now: Instant) -> Self {
        Self {
            count: 1,
            window_start: now,
        }
    }

    fn expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.window_start) >= window
    }
}

/// Shared counter store. Disabled (always allows) unless built with a limit.
#[derive(Debug, Default)]
pub struct RateLimiter {
    limit: Option<RateLimitConfig>,
    entries: DashMap<String, RateWindowEntry>,
}

impl RateLimiter {
    /// A limiter that allows every request and keeps no state.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A limiter enforcing `limit`.
    pub fn new(limit: RateLimitConfig) -> Self {
        Self {
            limit: Some(limit),
            entries: DashMap::new(),
        }
    }

    /// Build from an optional limit; `None` yields a disabled limiter.
    pub fn from_config(limit: Option<RateLimitConfig>) -> Self {
        limit.map_or_else(Self::disabled, Self::new)
    }

    pub fn is_enabled(&self) -> bool {
        self.limit.is_some()
    }

    pub fn limit(&self) -> Option<RateLimitConfig> {
        self.limit
    }

    /// Record one request from `client_id` and report whether it is allowed.
    pub fn allow(&self, client_id: &str) -> bool {
        self.allow_at(client_id, Instant::now())
    }

    /// [`allow`](Self::allow) against an explicit clock reading.
    pub fn allow_at(&self, client_id: &str, now: Instant) -> bool {
        let Some(limit) = self.limit else {
            return true;
        };

        let mut entry = self
            .entries
            .entry(client_id.to_string())
            .or_insert_with(|| RateWindowEntry {
                count: 0,
                window_start: now,
            });

        if entry.count == 0 || entry.expired(now, limit.window) {
            *entry = RateWindowEntry::open(now);
        } else {
            entry.count = entry.count.saturating_add(1);
        }

        entry.count <= limit.max_requests
    }

    /// Current window state of a client, if tracked.
    pub fn entry(&self, client_id: &str) -> Option<RateWindowEntry> {
        self.entries.get(client_id).map(|entry| *entry)
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry whose window elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let Some(limit) = self.limit else {
            return 0;
        };
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.expired(now, limit.window));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Purged expired rate limit windows");
        }
        removed
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn limiter(max: u32, secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig::new(max, Duration::from_secs(secs)))
    }

    /// Three requests fit the budget, the fourth is refused.
    #[test]
    fn test_allows_up_to_max_then_refuses() {
        let limiter = limiter(3, 60);
        let now = Instant::now();

        assert!(limiter.allow_at("10.0.0.1", now));
        assert!(limiter.allow_at("10.0.0.1", now + Duration::from_secs(1)));
        assert!(limiter.allow_at("10.0.0.1", now + Duration::from_secs(2)));
        assert!(!limiter.allow_at("10.0.0.1", now + Duration::from_secs(3)));
    }

    /// The counter resets once the window elapsed.
    #[test]
    fn test_window_resets_after_elapsing() {
        let limiter = limiter(3, 60);
        let now = Instant::now();

        for _ in 0..4 {
            limiter.allow_at("client", now);
        }
        assert!(!limiter.allow_at("client", now + Duration::from_secs(59)));

        let later = now + Duration::from_secs(60);
        assert!(limiter.allow_at("client", later));
        let entry = limiter.entry("client").unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.window_start, later);
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = limiter(1, 60);
        let now = Instant::now();

        assert!(limiter.allow_at("a", now));
        assert!(!limiter.allow_at("a", now));
        assert!(limiter.allow_at("b", now));
    }

    #[test]
    fn test_disabled_always_allows() {
        let limiter = RateLimiter::disabled();
        assert!(!limiter.is_enabled());
        for _ in 0..10_000 {
            assert!(limiter.allow("client"));
        }
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_from_config_none_is_disabled() {
        assert!(!RateLimiter::from_config(None).is_enabled());
        let limit = RateLimitConfig::new(1, Duration::from_secs(1));
        assert!(RateLimiter::from_config(Some(limit)).is_enabled());
    }

    #[test]
    fn test_purge_removes_only_expired() {
        let limiter = limiter(5, 10);
        let now = Instant::now();

        limiter.allow_at("old", now);
        limiter.allow_at("fresh", now + Duration::from_secs(8));

        assert_eq!(limiter.purge_expired_at(now + Duration::from_secs(11)), 1);
        assert!(limiter.entry("old").is_none());
        assert!(limiter.entry("fresh").is_some());
    }

    /// Parallel requests from one client are counted exactly.
    #[test]
    fn test_concurrent_requests_are_not_undercounted() {
        let limiter = Arc::new(limiter(100, 3600));
        let allowed = Arc::new(AtomicU32::new(0));
        let now = Instant::now();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let limiter = Arc::clone(&limiter);
                let allowed = Arc::clone(&allowed);
                scope.spawn(move || {
                    for _ in 0..50 {
                        if limiter.allow_at("shared", now) {
                            allowed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(allowed.load(Ordering::Relaxed), 100);
        assert_eq!(limiter.entry("shared").unwrap().count, 400);
    }

    #[test]
    fn test_config_validity() {
        assert!(RateLimitConfig::new(3, Duration::from_secs(60)).is_valid());
        assert!(!RateLimitConfig::new(0, Duration::from_secs(60)).is_valid());
        assert!(!RateLimitConfig::new(3, Duration::ZERO).is_valid());
    }
}

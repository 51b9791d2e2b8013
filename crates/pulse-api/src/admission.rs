//! Ingestion admission gate: per-client sliding-window rate limiting
//! combined with queue-pressure load shedding.
//!
//! The limiter keeps raw request timestamps per client so the
//! `X-RateLimit-Remaining` and `X-RateLimit-Reset` headers are exact,
//! not an approximation over fixed buckets.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use pulse_core::defaults;

/// Rate limiter tuning.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(defaults::RATE_LIMIT_WINDOW_MS),
            max_requests: defaults::RATE_LIMIT_MAX_REQUESTS,
        }
    }
}

impl RateLimitConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `RATE_LIMIT_WINDOW_MS` | `60000` |
    /// | `RATE_LIMIT_MAX_REQUESTS` | `1000` |
    pub fn from_env() -> Self {
        let window_ms = std::env::var("RATE_LIMIT_WINDOW_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::RATE_LIMIT_WINDOW_MS);
        let max_requests = std::env::var("RATE_LIMIT_MAX_REQUESTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::RATE_LIMIT_MAX_REQUESTS);
        Self {
            window: Duration::from_millis(window_ms),
            max_requests,
        }
    }
}

/// Verdict for one request, with the header values to surface.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: usize,
    pub remaining: usize,
    /// Seconds until the oldest counted request leaves the window.
    pub reset_secs: u64,
    /// Present when denied.
    pub retry_after_secs: Option<u64>,
}

/// Per-client sliding-window limiter.
pub struct SlidingWindowLimiter {
    clients: DashMap<String, VecDeque<Instant>>,
    config: RateLimitConfig,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            clients: DashMap::new(),
            config,
        }
    }

    /// Count one request for `client` and decide. Denials do not count
    /// against the window.
    pub fn check(&self, client: &str) -> RateDecision {
        let now = Instant::now();
        let mut entry = self.clients.entry(client.to_string()).or_default();
        while let Some(&front) = entry.front() {
            if now.duration_since(front) >= self.config.window {
                entry.pop_front();
            } else {
                break;
            }
        }

        let limit = self.config.max_requests;
        let reset_secs = entry
            .front()
            .map(|&oldest| {
                self.config
                    .window
                    .saturating_sub(now.duration_since(oldest))
                    .as_secs()
            })
            .unwrap_or(0);

        if entry.len() >= limit {
            return RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_secs,
                retry_after_secs: Some(reset_secs.max(1)),
            };
        }

        entry.push_back(now);
        RateDecision {
            allowed: true,
            limit,
            remaining: limit - entry.len(),
            reset_secs: if entry.len() == 1 {
                self.config.window.as_secs()
            } else {
                reset_secs
            },
            retry_after_secs: None,
        }
    }

    /// Drop clients whose whole window has expired. Called
    /// periodically by the cleanup task.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let window = self.config.window;
        let before = self.clients.len();
        self.clients.retain(|_, timestamps| {
            timestamps
                .back()
                .is_some_and(|&last| now.duration_since(last) < window)
        });
        before - self.clients.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }
}

/// Load level derived from queue utilization, surfaced in the
/// `X-Load-Level` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadLevel {
    Normal,
    Warning,
    Critical,
}

impl LoadLevel {
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization >= defaults::QUEUE_REJECT_THRESHOLD {
            LoadLevel::Critical
        } else if utilization >= defaults::QUEUE_WARNING_THRESHOLD {
            LoadLevel::Warning
        } else {
            LoadLevel::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadLevel::Normal => "normal",
            LoadLevel::Warning => "warning",
            LoadLevel::Critical => "critical",
        }
    }

    /// Critical load closes the admission gate.
    pub fn rejects(&self) -> bool {
        matches!(self, LoadLevel::Critical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: usize, window_ms: u64) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(RateLimitConfig {
            window: Duration::from_millis(window_ms),
            max_requests: max,
        })
    }

    #[test]
    fn test_allows_up_to_limit_then_denies() {
        let l = limiter(3, 60_000);
        for expected_remaining in [2, 1, 0] {
            let d = l.check("10.0.0.1");
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }
        let denied = l.check("10.0.0.1");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after_secs.is_some());
    }

    #[test]
    fn test_clients_are_independent() {
        let l = limiter(1, 60_000);
        assert!(l.check("a").allowed);
        assert!(!l.check("a").allowed);
        assert!(l.check("b").allowed);
    }

    #[test]
    fn test_window_slides() {
        let l = limiter(2, 30);
        assert!(l.check("a").allowed);
        assert!(l.check("a").allowed);
        assert!(!l.check("a").allowed);
        std::thread::sleep(Duration::from_millis(40));
        assert!(l.check("a").allowed);
    }

    #[test]
    fn test_denied_requests_do_not_extend_window() {
        let l = limiter(1, 50);
        assert!(l.check("a").allowed);
        for _ in 0..5 {
            assert!(!l.check("a").allowed);
        }
        std::thread::sleep(Duration::from_millis(60));
        // Had denials counted, the window would still be saturated.
        assert!(l.check("a").allowed);
    }

    #[test]
    fn test_cleanup_drops_idle_clients() {
        let l = limiter(5, 20);
        l.check("a");
        l.check("b");
        assert_eq!(l.tracked_clients(), 2);
        std::thread::sleep(Duration::from_millis(30));
        l.check("c");
        assert_eq!(l.cleanup(), 2);
        assert_eq!(l.tracked_clients(), 1);
    }

    #[test]
    fn test_load_levels() {
        assert_eq!(LoadLevel::from_utilization(0.10), LoadLevel::Normal);
        assert_eq!(LoadLevel::from_utilization(0.69), LoadLevel::Normal);
        assert_eq!(LoadLevel::from_utilization(0.70), LoadLevel::Warning);
        assert_eq!(LoadLevel::from_utilization(0.75), LoadLevel::Warning);
        assert_eq!(LoadLevel::from_utilization(0.90), LoadLevel::Critical);
        assert!(LoadLevel::from_utilization(0.95).rejects());
        assert!(!LoadLevel::from_utilization(0.75).rejects());
    }
}

//! Anonymous rate limiting.
//!
//! A fixed-window, per-IP limiter gating free/unauthenticated usage. It is
//! an injected stateful collaborator (construct one, share it by reference),
//! never ambient global state, so tests can build isolated instances.
//!
//! Deliberately weaker than the ledger: memory-resident, reset on process
//! restart, and undercounting across multiple instances. That is an
//! accepted trade-off for a best-effort free tier — nothing durable should
//! ever depend on this module.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::utils::{get_env_with_prefix, unix_now};

/// Sweep expired windows out of the map every N `allow` calls. Lazy expiry
/// keeps the hot path O(1) while bounding memory under many unique IPs.
const SWEEP_INTERVAL: u64 = 1024;

/// Fixed-window limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length in seconds.
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_seconds: 3600,
        }
    }
}

impl RateLimitConfig {
    /// Load from `ANON_RATE_LIMIT_MAX` / `ANON_RATE_LIMIT_WINDOW_SECONDS`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max) = get_env_with_prefix("ANON_RATE_LIMIT_MAX") {
            if let Ok(val) = max.parse() {
                config.max_requests = val;
            }
        }
        if let Some(window) = get_env_with_prefix("ANON_RATE_LIMIT_WINDOW_SECONDS") {
            if let Ok(val) = window.parse() {
                config.window_seconds = val;
            }
        }
        config
    }
}

/// Decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests left in the current window (0 when denied).
    pub remaining: u32,
    /// When the current window resets (Unix seconds).
    pub reset_at: u64,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: u64,
    count: u32,
}

/// Fixed-window, per-IP rate limiter.
pub struct FixedWindowLimiter {
    config: RateLimitConfig,
    windows: RwLock<HashMap<IpAddr, Window>>,
    calls: AtomicU64,
}

impl FixedWindowLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
            calls: AtomicU64::new(0),
        }
    }

    /// Admit or reject one request from `ip`.
    pub fn allow(&self, ip: IpAddr) -> RateDecision {
        let now = unix_now();

        let calls = self.calls.fetch_add(1, Ordering::Relaxed);
        if calls % SWEEP_INTERVAL == 0 && calls > 0 {
            self.sweep(now);
        }

        let mut windows = self.windows.write().unwrap();
        let window = windows.entry(ip).or_insert(Window {
            started_at: now,
            count: 0,
        });

        // Window rolled over; start a fresh one.
        if now >= window.started_at + self.config.window_seconds {
            window.started_at = now;
            window.count = 0;
        }

        let reset_at = window.started_at + self.config.window_seconds;

        if window.count >= self.config.max_requests {
            return RateDecision {
                allowed: false,
                remaining: 0,
                reset_at,
            };
        }

        window.count += 1;
        RateDecision {
            allowed: true,
            remaining: self.config.max_requests - window.count,
            reset_at,
        }
    }

    /// Drop windows that have fully elapsed.
    fn sweep(&self, now: u64) {
        let mut windows = self.windows.write().unwrap();
        let window_seconds = self.config.window_seconds;
        windows.retain(|_, w| now < w.started_at + window_seconds);
    }

    /// Number of tracked IPs (test/observability helper).
    #[must_use]
    pub fn tracked_ips(&self) -> usize {
        self.windows.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 168, 1, last])
    }

    fn limiter(max: u32, window: u64) -> FixedWindowLimiter {
        FixedWindowLimiter::new(RateLimitConfig {
            max_requests: max,
            window_seconds: window,
        })
    }

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = limiter(3, 3600);

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.allow(ip(1));
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let denied = limiter.allow(ip(1));
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.reset_at > unix_now());
    }

    #[test]
    fn test_per_ip_isolation() {
        let limiter = limiter(1, 3600);

        assert!(limiter.allow(ip(1)).allowed);
        assert!(!limiter.allow(ip(1)).allowed);
        // A different IP has its own window.
        assert!(limiter.allow(ip(2)).allowed);
    }

    #[test]
    fn test_window_rollover() {
        let limiter = limiter(1, 3600);
        assert!(limiter.allow(ip(1)).allowed);
        assert!(!limiter.allow(ip(1)).allowed);

        // Age the window past its end.
        {
            let mut windows = limiter.windows.write().unwrap();
            windows.get_mut(&ip(1)).unwrap().started_at = unix_now() - 7200;
        }

        let decision = limiter.allow(ip(1));
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_sweep_drops_expired_windows() {
        let limiter = limiter(5, 3600);
        limiter.allow(ip(1));
        limiter.allow(ip(2));
        assert_eq!(limiter.tracked_ips(), 2);

        {
            let mut windows = limiter.windows.write().unwrap();
            windows.get_mut(&ip(1)).unwrap().started_at = unix_now() - 7200;
        }

        limiter.sweep(unix_now());
        assert_eq!(limiter.tracked_ips(), 1);
    }

    #[test]
    fn test_reset_on_new_instance() {
        // Documented weaker guarantee: a restart forgets all counts.
        let first = limiter(1, 3600);
        assert!(first.allow(ip(1)).allowed);
        assert!(!first.allow(ip(1)).allowed);

        let second = limiter(1, 3600);
        assert!(second.allow(ip(1)).allowed);
    }

    #[test]
    fn test_concurrent_access_counts_exactly() {
        use std::sync::Arc;
        use std::thread;

        let limiter = Arc::new(limiter(50, 3600));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(thread::spawn(move || {
                let mut allowed = 0;
                for _ in 0..10 {
                    if limiter.allow(ip(1)).allowed {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 100 attempts against a limit of 50: exactly 50 admitted.
        assert_eq!(total, 50);
    }

    #[test]
    fn test_config_from_env() {
        unsafe {
            std::env::set_var("TOLLGATE_ANON_RATE_LIMIT_MAX", "7");
        }
        let config = RateLimitConfig::from_env();
        assert_eq!(config.max_requests, 7);
        assert_eq!(config.window_seconds, 3600);
        unsafe {
            std::env::remove_var("TOLLGATE_ANON_RATE_LIMIT_MAX");
        }
    }
}

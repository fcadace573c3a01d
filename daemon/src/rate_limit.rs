//! Per-IP fixed-window rate limiting

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

struct Window {
    start: Instant,
    count: u32,
}

/// Thread-safe fixed-window limiter keyed by source IP
pub struct RateLimiter {
    windows: DashMap<IpAddr, Window>,
    max: u32,
    window: Duration,
}

impl RateLimiter {
    /// Allow `max` events per `window` per IP
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max,
            window,
        }
    }

    /// Record an event; false when the IP is over its limit
    pub fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut entry = self.windows.entry(ip).or_insert(Window {
            start: now,
            count: 0,
        });

        if now.duration_since(entry.start) >= self.window {
            entry.start = now;
            entry.count = 1;
            return true;
        }

        if entry.count >= self.max {
            return false;
        }

        entry.count += 1;
        true
    }

    /// Remove expired windows
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.windows
            .retain(|_, w| now.duration_since(w.start) < self.window);
    }

    /// Get the number of tracked IPs
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    #[test]
    fn test_limit_then_reset() {
        let limiter = RateLimiter::new(10, Duration::from_secs(60));
        let start = Instant::now();

        for _ in 0..10 {
            assert!(limiter.check_at(IP, start));
        }
        assert!(!limiter.check_at(IP, start + Duration::from_secs(59)));

        // New window
        assert!(limiter.check_at(IP, start + Duration::from_secs(60)));
    }

    #[test]
    fn test_ips_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        assert!(limiter.check(IP));
        assert!(!limiter.check(IP));
        assert!(limiter.check(other));
    }

    #[test]
    fn test_cleanup() {
        let limiter = RateLimiter::new(5, Duration::from_millis(20));

        limiter.check(IP);
        assert_eq!(limiter.len(), 1);

        std::thread::sleep(Duration::from_millis(30));
        limiter.cleanup();
        assert!(limiter.is_empty());
    }
}

//! Per-client-IP rate limiting.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Sliding one-minute window per client IP.
#[derive(Debug)]
pub struct IpRateLimiter {
    limit:   usize,
    window:  Duration,
    clients: DashMap<IpAddr, VecDeque<Instant>>,
}

impl IpRateLimiter {
    /// Allow `limit` requests per minute per IP.
    #[must_use]
    pub fn per_minute(limit: usize) -> Self {
        Self {
            limit:   limit.max(1),
            window:  Duration::from_secs(60),
            clients: DashMap::new(),
        }
    }

    /// Check and record one request. Returns `Ok(())` or the number of
    /// seconds until the client may retry.
    ///
    /// # Errors
    ///
    /// Returns the retry-after hint in seconds when the limit is hit.
    pub fn check(&self, ip: IpAddr) -> Result<(), u64> {
        let now = Instant::now();
        let mut window = self.clients.entry(ip).or_default();

        while window.front().is_some_and(|t| now.duration_since(*t) > self.window) {
            window.pop_front();
        }

        if window.len() >= self.limit {
            let oldest = window.front().copied().unwrap_or(now);
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(oldest))
                .as_secs()
                .max(1);
            return Err(retry_after);
        }

        window.push_back(now);
        Ok(())
    }

    /// Drop windows that have gone fully idle (housekeeping).
    pub fn prune(&self) {
        let now = Instant::now();
        self.clients
            .retain(|_, window| window.back().is_some_and(|t| now.duration_since(*t) <= self.window));
    }
}

//! Per-route rate limiting

use dashmap::DashMap;
use std::collections::VecDeque;
use tokio::time::Instant;
use waypoint_core::RateLimit;

/// Decides whether a request may proceed on a rate-limited route
pub trait RateLimiter: Send + Sync {
    /// `key` identifies the bucket (the route prefix by default)
    fn try_acquire(&self, key: &str, limit: &RateLimit) -> bool;
}

/// Sliding-window counter: at most `limit` admissions in any `window`
#[derive(Debug, Default)]
pub struct SlidingWindowLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn try_acquire(&self, key: &str, limit: &RateLimit) -> bool {
        let now = Instant::now();
        let window = std::time::Duration::from_secs(limit.window_secs);
        let mut admitted = self.windows.entry(key.to_string()).or_default();

        while let Some(oldest) = admitted.front() {
            if now.duration_since(*oldest) >= window {
                admitted.pop_front();
            } else {
                break;
            }
        }

        if admitted.len() < limit.limit as usize {
            admitted.push_back(now);
            true
        } else {
            false
        }
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sliding-window rate limiting, keyed globally and per tenant.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Key for the global window.
const GLOBAL_KEY: &str = "";

/// Keyed sliding-window counter. One instance serves the global window
/// (empty key) and every tenant window.
#[derive(Debug)]
pub struct SlidingWindow {
    window: Duration,
    max_requests: u32,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindow {
    /// Allow `max_requests` per `window` per key.
    #[must_use]
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hit for `key`; returns `false` when the budget is spent.
    pub fn check_key(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let bucket = buckets.entry(key.to_string()).or_default();
        while let Some(&front) = bucket.front() {
            if now.duration_since(front) > self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }
        if bucket.len() as u32 >= self.max_requests {
            return false;
        }
        bucket.push_back(now);
        true
    }

    /// Record a hit on the global window.
    pub fn check_global(&self) -> bool {
        self.check_key(GLOBAL_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_enforced_per_key() {
        let limiter = SlidingWindow::new(Duration::from_secs(60), 2);
        assert!(limiter.check_key("a"));
        assert!(limiter.check_key("a"));
        assert!(!limiter.check_key("a"));
        // Another key has its own budget.
        assert!(limiter.check_key("b"));
    }

    #[test]
    fn window_expiry_frees_budget() {
        let limiter = SlidingWindow::new(Duration::from_millis(20), 1);
        assert!(limiter.check_global());
        assert!(!limiter.check_global());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check_global());
    }
}

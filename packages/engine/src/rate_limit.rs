//! Per-user sliding-window rate limiting for submissions.
//!
//! Shapes enqueue pressure upstream of the queues; it is not a security
//! boundary. Entries expire on the same window they are counted over, and
//! idle users are pruned as a side effect of other users' checks.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::error::EngineError;

/// Sliding-window limiter keyed by an opaque caller id.
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    entries: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl RateLimiter {
    /// Allow `max_per_window` submissions per `window` per caller.
    pub fn new(max_per_window: usize, window: std::time::Duration) -> Self {
        Self {
            max_per_window: max_per_window.max(1),
            window: Duration::milliseconds(window.as_millis() as i64),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record one submission for `key`, or fail if the window is full.
    pub fn check(&self, key: &str) -> Result<(), EngineError> {
        let now = Utc::now();
        let cutoff = now - self.window;
        let mut entries = self.entries.lock();

        // Opportunistic cleanup of idle callers.
        entries.retain(|_, stamps| stamps.iter().any(|t| *t > cutoff));

        let stamps = entries.entry(key.to_string()).or_default();
        stamps.retain(|t| *t > cutoff);
        if stamps.len() >= self.max_per_window {
            return Err(EngineError::RateLimited(key.to_string()));
        }
        stamps.push(now);
        Ok(())
    }

    /// Submissions currently counted for `key`.
    pub fn current(&self, key: &str) -> usize {
        let cutoff = Utc::now() - self.window;
        self.entries
            .lock()
            .get(key)
            .map(|stamps| stamps.iter().filter(|t| **t > cutoff).count())
            .unwrap_or(0)
    }
}

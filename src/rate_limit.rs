//! Login Rate Limiting
//!
//! Token bucket per peer address, consumed on every `PASS` attempt to slow
//! down password guessing.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    touched: Instant,
}

impl Bucket {
    fn full(capacity: f64) -> Self {
        Bucket {
            tokens: capacity,
            touched: Instant::now(),
        }
    }

    fn take(&mut self, capacity: f64, per_second: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.touched).as_secs_f64();
        self.tokens = (self.tokens + elapsed * per_second).min(capacity);
        self.touched = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-address token bucket limiter.
pub struct RateLimiter {
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
    capacity: f64,
    per_second: f64,
}

impl RateLimiter {
    /// Allows `max_per_minute` attempts per address, refilled continuously.
    /// Zero disables limiting.
    pub fn new(max_per_minute: u32) -> Self {
        RateLimiter {
            buckets: Mutex::new(HashMap::new()),
            capacity: max_per_minute as f64,
            per_second: max_per_minute as f64 / 60.0,
        }
    }

    /// Consumes one attempt for `addr`. Returns false when throttled.
    pub fn consume(&self, addr: IpAddr) -> bool {
        if self.capacity == 0.0 {
            return true;
        }
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets
            .entry(addr)
            .or_insert_with(|| Bucket::full(self.capacity))
            .take(self.capacity, self.per_second)
    }

    /// Drops buckets untouched for `max_idle`. Returns how many were removed.
    pub fn cleanup_inactive(&self, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        let now = Instant::now();
        buckets.retain(|_, bucket| now.duration_since(bucket.touched) < max_idle);
        before - buckets.len()
    }

    pub fn tracked_addresses(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

//! Rate limiting.
//! Mission: token bucket keyed by client address, stage 5.
//! Default window 15 min / capacity 100; a stricter class (capacity 10) for
//! authentication endpoints; health-probe paths bypass entirely.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::route_table::RateLimitClass;

#[derive(Clone, Copy)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub standard_capacity: u32,
    pub strict_capacity: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            standard_capacity: 100,
            strict_capacity: 10,
        }
    }
}

struct Bucket {
    count: u32,
    window_start: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    // keyed by (ip, class) so the strict class has its own ceiling
    buckets: Mutex<HashMap<(IpAddr, bool), Bucket>>,
}

pub struct RateLimitOutcome {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after: Duration,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// `None` class means bypass (health probes) and is never checked.
    pub fn check(&self, ip: IpAddr, class: RateLimitClass) -> Option<RateLimitOutcome> {
        let (strict, limit) = match class {
            RateLimitClass::Bypass => return None,
            RateLimitClass::Strict => (true, self.config.strict_capacity),
            RateLimitClass::Standard => (false, self.config.standard_capacity),
        };

        let mut buckets = self.buckets.lock();
        let now = Instant::now();
        let bucket = buckets.entry((ip, strict)).or_insert(Bucket {
            count: 0,
            window_start: now,
        });

        if now.duration_since(bucket.window_start) >= self.config.window {
            bucket.count = 0;
            bucket.window_start = now;
        }

        bucket.count += 1;
        let remaining = limit.saturating_sub(bucket.count);
        let reset_at = bucket.window_start + self.config.window;
        let retry_after = reset_at.saturating_duration_since(now);

        Some(RateLimitOutcome {
            allowed: bucket.count <= limit,
            limit,
            remaining,
            retry_after,
        })
    }

    /// Periodic sweep of stale buckets; call from a background task.
    pub fn cleanup(&self) {
        let mut buckets = self.buckets.lock();
        let now = Instant::now();
        let window = self.config.window;
        buckets.retain(|_, bucket| now.duration_since(bucket.window_start) < window * 2);
    }
}

//! Global placement rate limiter.
//!
//! A smooth token bucket: permits become available at a fixed rate and
//! `acquire` waits for the next free slot. One permit is consumed per
//! placement attempt, successful or not, which bounds scheduler load on
//! the cluster manager.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct RateLimiter {
    interval: Duration,
    next_free: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// A limiter releasing `permits_per_sec` permits per second.
    pub fn new(permits_per_sec: f64) -> Self {
        let per_sec = permits_per_sec.max(0.001);
        Self {
            interval: Duration::from_secs_f64(1.0 / per_sec),
            next_free: Mutex::new(None),
        }
    }

    /// Take one permit, waiting until it is available.
    pub async fn acquire(&self) {
        let wake_at = {
            let mut next_free = self.next_free.lock().await;
            let now = Instant::now();
            let at = next_free.unwrap_or(now).max(now);
            *next_free = Some(at + self.interval);
            at
        };
        tokio::time::sleep_until(wake_at).await;
    }
}

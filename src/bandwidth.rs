/*!
 * Traffic limiting with token bucket rate limiting
 */

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Upper bound on the bucket's replenish rate; the rate is also its burst size
const MAX_TOKENS_PER_SEC: u64 = 1000;

/// Per-transfer traffic limiter (bytes/sec)
#[derive(Clone)]
pub struct TrafficLimiter {
    limiter: Option<Arc<GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
    bytes_per_token: u64,
    tokens_per_sec: u32,
}

impl TrafficLimiter {
    /// Create a new limiter
    ///
    /// # Arguments
    /// * `max_bytes_per_sec` - Maximum bytes per second (0 = unlimited)
    pub fn new(max_bytes_per_sec: u64) -> Self {
        if max_bytes_per_sec == 0 {
            return Self::unlimited();
        }

        // At most 1000 tokens a second; limits below that get one byte per token
        let bytes_per_token = max_bytes_per_sec.div_ceil(MAX_TOKENS_PER_SEC);
        let tokens_per_sec = (max_bytes_per_sec / bytes_per_token).clamp(1, MAX_TOKENS_PER_SEC) as u32;
        let Some(rate) = NonZeroU32::new(tokens_per_sec) else {
            return Self::unlimited();
        };

        Self {
            limiter: Some(Arc::new(GovernorRateLimiter::direct(Quota::per_second(rate)))),
            bytes_per_token,
            tokens_per_sec,
        }
    }

    /// A limiter that never waits
    pub fn unlimited() -> Self {
        Self {
            limiter: None,
            bytes_per_token: 0,
            tokens_per_sec: 0,
        }
    }

    /// Build from an optional traffic limit
    pub fn from_limit(limit: Option<u64>) -> Self {
        Self::new(limit.unwrap_or(0))
    }

    /// Block until `bytes` may be transferred
    pub fn wait_for_capacity(&self, bytes: u64) {
        let Some(ref limiter) = self.limiter else {
            return;
        };

        let mut tokens_left = bytes.div_ceil(self.bytes_per_token).max(1);
        while tokens_left > 0 {
            // Requests larger than the burst size can never succeed in one go
            let batch = tokens_left.min(self.tokens_per_sec as u64) as u32;
            let Some(n) = NonZeroU32::new(batch) else {
                return;
            };
            loop {
                match limiter.check_n(n) {
                    Ok(Ok(())) => break,
                    Ok(Err(_)) => thread::sleep(Duration::from_millis(1)),
                    Err(_) => return,
                }
            }
            tokens_left -= batch as u64;
        }
    }

    /// Check if traffic limiting is enabled
    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }
}

impl std::fmt::Debug for TrafficLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficLimiter")
            .field("enabled", &self.is_enabled())
            .field("bytes_per_token", &self.bytes_per_token)
            .field("tokens_per_sec", &self.tokens_per_sec)
            .finish()
    }
}

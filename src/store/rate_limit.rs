//! Token-bucket rate limiting for backend calls.
//!
//! Tokens are tracked in milli-token units on atomics, so acquiring never
//! holds a lock across I/O. Refill is computed lazily from elapsed time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

const MILLI: u64 = 1000;

/// Rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity (burst size).
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_per_sec: 100,
        }
    }
}

/// Lock-free token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity_milli: u64,
    refill_per_sec: u64,
    /// Available milli-tokens.
    available: AtomicU64,
    /// Milliseconds since `epoch` at the last refill.
    last_refill_ms: AtomicU64,
    epoch: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity_milli = u64::from(config.capacity.max(1)) * MILLI;
        Self {
            capacity_milli,
            refill_per_sec: u64::from(config.refill_per_sec),
            available: AtomicU64::new(capacity_milli),
            last_refill_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    fn refill(&self) {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_refill_ms.load(Ordering::Acquire);
        if now_ms <= last {
            return;
        }
        // Only the thread that advances the timestamp credits the tokens.
        if self
            .last_refill_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let credit = (now_ms - last) * self.refill_per_sec;
        let _ = self.available.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some((current + credit).min(self.capacity_milli))
        });
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        self.refill();
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| current.checked_sub(MILLI))
            .is_ok()
    }

    /// Wait until a token is available, then take it.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            tokio::time::sleep(self.wait_hint()).await;
        }
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> u64 {
        self.refill();
        self.available.load(Ordering::Acquire) / MILLI
    }

    /// Time until one token accrues at the refill rate.
    fn wait_hint(&self) -> Duration {
        if self.refill_per_sec == 0 {
            return Duration::from_millis(100);
        }
        let missing = MILLI.saturating_sub(self.available.load(Ordering::Acquire));
        Duration::from_millis((missing / self.refill_per_sec).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let bucket = TokenBucket::new(&RateLimitConfig {
            capacity: 2,
            refill_per_sec: 10,
        });
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_token() {
        let bucket = TokenBucket::new(&RateLimitConfig {
            capacity: 1,
            refill_per_sec: 5,
        });
        bucket.acquire().await;
        let before = Instant::now();
        bucket.acquire().await;
        assert!(before.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_capacity() {
        let bucket = TokenBucket::new(&RateLimitConfig {
            capacity: 3,
            refill_per_sec: 100,
        });
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(bucket.available(), 3);
    }
}

//! Token-bucket rate limiting for the CLOB REST API.
//!
//! The exchange enforces per-category limits measured in requests per
//! 10-second window. The buckets here refill continuously (rather than in
//! 10s bursts) so a steady caller never slams into the hard limit:
//!
//! - Order:  350 burst / 50 per sec  (maps to the 3500/10s limit)
//! - Cancel: 300 burst / 30 per sec  (maps to 3000/10s)
//! - Book:   150 burst / 15 per sec  (maps to 1500/10s)

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A token bucket with continuous refill. Callers await [`TokenBucket::acquire`]
/// until a token is available; fractional tokens are allowed internally so the
/// refill is smooth.
#[derive(Debug)]
pub struct TokenBucket {
    inner: Mutex<BucketState>,
    capacity: f64,
    rate: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket with the given burst capacity and refill rate
    /// (tokens per second).
    pub fn new(capacity: f64, rate_per_second: f64) -> Self {
        Self {
            inner: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            rate: rate_per_second,
        }
    }

    /// Wait until a token is available, then consume it.
    ///
    /// Cancellation-safe: dropping the future consumes nothing.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.inner.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Try to consume a token without waiting. Returns false if empty.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.inner.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rate limiters grouped by CLOB endpoint category. Every request must
/// acquire from the matching bucket before hitting the wire.
#[derive(Debug)]
pub struct RateLimiter {
    /// POST /orders — placing new orders.
    pub order: TokenBucket,
    /// DELETE /orders, /cancel-all, /cancel-market-orders.
    pub cancel: TokenBucket,
    /// GET /book — order book reads.
    pub book: TokenBucket,
}

impl RateLimiter {
    /// Buckets tuned to the exchange's published limits: capacity is the
    /// 10-second burst allowance, rate is 1/10th of it for smooth refill.
    pub fn new() -> Self {
        Self {
            order: TokenBucket::new(350.0, 50.0),
            cancel: TokenBucket::new(300.0, 30.0),
            book: TokenBucket::new(150.0, 15.0),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_up_to_capacity() {
        let bucket = TokenBucket::new(5.0, 1.0);
        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire(), "sixth immediate acquire must fail");
    }

    #[test]
    fn refills_over_time() {
        let bucket = TokenBucket::new(2.0, 1000.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        // At 1000 tokens/sec a few milliseconds is plenty.
        std::thread::sleep(Duration::from_millis(5));
        assert!(bucket.try_acquire());
    }

    #[tokio::test]
    async fn acquire_blocks_then_succeeds() {
        let bucket = TokenBucket::new(1.0, 100.0);
        bucket.acquire().await;

        let start = Instant::now();
        bucket.acquire().await;
        // Second token needs ~10ms of refill.
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn default_categories() {
        let rl = RateLimiter::new();
        assert!(rl.order.try_acquire());
        assert!(rl.cancel.try_acquire());
        assert!(rl.book.try_acquire());
    }
}

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Process-wide token bucket for compressor calls.
///
/// A failed acquire is reported to the caller as a rate-limit failure;
/// compression tasks are never queued behind the bucket.
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    rate: f64, // tokens per second
}

impl TokenBucket {
    fn new(rate: f64) -> Self {
        Self {
            tokens: rate, // Start with a full bucket.
            last_refill: Instant::now(),
            rate,
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate * 2.0);
        self.last_refill = Instant::now();
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            let needed = 1.0 - self.tokens;
            Duration::from_secs_f64(needed / self.rate)
        }
    }
}

impl RateLimiter {
    /// Create a limiter with the given refill rate (permits per second).
    pub fn new(rate: f64) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(rate.max(0.001))),
        }
    }

    /// Take one permit if available right now.
    pub async fn try_acquire(&self) -> bool {
        let acquired = self.bucket.lock().await.try_acquire();
        if !acquired {
            metrics::counter!("compression.rate_limited").increment(1);
        }
        acquired
    }

    /// How long until a permit would be available.
    pub async fn time_until_available(&self) -> Duration {
        self.bucket.lock().await.time_until_available()
    }
}

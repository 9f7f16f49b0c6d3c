use std::time::Duration;
use tokio::{
    sync::Mutex,
    time::{Instant, sleep},
};

/// Process-wide token bucket shared by every image fetch.
pub struct RateLimiter {
    rate_per_sec: f64,
    capacity: f64,
    bucket: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Burst capacity equals one second's worth of requests.
    pub fn per_second(rate_per_sec: f64) -> Self {
        let rate_per_sec = if rate_per_sec > 0.0 { rate_per_sec } else { 1.0 };
        let capacity = rate_per_sec.max(1.0);
        Self {
            rate_per_sec,
            capacity,
            bucket: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until a token is available and takes it.
    pub async fn acquire(&self) {
        loop {
            match self.try_consume().await {
                Ok(()) => return,
                Err(wait) => sleep(wait).await,
            }
        }
    }

    async fn try_consume(&self) -> Result<(), Duration> {
        let mut state = self.bucket.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64((deficit / self.rate_per_sec).max(0.001)))
        }
    }
}

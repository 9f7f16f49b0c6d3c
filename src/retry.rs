//! Bounded retry-with-backoff shared by extraction, fetch and delivery.

use rand::Rng;
use std::{fmt::Display, future::Future, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `attempt × base`
    Linear(Duration),
    Fixed(Duration),
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Linear(base) => base.saturating_mul(attempt),
            Backoff::Fixed(delay) => *delay,
        }
    }
}

/// What the caller wants done with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retry,
    /// Explicit backpressure: wait exactly this long, without spending the failure budget.
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub jitter: Duration,
    pub max_rate_limited: u32,
}

impl RetryPolicy {
    /// `retries` extra attempts after the first, with linear backoff.
    pub fn linear(retries: u32, base: Duration) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            backoff: Backoff::Linear(base),
            jitter: Duration::ZERO,
            max_rate_limited: 10,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
            jitter: Duration::ZERO,
            max_rate_limited: 10,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_rate_limit_ceiling(mut self, waits: u32) -> Self {
        self.max_rate_limited = waits;
        self
    }

    /// Runs `op` until it succeeds, `classify` gives up, or the budget is spent.
    ///
    /// `op` receives the 1-based call number, which keeps counting across
    /// rate-limited waits so callers can escalate per-call timeouts.
    pub async fn run<T, E, F, Fut, C>(&self, label: &str, mut op: F, classify: C) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> Verdict,
        E: Display,
    {
        let mut call = 0u32;
        let mut failures = 0u32;
        let mut rate_limited = 0u32;
        loop {
            call += 1;
            let err = match op(call).await {
                Ok(value) => {
                    if call > 1 {
                        info!(
                            target = "listing_bot.retry",
                            op = label,
                            attempt = call,
                            failures,
                            "recovered after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let wait = match classify(&err) {
                Verdict::GiveUp => {
                    error!(target = "listing_bot.retry", op = label, attempt = call, error = %err, "non-retryable failure");
                    return Err(err);
                }
                Verdict::RetryAfter(delay) => {
                    rate_limited += 1;
                    if rate_limited > self.max_rate_limited {
                        error!(target = "listing_bot.retry", op = label, attempt = call, error = %err, "rate limit waits exhausted");
                        return Err(err);
                    }
                    warn!(
                        target = "listing_bot.retry",
                        op = label,
                        attempt = call,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited; honoring server delay"
                    );
                    delay
                }
                Verdict::Retry => {
                    failures += 1;
                    if failures >= self.max_attempts {
                        error!(target = "listing_bot.retry", op = label, attempt = call, error = %err, "retries exhausted");
                        return Err(err);
                    }
                    let delay = self.backoff.delay(failures) + self.jitter_sample();
                    warn!(
                        target = "listing_bot.retry",
                        op = label,
                        attempt = call,
                        remaining = self.max_attempts - failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed; backing off"
                    );
                    delay
                }
            };
            sleep(wait).await;
        }
    }

    fn jitter_sample(&self) -> Duration {
        let max = self.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };
    use tokio::time::Instant;

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let backoff = Backoff::Linear(Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(3), Duration::from_millis(1500));
        assert_eq!(Backoff::Fixed(Duration::from_secs(3)).delay(4), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_within_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::linear(2, Duration::from_secs(1));
        let started = Instant::now();
        let counter = calls.clone();
        let out: Result<u32, String> = policy
            .run(
                "test",
                |attempt| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if attempt < 3 { Err("timeout".to_string()) } else { Ok(attempt) }
                    }
                },
                |_| Verdict::Retry,
            )
            .await;
        assert_eq!(out, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::linear(2, Duration::from_millis(10));
        let counter = calls.clone();
        let out: Result<(), String> = policy
            .run(
                "test",
                |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err("boom".to_string())
                    }
                },
                |_| Verdict::Retry,
            )
            .await;
        assert_eq!(out, Err("boom".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_do_not_spend_budget() {
        let policy = RetryPolicy::fixed(1, Duration::from_secs(1));
        let started = Instant::now();
        let out: Result<u32, String> = policy
            .run(
                "test",
                |attempt| async move {
                    if attempt < 3 { Err("slow down".to_string()) } else { Ok(attempt) }
                },
                |_| Verdict::RetryAfter(Duration::from_secs(2)),
            )
            .await;
        assert_eq!(out, Ok(3));
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn give_up_stops_immediately() {
        let policy = RetryPolicy::linear(5, Duration::from_secs(60));
        let out: Result<(), &str> = policy
            .run("test", |_| async { Err("fatal") }, |_| Verdict::GiveUp)
            .await;
        assert_eq!(out, Err("fatal"));
    }
}

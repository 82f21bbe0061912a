use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

const MICROS_PER_SECOND: u128 = 1_000_000;

/// Token bucket with integer micro-token accounting.
pub struct RateLimiter {
    per_second: u64,
    capacity: u64,
    /// Tokens scaled by `MICROS_PER_SECOND`
    tokens: u128,
    last_refill: Instant,
}

impl RateLimiter {
    /// Bucket refilling at `per_second`, holding at most one second of burst.
    pub fn new(per_second: u64) -> Self {
        Self::with_capacity(per_second, per_second.max(1))
    }

    pub fn with_capacity(per_second: u64, capacity: u64) -> Self {
        Self {
            per_second,
            capacity,
            tokens: (capacity as u128) * MICROS_PER_SECOND,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed_micros = now.duration_since(self.last_refill).as_micros();
        if elapsed_micros == 0 {
            return;
        }

        let added = (self.per_second as u128) * elapsed_micros;
        let max_tokens = (self.capacity as u128) * MICROS_PER_SECOND;
        self.tokens = self.tokens.saturating_add(added).min(max_tokens);
        self.last_refill = now;
    }

    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= MICROS_PER_SECOND {
            self.tokens -= MICROS_PER_SECOND;
            true
        } else {
            false
        }
    }

    /// Time until the next token is available.
    fn wait_time(&self) -> Duration {
        if self.per_second == 0 {
            return Duration::from_secs(1);
        }
        let deficit = MICROS_PER_SECOND.saturating_sub(self.tokens);
        Duration::from_micros((deficit / self.per_second as u128) as u64)
    }

    pub async fn acquire(&mut self) {
        while !self.try_acquire() {
            sleep(self.wait_time()).await;
        }
    }
}

/// Limiter shared by every worker of a pipeline.
#[derive(Clone)]
pub struct SharedRateLimiter {
    inner: Arc<Mutex<RateLimiter>>,
}

impl SharedRateLimiter {
    pub fn new(per_second: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RateLimiter::new(per_second))),
        }
    }

    /// Wait for one permit. Waiters are served in FIFO order.
    pub async fn acquire(&self) {
        self.inner.lock().await.acquire().await;
    }
}

// Token bucket rate limiter with a bounded wait queue

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::config::GatewayConfig;
use crate::error::{TradingError, TradingResult};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Calls take one token each. Callers wait for a token while fewer than
/// `max_queue_depth` are already waiting; beyond that they get `RateLimited`.
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    max_queue_depth: usize,
    waiting: AtomicUsize,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(rate_per_sec: u32, burst: u32, max_queue_depth: usize) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            rate_per_sec: f64::from(rate_per_sec.max(1)),
            capacity,
            max_queue_depth,
            waiting: AtomicUsize::new(0),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.requests_per_second, config.burst, config.max_queue_depth)
    }

    /// Calls currently waiting for a token
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Take a token without waiting
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait for a token, or fail fast when the queue is full
    pub async fn acquire(&self) -> TradingResult<()> {
        if self.try_acquire().await {
            return Ok(());
        }

        let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _slot = QueueSlot(&self.waiting);
        if queued >= self.max_queue_depth {
            return Err(TradingError::RateLimited { queued });
        }

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate_per_sec)
            };
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }
}

struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

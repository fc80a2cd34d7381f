// Retry with backoff and graceful shutdown tracking

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::error::{TradingError, TradingResult};

/// Retry mechanism with exponential backoff and jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            backoff_multiplier,
            jitter: true,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            2.0,
        )
    }

    /// Deterministic delays, for tests
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff before retry number `attempt` (0-based), capped at max_delay
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        let mut delay = Duration::from_millis(millis as u64);

        if self.jitter && !delay.is_zero() {
            let spread = delay.as_millis() as u64 / 2;
            let extra = rand::thread_rng().gen_range(0..=spread);
            delay = (delay + Duration::from_millis(extra)).min(self.max_delay);
        }
        delay
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or retries run out.
    /// The closure receives the attempt number so callers can tell a first try from a retry.
    pub async fn execute<F, Fut, T>(&self, name: &str, mut operation: F) -> TradingResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = TradingResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(result) => return Ok(result),
                Err(error) if error.is_retryable() && attempt < self.max_retries => {
                    let mut delay = self.delay_for(attempt);
                    if let Some(hint) = error.backoff_hint() {
                        delay = delay.max(hint);
                    }
                    warn!(
                        "🔄 {} failed (attempt {}), retrying in {:?}: {}",
                        name,
                        attempt + 1,
                        delay,
                        error
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,                                    // 3 retries
            Duration::from_millis(500),          // 500ms base delay
            Duration::from_secs(30),             // 30s max delay
            2.0,                                 // Double delay each time
        )
    }
}

/// Graceful shutdown handler shared by the runner and the gateway
#[derive(Debug, Clone, Default)]
pub struct GracefulShutdown {
    shutdown_signal: Arc<AtomicBool>,
    active_operations: Arc<AtomicUsize>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initiate_shutdown(&self) {
        if !self.shutdown_signal.swap(true, Ordering::SeqCst) {
            info!("🛑 Shutdown flag set, no new orders will be placed");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_signal.load(Ordering::SeqCst)
    }

    /// Track a mutating exchange call until the guard drops
    pub fn register_operation(&self) -> OperationGuard {
        self.active_operations.fetch_add(1, Ordering::SeqCst);
        OperationGuard {
            counter: self.active_operations.clone(),
        }
    }

    pub fn active_operations(&self) -> usize {
        self.active_operations.load(Ordering::SeqCst)
    }

    /// Wait for in-flight calls. Returns false when the timeout hit first.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        let start = Instant::now();

        while start.elapsed() < timeout {
            let active_count = self.active_operations();
            if active_count == 0 {
                info!("✅ All in-flight exchange calls completed");
                return true;
            }

            tracing::debug!("⏳ Waiting for {} exchange calls to complete...", active_count);
            sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.active_operations();
        if remaining > 0 {
            warn!("⚠️  Shutdown timeout: {} exchange calls still active", remaining);
            return false;
        }
        true
    }

    /// Error returned to callers trying to start new work after shutdown
    pub fn check(&self) -> TradingResult<()> {
        if self.is_shutting_down() {
            Err(TradingError::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

pub struct OperationGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

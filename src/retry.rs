//! Exponential backoff with jitter.
//!
//! Two shapes of the same policy: [`retry_if`] retries a single async call in
//! place, and [`Backoff`] hands out successive delays to a loop that schedules
//! its own retries (the reconcile driver).
//!
//! # Example
//!
//! ```ignore
//! use dynamic_authority::retry::{retry_if, RetryConfig};
//!
//! let secret = retry_if(
//!     &RetryConfig::with_max_attempts(5),
//!     "apply_secret",
//!     Error::is_conflict,
//!     || async { store.apply_secret(&secret).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff parameters
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Backoff used between failed reconcile passes
    pub fn reconcile() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

/// Successive jittered delays for a caller-driven retry loop
#[derive(Clone, Debug)]
pub struct Backoff {
    config: RetryConfig,
    current: Duration,
    failures: u32,
}

impl Backoff {
    /// Start a fresh backoff sequence
    pub fn new(config: RetryConfig) -> Self {
        let current = config.initial_delay;
        Self {
            config,
            current,
            failures: 0,
        }
    }

    /// Delay to wait after another failure
    pub fn next_delay(&mut self) -> Duration {
        self.failures += 1;
        let delay = jitter(self.current);
        self.current = grow(self.current, &self.config);
        delay
    }

    /// Consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Forget all failures after a success
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.failures = 0;
    }
}

// 0.5x to 1.5x of the delay
fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

// Exponential growth, capped at max_delay
fn grow(delay: Duration, config: &RetryConfig) -> Duration {
    Duration::from_secs_f64(
        (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
    )
}

/// Execute an async operation, retrying errors accepted by `should_retry`.
///
/// Errors rejected by `should_retry` are returned immediately. Retryable
/// errors are retried with exponential backoff and jitter until the
/// operation succeeds or `max_attempts` is exhausted.
pub async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut backoff = Backoff::new(config.clone());

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = backoff.next_delay();
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let result: Result<i32, &str> =
            retry_if(&fast(3), "op", |_| true, || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_retries_accepted_errors() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_if(&fast(5), "op", |_| true, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("conflict")
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejected_errors_are_returned_at_once() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_if(&fast(5), "op", |e| *e == "conflict", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("forbidden")
            }
        })
        .await;

        assert_eq!(result, Err("forbidden"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_if(&fast(3), "op", |_| true, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("conflict")
            }
        })
        .await;

        assert_eq!(result, Err("conflict"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_grows_caps_and_resets() {
        let config = RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            backoff_multiplier: 2.0,
        };
        let mut backoff = Backoff::new(config);

        // Base delays 1, 2, 4, 4 with 0.5x-1.5x jitter
        let bounds = [(0.5, 1.5), (1.0, 3.0), (2.0, 6.0), (2.0, 6.0)];
        for (lo, hi) in bounds {
            let d = backoff.next_delay().as_secs_f64();
            assert!(d >= lo && d <= hi, "delay {} outside [{}, {}]", d, lo, hi);
        }
        assert_eq!(backoff.failures(), 4);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        let d = backoff.next_delay().as_secs_f64();
        assert!((0.5..=1.5).contains(&d));
    }
}

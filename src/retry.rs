//! Retry helpers for cluster calls that may fail transiently.
//!
//! Finalizer removal and SecurityContextConstraints updates use
//! [`retry_on_conflict`]; readiness waits use [`poll_until`]. Startup checks
//! against the API server use [`retry_with_backoff`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::Result;

/// Backoff settings for a bounded retry loop
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Fixed interval, no growth; used for readiness polling
    pub fn fixed(attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: interval,
            max_delay: interval,
            backoff_multiplier: 1.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

/// Run `operation` with exponential backoff and jitter while it fails with a
/// retriable error
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() && attempt < config.max_attempts => {
                let wait = jittered(delay);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    delay_ms = wait.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(wait).await;
                delay = config.next_delay(delay);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-conflict error, or the
/// attempt budget is spent. The operation is expected to re-read the object it
/// updates on every attempt.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_conflict() && attempt < config.max_attempts => {
                let wait = jittered(delay);
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    delay_ms = wait.as_millis() as u64,
                    "Conflict, retrying"
                );
                tokio::time::sleep(wait).await;
                delay = config.next_delay(delay);
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Giving up after repeated conflicts"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Poll `check` until it reports `true` or the attempt budget is spent.
///
/// Returns whether the condition was met. Errors from `check` count as a
/// failed attempt; they never abort the wait.
pub async fn poll_until<F, Fut>(config: &RetryConfig, what: &str, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut delay = config.initial_delay;
    for attempt in 1..=config.max_attempts {
        match check().await {
            Ok(true) => return true,
            Ok(false) => debug!(what = %what, attempt = attempt, "Not ready yet"),
            Err(e) => debug!(what = %what, attempt = attempt, error = %e, "Readiness check failed"),
        }
        if attempt < config.max_attempts {
            tokio::time::sleep(delay).await;
            delay = config.next_delay(delay);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig::fixed(attempts, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result = retry_on_conflict(&fast(5), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Conflict("stale".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<()> = retry_on_conflict(&fast(5), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::NotFound("gone".to_string()))
            }
        })
        .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conflict_budget_is_bounded() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<()> = retry_on_conflict(&fast(5), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::Conflict("stale".to_string()))
            }
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_backoff_retries_transient_errors() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result = retry_with_backoff(&fast(4), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(Error::Gone("expired".to_string()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_backoff_stops_on_permanent_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<()> = retry_with_backoff(&fast(4), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::ConfigError("bad".to_string()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_growth_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            backoff_multiplier: 2.0,
        };
        assert_eq!(config.next_delay(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(config.next_delay(Duration::from_secs(2)), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_poll_until_gives_up() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let ready = poll_until(&fast(3), "never", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
        })
        .await;
        assert!(!ready);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_succeeds() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let ready = poll_until(&fast(10), "soon", || {
            let c = c.clone();
            async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 1) }
        })
        .await;
        assert!(ready);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}

//! Retry with exponential backoff and jitter
//!
//! Used for the API server endpoint lookup and the readiness wait, the only
//! steps allowed to retry.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, warn};

#[derive(Clone, Debug)]
/// Retry budget and backoff shape
pub struct RetryConfig {
    /// Maximum number of attempts, 0 for no limit
    pub max_attempts: u32,
    /// Give up once this much time has passed since the first attempt
    pub max_elapsed: Option<Duration>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Relative jitter applied to every delay, 0.1 spreads it by ±10%
    pub jitter: f64,
}

impl RetryConfig {
    /// Four quick attempts for reading an API object
    pub fn api_lookup() -> Self {
        Self {
            max_attempts: 4,
            max_elapsed: None,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 5.0,
            jitter: 0.1,
        }
    }

    /// Polling a component until it comes up, bounded in time
    pub fn readiness(max_elapsed: Duration) -> Self {
        Self {
            max_attempts: 0,
            max_elapsed: Some(max_elapsed),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// Run `operation` until it succeeds or the retry budget is spent, returning
/// the last error in the latter case.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => err,
        };

        let jitter = if config.jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - config.jitter..1.0 + config.jitter)
        } else {
            1.0
        };
        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

        let attempts_spent = config.max_attempts > 0 && attempt >= config.max_attempts;
        let time_spent = config
            .max_elapsed
            .is_some_and(|budget| started.elapsed() + jittered > budget);
        if attempts_spent || time_spent {
            error!(
                operation = %operation_name,
                attempt,
                error = %err,
                "Operation failed, giving up"
            );
            return Err(err);
        }

        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = jittered.as_millis(),
            "Operation failed, retrying"
        );
        tokio::time::sleep(jittered).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            max_elapsed: None,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<u32, String> = retry_with_backoff(&fast(5), "op", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n}"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<(), String> = retry_with_backoff(&fast(4), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("nope".to_string())
            }
        })
        .await;

        assert_eq!(result, Err("nope".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_elapsed() {
        let config = RetryConfig::readiness(Duration::from_secs(5));
        let result: Result<(), &str> =
            retry_with_backoff(&config, "readiness", || async { Err("not ready") }).await;
        assert_eq!(result, Err("not ready"));
    }
}

//! Connection attempts with capped, doubling backoff.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How a client session retries a failed connect.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per connect cycle, the first one included.
    pub max_attempts: u32,
    /// Wait after the first failure; doubles after each further one.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scale each wait by a random factor in `0.5..1.5`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// The same wait between every attempt.
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts.max(1),
            base_delay: delay,
            max_delay: delay,
            jitter: false,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait before attempt `failed + 1`, given `failed` failures so far
    /// (0-indexed).
    pub fn delay_after(&self, failed: u32) -> Duration {
        let cap = self.max_delay.as_secs_f64();
        let doubled = self.base_delay.as_secs_f64() * 2f64.powi(failed.min(31) as i32);
        let mut secs = doubled.min(cap);
        if self.jitter {
            secs = (secs * rand::rng().random_range(0.5..1.5)).min(cap);
        }
        Duration::from_secs_f64(secs)
    }
}

/// Run `attempt` until it succeeds, fails with an error `retryable`
/// rejects, or `max_attempts` is used up.
///
/// Returns the last outcome and how many attempts it took.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    mut attempt: F,
    retryable: impl Fn(&E) -> bool,
) -> (Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut failed = 0;

    loop {
        let e = match attempt().await {
            Ok(value) => {
                if failed > 0 {
                    debug!("Connected after {} attempts", failed + 1);
                }
                return (Ok(value), failed + 1);
            }
            Err(e) => e,
        };

        if !retryable(&e) {
            debug!("Not retrying: {}", e);
            return (Err(e), failed + 1);
        }
        if failed + 1 >= max_attempts {
            warn!("All {} attempts failed, last: {}", max_attempts, e);
            return (Err(e), failed + 1);
        }

        let delay = config.delay_after(failed);
        warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            failed + 1,
            max_attempts,
            e,
            delay
        );
        tokio::time::sleep(delay).await;
        failed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500))
            .with_jitter(false);

        assert_eq!(config.delay_after(0), Duration::from_millis(100));
        assert_eq!(config.delay_after(1), Duration::from_millis(200));
        assert_eq!(config.delay_after(2), Duration::from_millis(400));
        assert_eq!(config.delay_after(3), Duration::from_millis(500));
        assert_eq!(config.delay_after(1000), Duration::from_millis(500));
    }

    #[test]
    fn test_fixed_delay() {
        let config = RetryConfig::fixed(4, Duration::from_millis(50));
        assert_eq!(config.delay_after(0), Duration::from_millis(50));
        assert_eq!(config.delay_after(3), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = RetryConfig::new().with_base_delay(Duration::from_secs(2));
        for _ in 0..20 {
            let delay = config.delay_after(0);
            assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3));
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let config = RetryConfig::fixed(3, Duration::from_millis(10));
        let calls = AtomicU32::new(0);

        let (result, attempts) = retry_async(
            &config,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("connection refused".to_string())
                    } else {
                        Ok(42)
                    }
                }
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let config = RetryConfig::fixed(3, Duration::from_millis(10));
        let (result, attempts) = retry_async(
            &config,
            || async { Err::<i32, _>("always fails".to_string()) },
            |_: &String| true,
        )
        .await;

        assert_eq!(result.unwrap_err(), "always fails");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_stops_on_fatal_error() {
        let config = RetryConfig::new().with_max_attempts(3);
        let (result, attempts) = retry_async(
            &config,
            || async { Err::<i32, _>("handshake rejected".to_string()) },
            |e: &String| !e.contains("rejected"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}

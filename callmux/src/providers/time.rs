//! Time provider abstraction.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during time operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// The operation timed out.
    #[error("operation timed out")]
    Elapsed,
}

/// Provider trait for time operations.
///
/// - `now()`: monotonic time since the provider was created. Latencies are
///   differences of two `now()` readings.
/// - `sleep()`: wait without blocking the worker.
#[async_trait]
pub trait TimeProvider: Clone + Send + Sync + 'static {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);

    /// Monotonic time elapsed since the provider was created.
    fn now(&self) -> Duration;

    /// Run a future with a timeout.
    ///
    /// Returns `Ok(result)` if the future completes within the timeout,
    /// or `Err(TimeError::Elapsed)` if it times out.
    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: Future<Output = T> + Send,
        T: Send;
}

/// Time provider backed by Tokio's clock.
///
/// Uses `tokio::time::Instant`, so tests running with a paused clock observe
/// exact, reproducible durations.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start_time: tokio::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new Tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }

    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: Future<Output = T> + Send,
        T: Send,
    {
        tokio::time::timeout(duration, future)
            .await
            .map_err(|_| TimeError::Elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_advances_now() {
        let time = TokioTimeProvider::new();
        let before = time.now();
        time.sleep(Duration::from_millis(25)).await;
        assert_eq!(time.now() - before, Duration::from_millis(25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_elapsed() {
        let time = TokioTimeProvider::new();
        let result = time
            .timeout(Duration::from_millis(10), tokio::time::sleep(Duration::from_secs(1)))
            .await;
        assert_eq!(result, Err(TimeError::Elapsed));
    }

    #[tokio::test]
    async fn test_timeout_completes() {
        let time = TokioTimeProvider::new();
        let result = time.timeout(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(result, Ok(7));
    }
}

//! Retry with exponential backoff for identity service calls
//!
//! The remote identity service rate-limits aggressively. Rate-limit responses
//! carry a retry-after delay which takes precedence over the computed backoff.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt)
    pub max_retries: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration, also caps retry-after hints
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add up to 25% random jitter
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Policy for a rate-limited service with a documented retry-after delay
    pub fn rate_limited(retry_after: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: retry_after,
            max_backoff: retry_after.max(Duration::from_secs(1)) * 5,
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Short backoff, for tests and local services
    pub fn quick() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Backoff duration before retry number `attempt` (0-based)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let secs = if self.jitter {
            capped * (1.0 + jitter_fraction() * 0.25)
        } else {
            capped
        };
        Duration::from_secs_f64(secs)
    }
}

/// Pseudo-random value in [0, 1) from the clock's sub-second nanos
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    /// Retry after the delay the service asked for
    RetryAfter(Duration),
    /// Permanent failure
    NoRetry,
}

/// Errors that know whether they are worth retrying
pub trait RetryableError {
    fn retry_decision(&self) -> RetryDecision;
}

/// Run an async operation, retrying transient failures
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let decision = err.retry_decision();
        if decision == RetryDecision::NoRetry {
            debug!(
                operation = operation_name,
                attempt, "Permanent failure: {}", err
            );
            return Err(err);
        }

        if attempt >= config.max_retries {
            warn!(
                operation = operation_name,
                attempts = attempt + 1,
                "Giving up: {}",
                err
            );
            return Err(err);
        }

        let backoff = match decision {
            RetryDecision::RetryAfter(delay) => delay.min(config.max_backoff),
            _ => config.backoff_duration(attempt),
        };

        warn!(
            operation = operation_name,
            attempt = attempt + 1,
            backoff_ms = backoff.as_millis() as u64,
            "Retrying after error: {}",
            err
        );
        sleep(backoff).await;
        attempt += 1;
    }
}

//! Retry with Exponential Backoff
//!
//! Used by the token issuer so that a transient issuer outage does not cost a
//! whole refresh cycle. Only errors the caller classifies as transient are
//! retried; permanent rejections fail on the first attempt.

use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration
///
/// * `max_attempts` - attempts including the first one (default: 6)
/// * `base_delay` - delay before the first retry (default: 1s)
/// * `max_delay` - cap on any single delay (default: 30s)
/// * `jitter` - random extra delay as a fraction of the computed one (default: 0.1)
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor, clamped to `0.0..=1.0`
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-based): `base_delay * 2^attempt`,
    /// plus jitter, capped at `max_delay`.
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(u32::MAX as usize) as u32);
        let exponential_delay = self.base_delay.saturating_mul(factor);

        let jittered_delay = if self.jitter > 0.0 {
            let extra = exponential_delay.mul_f64(self.jitter * rand::random::<f64>());
            exponential_delay.saturating_add(extra)
        } else {
            exponential_delay
        };

        jittered_delay.min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts
///
/// `is_transient` decides whether an error is worth another attempt. The last
/// error is returned when attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    config: &RetryConfig,
    mut operation: F,
    is_transient: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    C: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!("Operation succeeded on attempt {}", attempt + 1);
                }
                return Ok(result);
            }
            Err(e) if attempt + 1 < config.max_attempts && is_transient(&e) => {
                let delay = config.calculate_delay(attempt);
                tracing::warn!(
                    "Attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::debug!("Giving up after {} attempts: {}", attempt + 1, e);
                return Err(e);
            }
        }
    }
}

/// Server-side statuses worth retrying: 500, 502, 503 and 504
pub fn should_retry_status(status: u16) -> bool {
    matches!(status, 500 | 502 | 503 | 504)
}

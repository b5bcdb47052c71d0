//! LD-003: Bounded exponential backoff shared by classification and
//! remote mutations.

use crate::core::types::RetrySettings;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy. `max_attempts` counts the first try.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            multiplier: settings.multiplier,
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-indexed), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Returns the final result and the attempts made.
pub async fn retry_async<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    label: &str,
    is_retryable: P,
    mut op: F,
) -> (Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(label = %label, attempt, "retry succeeded");
                }
                return (Ok(value), attempt);
            }
            Err(e) => {
                if !is_retryable(&e) {
                    return (Err(e), attempt);
                }
                if attempt >= max {
                    warn!(label = %label, attempt, error = %e, "retries exhausted");
                    return (Err(e), attempt);
                }
                let delay = policy.delay_for(attempt - 1);
                warn!(
                    label = %label,
                    attempt,
                    max_attempts = max,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, will retry"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

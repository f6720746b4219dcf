//! Retry logic with exponential backoff and jitter

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::RetrySettings;
use crate::error::{EvalError, EvalResult};

/// Exponential backoff delay for a zero-based attempt number, jittered
/// and capped by the configured ceiling.
pub fn backoff_delay(settings: &RetrySettings, attempt: u32) -> Duration {
    let exp = settings
        .initial_delay_ms
        .saturating_mul(1u64 << attempt.min(16));
    jittered(
        Duration::from_millis(exp.min(settings.max_delay_ms)),
        0.2,
    )
}

/// Spread a base delay by ±`spread` (a fraction of the base)
pub fn jittered(base: Duration, spread: f64) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0 - spread..1.0 + spread);
    base.mul_f64(factor.max(0.0))
}

/// Execute `f` with retries for retryable errors
///
/// Non-retryable errors and exhausted budgets return the last error.
pub async fn retry_with_backoff<F, Fut, T>(settings: &RetrySettings, mut f: F) -> EvalResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = EvalResult<T>>,
{
    let mut last_error: Option<EvalError> = None;

    for attempt in 0..=settings.max_attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let retryable = e.is_retryable();
                last_error = Some(e);
                if attempt < settings.max_attempts && retryable {
                    sleep(backoff_delay(settings, attempt)).await;
                } else {
                    break;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| EvalError::Internal("retry exhausted without error".to_string())))
}

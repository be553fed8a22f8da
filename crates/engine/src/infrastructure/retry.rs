//! Exponential backoff retry for AI service calls
//!
//! Delays are deterministic (`base * factor^(attempt-1)`, no jitter) and every
//! wait can be cut short by a `CancellationToken`. Cancellation is never
//! retried. This is transport-level retry only; transaction rollbacks are not
//! retried automatically.

use std::fmt;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use regex_lite::Regex;
use tokio_util::sync::CancellationToken;

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay_ms: u64,
    /// Multiplier applied per further attempt (minimum 1.0)
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 600,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            ..Self::default()
        }
    }

    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self::new(1, 0)
    }

    /// Wait after the failed `attempt` (1-based) before trying again.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0);
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.base_delay_ms as f64 * factor.powi(exponent);
        Duration::from_millis(millis.min(u64::MAX as f64) as u64)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: fmt::Display + fmt::Debug> {
    #[error("Retry aborted")]
    Aborted,

    /// The last error seen, either non-retryable or after the final attempt
    #[error("Failed after {attempts} attempt(s): {error}")]
    Failed { attempts: u32, error: E },
}

impl<E: fmt::Display + fmt::Debug> RetryError<E> {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Aborted => None,
            Self::Failed { error, .. } => Some(error),
        }
    }
}

static STATUS_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(429|408|5\d\d)\b").expect("valid regex"));

const RETRYABLE_PHRASES: [&str; 9] = [
    "rate limit",
    "timeout",
    "timed out",
    "network",
    "econnreset",
    "econnrefused",
    "temporarily unavailable",
    "service unavailable",
    "gateway",
];

fn is_abort_like(message: &str) -> bool {
    message.contains("abort") || message.contains("cancel")
}

/// Classify an error message: rate limits, timeouts, 5xx and network resets retry.
pub fn is_retryable_error(message: &str) -> bool {
    let message = message.to_lowercase();
    if message.is_empty() || is_abort_like(&message) {
        return false;
    }
    STATUS_CODE_RE.is_match(&message)
        || RETRYABLE_PHRASES
            .iter()
            .any(|phrase| message.contains(phrase))
}

/// Retry `op` with the default message classifier.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op: F,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display + fmt::Debug,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_with_backoff_if(policy, cancel, |error: &E, _| is_retryable_error(&error.to_string()), op).await
}

/// Retry `op` while `should_retry(error, attempt)` allows it.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_with_backoff_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    should_retry: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display + fmt::Debug,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E, u32) -> bool,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Aborted);
        }

        let error = match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Service call succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if attempt >= max_attempts || !should_retry(&error, attempt) {
            tracing::error!(
                attempt,
                max_attempts,
                error = %error,
                "Service call failed, giving up"
            );
            return Err(RetryError::Failed {
                attempts: attempt,
                error,
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        tracing::warn!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Service call failed, retrying..."
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Aborted),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

//! Retry utilities with exponential backoff and jitter.
//!
//! This module provides the retry mechanism the reconciliation engine uses
//! for infrastructure calls that may fail transiently. It uses exponential
//! backoff with jitter to avoid thundering herd problems, stops immediately
//! on errors marked fatal, and honors cooperative cancellation between
//! attempts (never preempting an attempt mid-step).
//!
//! # Example
//!
//! ```ignore
//! use pylon::retry::{retry_with_backoff, RetryConfig};
//!
//! let result = retry_with_backoff(
//!     &RetryConfig::default(),
//!     "apply_cluster",
//!     &cancel,
//!     || async { backend.apply_cluster(&name, &spec).await },
//! ).await;
//! ```

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Classifies an error as transient (worth retrying) or fatal
///
/// Fatal errors short-circuit the retry loop immediately; retrying them
/// would only repeat the same failure against the backend.
pub trait Transient {
    /// Returns true if a later attempt could plausibly succeed
    fn is_transient(&self) -> bool;
}

/// Why a retried operation ultimately failed
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// All attempts failed with transient errors; carries the last one
    Exhausted(E),
    /// An attempt failed with an unretryable error
    Fatal(E),
    /// Cancellation was requested between attempts
    Cancelled,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted(e) => write!(f, "retries exhausted: {e}"),
            Self::Fatal(e) => write!(f, "fatal error: {e}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Configuration for operations that may fail transiently
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = unbounded)
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_APPLY_ATTEMPTS,
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
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries transient failures up to `config.max_attempts` total attempts.
/// Fatal errors return immediately without further attempts. Cancellation is
/// checked before each attempt and while sleeping between attempts; an
/// in-flight attempt is never interrupted.
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation_name` - Name for logging purposes
/// * `cancel` - Cooperative cancellation flag
/// * `operation` - The async operation to retry
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        if cancel.is_cancelled() {
            warn!(operation = %operation_name, "Cancellation requested, abandoning retries");
            return Err(RetryError::Cancelled);
        }

        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed with unretryable error"
                );
                return Err(RetryError::Fatal(e));
            }
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(RetryError::Exhausted(e));
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(jittered_delay) => {}
                }

                // Exponential backoff, capped at max_delay
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

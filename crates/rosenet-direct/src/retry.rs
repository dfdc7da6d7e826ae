//! Retry with exponential backoff and jitter.
//!
//! Sends are retried with `initial_delay * exponent^attempt`, capped at
//! `max_delay_ms` and stretched by a random jitter. Two presets are derived
//! from [`DirectConfig`]: the normal policy and the fail-fast policy used
//! when the outbound pipeline is under load.

use rand::Rng;
use rosenet_types::DirectConfig;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Base of the exponential growth.
    pub exponent: f64,
    /// Jitter factor (0.0 = no jitter, 1.0 = up to double the delay).
    ///
    /// The actual sleep is `delay * (1 + random_fraction * jitter)`, where
    /// `random_fraction` is in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::direct(&DirectConfig::default())
    }
}

impl RetryConfig {
    /// The normal send policy.
    pub fn direct(config: &DirectConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.saturating_add(1),
            initial_delay_ms: config.retry_initial_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
            exponent: config.retry_exponent,
            jitter: config.retry_jitter,
        }
    }

    /// Fewer attempts and a longer first delay, used under outbound load.
    pub fn fail_fast(config: &DirectConfig) -> Self {
        Self {
            max_attempts: config.fail_fast_max_retry_attempts.saturating_add(1),
            initial_delay_ms: config.fail_fast_retry_initial_delay_ms,
            ..Self::direct(config)
        }
    }
}

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success {
        result: T,
        /// Total number of attempts made (1 = first try succeeded).
        attempts: u32,
    },
    /// All attempts failed, or the error was not retryable.
    Exhausted { last_error: E, attempts: u32 },
}

// ---------------------------------------------------------------------------
// Backoff computation
// ---------------------------------------------------------------------------

/// Compute the delay before retry number `attempt + 1` (0-indexed).
///
/// Formula: `min(initial * exponent^attempt, max) * (1 + random * jitter)`,
/// clamped to `max_delay_ms`.
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let exponent = attempt.min(64) as i32;
    let base = config.initial_delay_ms as f64 * config.exponent.powi(exponent);
    let capped = base.min(config.max_delay_ms as f64);

    if config.jitter <= 0.0 {
        return capped as u64;
    }

    let frac: f64 = rand::thread_rng().gen();
    let with_jitter = capped + capped * frac * config.jitter;
    (with_jitter as u64).min(config.max_delay_ms)
}

// ---------------------------------------------------------------------------
// Core retry function
// ---------------------------------------------------------------------------

/// Execute an async operation with retry.
///
/// `operation` is invoked once per attempt. `should_retry` inspects each
/// error; a non-retryable error ends the loop immediately.
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let max = config.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        let err = match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        attempt = attempt + 1,
                        "retry succeeded after {} previous failures", attempt
                    );
                }
                return RetryOutcome::Success {
                    result,
                    attempts: attempt + 1,
                };
            }
            Err(err) => err,
        };

        let attempts = attempt + 1;
        if !should_retry(&err) {
            debug!(attempt = attempts, error = %err, "error is not retryable, giving up");
            return RetryOutcome::Exhausted {
                last_error: err,
                attempts,
            };
        }
        if attempts >= max {
            warn!(
                attempt = attempts,
                max_attempts = max,
                error = %err,
                "all retry attempts exhausted"
            );
            return RetryOutcome::Exhausted {
                last_error: err,
                attempts,
            };
        }

        let delay_ms = compute_backoff(config, attempt);
        debug!(attempt = attempts, delay_ms, error = %err, "retrying after error");
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        attempt += 1;
    }
}

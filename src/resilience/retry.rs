// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! The delay before attempt `n + 1` is `initial_delay * factor^(n - 1)`,
//! capped at `max_delay`. [`retry_if`] only retries errors the caller
//! classifies as transient; anything else is returned straight away.
//!
//! # Example
//!
//! ```
//! use replica_sync::RetryConfig;
//! use std::time::Duration;
//!
//! let query = RetryConfig::query();
//! assert_eq!(query.max_retries, 3);
//! assert_eq!(query.delay_for_attempt(1), Duration::from_millis(100));
//! assert_eq!(query.delay_for_attempt(2), Duration::from_millis(200));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for operation retry behavior.
///
/// `max_retries` is the total number of attempts, so `1` means "no retry".
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial connections made at startup.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Quick retry for individual queries and cache round trips.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Single attempt, no backoff.
    #[must_use]
    pub fn once() -> Self {
        Self {
            max_retries: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay to wait after the given failed attempt (1-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        self.initial_delay
            .mul_f64(self.factor.powi(exponent))
            .min(self.max_delay)
    }
}

/// Retry every error until attempts run out.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, config, |_| true, operation).await
}

/// Retry only the errors for which `is_retriable` returns true.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    is_retriable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max = config.max_retries.max(1);
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !is_retriable(&err) {
                    warn!("Operation '{}' failed with non-retriable error: {}", operation_name, err);
                    return Err(err);
                }
                if attempts >= max {
                    return Err(err);
                }

                let delay = config.delay_for_attempt(attempts);
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, max, err, delay
                );
                sleep(delay).await;
            }
        }
    }
}

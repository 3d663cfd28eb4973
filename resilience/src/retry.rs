//! Retry with backoff for transient transport failures.
//!
//! Transports drop connections and brokers restart; the retry policy
//! papers over the blips without hammering a struggling endpoint. Delay
//! grows exponentially (or stays fixed when exponential backoff is off)
//! and is capped at `max_delay`.
//!
//! # Example
//!
//! ```rust
//! use courier_resilience::retry::{retry_with_backoff, RetryPolicy};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), courier_core::error::BrokerError> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .build();
//!
//! let value = retry_with_backoff(policy, || async {
//!     Ok::<_, courier_core::error::BrokerError>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;
use tokio::time::sleep;

use courier_core::config::RetryOptions;
use courier_core::error::BrokerError;

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the initial call.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the backoff delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt when backoff is exponential.
    pub multiplier: f64,
    /// Exponential backoff (true) or fixed delay (false).
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            exponential: true,
        }
    }
}

impl RetryPolicy {
    /// Create a policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
            exponential: None,
        }
    }

    /// Build a policy from the configuration bundle.
    #[must_use]
    pub fn from_options(options: &RetryOptions) -> Self {
        Self {
            max_attempts: options.max_attempts,
            initial_delay: options.initial_delay(),
            max_delay: options.max_delay(),
            multiplier: options.backoff_multiplier,
            exponential: options.use_exponential_backoff,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.exponential || attempt == 0 {
            return self.initial_delay;
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay = Duration::from_millis(delay_ms as u64);
        delay.min(self.max_delay)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    exponential: Option<bool>,
}

impl RetryPolicyBuilder {
    /// Set maximum retry attempts.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set the cap on the backoff delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Use a fixed delay instead of exponential backoff.
    #[must_use]
    pub const fn fixed_delay(mut self) -> Self {
        self.exponential = Some(false);
        self
    }

    /// Build the policy.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            exponential: self.exponential.unwrap_or(defaults.exponential),
        }
    }
}

/// Retry `operation` with backoff until it succeeds or attempts run out.
///
/// # Errors
///
/// Returns the last error once `max_attempts` retries are exhausted.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: RetryPolicy,
    operation: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, BrokerError>>,
{
    retry_with_predicate(policy, operation, |_| true).await
}

/// Retry `operation`, but only for errors `is_retryable` accepts.
///
/// Combine with [`BrokerError::is_transient`] to retry connection blips
/// while failing fast on caller mistakes:
///
/// ```rust,ignore
/// retry_with_predicate(policy, op, BrokerError::is_transient).await
/// ```
///
/// # Errors
///
/// Returns the error unchanged when it is not retryable, or the last
/// error once retries are exhausted.
pub async fn retry_with_predicate<F, Fut, T, P>(
    policy: RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, BrokerError>>,
    P: Fn(&BrokerError) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            },
            Err(attempt_error) => {
                if !is_retryable(&attempt_error) {
                    tracing::warn!(
                        error = %attempt_error,
                        "Error is not retryable, failing immediately"
                    );
                    return Err(attempt_error);
                }

                if attempt >= policy.max_attempts {
                    tracing::error!(
                        attempt,
                        error = %attempt_error,
                        "Operation failed after max retries"
                    );
                    return Err(attempt_error);
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %attempt_error,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            },
        }
    }
}

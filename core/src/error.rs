//! Error taxonomy shared by every broker, decorator and transport.
//!
//! All fallible operations in the workspace surface a [`BrokerError`]. The
//! variants map one-to-one onto the middleware's propagation policy:
//! caller mistakes (`InvalidArgument`, `InvalidOptions`, `Disposed`) fail
//! immediately, transient transport conditions (`TransportUnavailable`,
//! `Timeout`) go through the retry policy, and pre-flight rejections
//! (`CircuitOpen`, `RateLimited`, `BulkheadFull`) carry the data a caller
//! needs to back off.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Errors produced by brokers, decorators and transport adapters.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Null or invalid caller input. Never retried.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Eager configuration validation failure. Fatal at construction.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// The transport connection is lost or unreachable. Retried under the
    /// retry policy.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Rejected pre-flight by an open circuit breaker.
    #[error("Circuit breaker '{name}' is open, retry after {retry_after:?}")]
    CircuitOpen {
        /// Name of the breaker that rejected the call
        name: String,
        /// How long until the breaker will probe again
        retry_after: Duration,
    },

    /// Rejected by the rate limiter.
    #[error("Rate limited for key '{key}', retry after {retry_after:?}")]
    RateLimited {
        /// The rate-limit key (tenant or global) that was throttled
        key: String,
        /// How long until a token will be available
        retry_after: Duration,
        /// When the current window resets
        reset_at: DateTime<Utc>,
    },

    /// Rejected because both the concurrency cap and the wait queue of a
    /// bulkhead are exhausted.
    #[error("Bulkhead '{0}' is full")]
    BulkheadFull(String),

    /// Failed to serialize an outgoing message.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The message body could not be decoded. Repeated failures move the
    /// message into quarantine.
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// A user handler returned an error. Caught at the dispatch boundary,
    /// logged, and never propagated to the transport loop.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// A bounded wait was exceeded.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Cooperative cancellation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation attempted after `shutdown`.
    #[error("Broker is disposed")]
    Disposed,

    /// The adapter reported a specific publish error. Surfaced to the
    /// caller as-is.
    #[error("Publish failed: {0}")]
    PublishFailure(String),

    /// Bearer token validation failed; the message is rejected before any
    /// handler runs.
    #[error("Authentication failed: {0}")]
    Authentication(String),
}

impl BrokerError {
    /// Whether the retry policy should re-attempt an operation that failed
    /// with this error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransportUnavailable(_) | Self::Timeout(_) | Self::PublishFailure(_)
        )
    }

    /// How long the caller should wait before retrying, when the error
    /// carries that information.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } | Self::RateLimited { retry_after, .. } => {
                Some(*retry_after)
            },
            _ => None,
        }
    }
}

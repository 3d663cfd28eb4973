//! Resilience primitives for the Courier messaging middleware.
//!
//! Four protection mechanisms plus the retry policy, all configured from
//! [`courier_core::config`] bundles and all usable on their own:
//!
//! - [`circuit_breaker::CircuitBreaker`] — trips open on failure
//!   patterns, probes recovery through a half-open state
//! - [`rate_limiter::RateLimiter`] — token bucket, sliding window or
//!   fixed window, keyed per tenant
//! - [`bulkhead::Bulkhead`] — bounded concurrency plus a bounded wait
//!   queue per logical partition
//! - [`backpressure::BackpressureController`] — latency/queue-depth
//!   monitor with a hysteretic throttle signal
//! - [`retry`] — backoff helpers for transient transport errors
//!
//! The broker decorators in `courier-middleware` wrap these around the
//! publish and subscribe paths; nothing here depends on a broker, so the
//! primitives also guard plain function calls.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backpressure;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use backpressure::{BackpressureController, BackpressureEvent, BackpressureTransition};
pub use bulkhead::{Bulkhead, BulkheadMetrics};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitState};
pub use rate_limiter::{RateLimitDecision, RateLimiter, RateLimiterCounters};
pub use retry::{retry_with_backoff, retry_with_predicate, RetryPolicy};

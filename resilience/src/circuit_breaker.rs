//! Circuit breaker with a sliding metrics window.
//!
//! Protects any async callable from a failing downstream by rejecting
//! calls pre-flight once failure patterns emerge.
//!
//! ## States
//!
//! ```text
//! Closed (normal) ──[threshold breached]──────> Open (rejecting)
//!                                                     │
//!                                                     │ [timeout elapsed]
//!                                                     ▼
//!                                              HalfOpen (probing)
//!                                                     │
//!                      ┌──────────────────────────────┴───────────────┐
//!                      │                                              │
//!           [success >= threshold]                          [any failure]
//!                      │                                              │
//!                      ▼                                              ▼
//!                   Closed                                          Open
//! ```
//!
//! The circuit opens when any of these become true after a call:
//!
//! - consecutive failures reach `failure_threshold`
//! - the windowed failure rate reaches `failure_rate_threshold` with at
//!   least `minimum_throughput` calls in the window
//! - the windowed slow-call rate reaches `slow_call_rate_threshold`
//!   (a call is slow at `slow_call_duration_threshold` or beyond)
//!
//! State reads are lock-free; metrics updates and transitions are
//! serialized behind one lock.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tracing::{info, warn};

use courier_core::config::CircuitBreakerOptions;
use courier_core::error::BrokerError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls execute.
    Closed,
    /// Failing, calls rejected until the timeout elapses.
    Open,
    /// Probing recovery, calls pass through.
    HalfOpen,
}

impl CircuitState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// One call outcome in the sliding window.
struct CallSample {
    at: Instant,
    success: bool,
    duration: Duration,
}

/// Serialized metrics and transition state.
struct BreakerInner {
    samples: VecDeque<CallSample>,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    half_open_since: Option<Instant>,
}

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    /// Current state.
    pub state: CircuitState,
    /// Calls currently in the sliding window.
    pub window_calls: usize,
    /// Failed calls in the window.
    pub window_failures: usize,
    /// Slow calls in the window.
    pub window_slow_calls: usize,
    /// Current consecutive failure streak.
    pub consecutive_failures: u32,
}

/// Callback invoked on every state transition: `(from, to)`.
pub type StateChangedCallback = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

/// Callback invoked when a call is rejected pre-flight. The argument is
/// the breaker name.
pub type RejectedCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Circuit breaker protecting an async callable.
pub struct CircuitBreaker {
    name: String,
    options: CircuitBreakerOptions,
    state: AtomicU8,
    inner: Mutex<BreakerInner>,
    on_state_changed: Mutex<Option<StateChangedCallback>>,
    on_rejected: Mutex<Option<RejectedCallback>>,
}

impl CircuitBreaker {
    /// Create a breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, options: CircuitBreakerOptions) -> Self {
        Self {
            name: name.into(),
            options,
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            inner: Mutex::new(BreakerInner {
                samples: VecDeque::new(),
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                half_open_since: None,
            }),
            on_state_changed: Mutex::new(None),
            on_rejected: Mutex::new(None),
        }
    }

    /// Breaker name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. Lock-free.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Register the state-transition callback.
    pub async fn on_state_changed(&self, callback: StateChangedCallback) {
        *self.on_state_changed.lock().await = Some(callback);
    }

    /// Register the rejection callback.
    pub async fn on_rejected(&self, callback: RejectedCallback) {
        *self.on_rejected.lock().await = Some(callback);
    }

    /// Execute `operation` under the breaker.
    ///
    /// When the breaker is disabled the call passes straight through and
    /// no state changes occur.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CircuitOpen`] without invoking the
    /// operation while the circuit is open; otherwise surfaces the
    /// operation's own error after recording it.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, BrokerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, BrokerError>>,
    {
        if !self.options.enabled {
            return operation().await;
        }

        self.allow_request().await?;

        let started = Instant::now();
        match operation().await {
            Ok(value) => {
                self.record_success(started.elapsed()).await;
                Ok(value)
            },
            Err(operation_error) => {
                self.record_failure(started.elapsed()).await;
                Err(operation_error)
            },
        }
    }

    /// Check whether a call may proceed, handling the Open→HalfOpen
    /// transition once the open timeout has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CircuitOpen`] while the circuit is open.
    pub async fn allow_request(&self) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::ZERO, |at| at.elapsed());
                if elapsed >= self.options.timeout() {
                    inner.half_open_successes = 0;
                    inner.half_open_since = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::HalfOpen).await;
                    Ok(())
                } else {
                    let retry_after = self.options.timeout().saturating_sub(elapsed);
                    drop(inner);
                    if let Some(callback) = self.on_rejected.lock().await.as_ref() {
                        callback(&self.name);
                    }
                    Err(BrokerError::CircuitOpen {
                        name: self.name.clone(),
                        retry_after,
                    })
                }
            },
        }
    }

    /// Record a successful call.
    pub async fn record_success(&self, duration: Duration) {
        let mut inner = self.inner.lock().await;
        self.push_sample(&mut inner, true, duration);
        match self.state() {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                // A flood of slow successes still opens the circuit.
                self.evaluate_closed(&mut inner).await;
            },
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                let dwelled = inner
                    .half_open_since
                    .is_none_or(|since| since.elapsed() >= self.options.half_open_duration());
                if inner.half_open_successes >= self.options.success_threshold && dwelled {
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    inner.samples.clear();
                    self.transition(&mut inner, CircuitState::Closed).await;
                }
            },
            CircuitState::Open => {},
        }
    }

    /// Record a failed call.
    pub async fn record_failure(&self, duration: Duration) {
        let mut inner = self.inner.lock().await;
        self.push_sample(&mut inner, false, duration);
        match self.state() {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                self.evaluate_closed(&mut inner).await;
            },
            CircuitState::HalfOpen => {
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
                self.transition(&mut inner, CircuitState::Open).await;
            },
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            },
        }
    }

    /// Force the breaker closed and clear all metrics.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.samples.clear();
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.opened_at = None;
        inner.half_open_since = None;
        if self.state() != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed).await;
        }
    }

    /// Force the breaker open (manual isolation).
    pub async fn isolate(&self) {
        let mut inner = self.inner.lock().await;
        inner.opened_at = Some(Instant::now());
        if self.state() != CircuitState::Open {
            self.transition(&mut inner, CircuitState::Open).await;
        }
    }

    /// Current metrics snapshot.
    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.inner.lock().await;
        Self::prune(&mut inner, self.options.window());
        CircuitBreakerMetrics {
            state: self.state(),
            window_calls: inner.samples.len(),
            window_failures: inner.samples.iter().filter(|s| !s.success).count(),
            window_slow_calls: inner
                .samples
                .iter()
                .filter(|s| s.duration >= self.options.slow_call_duration_threshold())
                .count(),
            consecutive_failures: inner.consecutive_failures,
        }
    }

    fn push_sample(&self, inner: &mut BreakerInner, success: bool, duration: Duration) {
        inner.samples.push_back(CallSample {
            at: Instant::now(),
            success,
            duration,
        });
        Self::prune(inner, self.options.window());
    }

    fn prune(inner: &mut BreakerInner, window: Duration) {
        let now = Instant::now();
        while inner
            .samples
            .front()
            .is_some_and(|s| now.duration_since(s.at) > window)
        {
            inner.samples.pop_front();
        }
    }

    /// Evaluate the open conditions while Closed; transitions if breached.
    async fn evaluate_closed(&self, inner: &mut BreakerInner) {
        if inner.consecutive_failures >= self.options.failure_threshold {
            self.open(inner, "consecutive failures").await;
            return;
        }

        let total = inner.samples.len();
        if total < self.options.minimum_throughput as usize {
            return;
        }

        #[allow(clippy::cast_precision_loss)]
        let failure_rate =
            inner.samples.iter().filter(|s| !s.success).count() as f64 / total as f64;
        if failure_rate >= self.options.failure_rate_threshold {
            self.open(inner, "failure rate").await;
            return;
        }

        #[allow(clippy::cast_precision_loss)]
        let slow_rate = inner
            .samples
            .iter()
            .filter(|s| s.duration >= self.options.slow_call_duration_threshold())
            .count() as f64
            / total as f64;
        if slow_rate >= self.options.slow_call_rate_threshold {
            self.open(inner, "slow-call rate").await;
        }
    }

    async fn open(&self, inner: &mut BreakerInner, reason: &str) {
        warn!(
            breaker = %self.name,
            reason,
            consecutive_failures = inner.consecutive_failures,
            "Circuit breaker opening"
        );
        inner.opened_at = Some(Instant::now());
        self.transition(inner, CircuitState::Open).await;
    }

    async fn transition(&self, _inner: &mut BreakerInner, to: CircuitState) {
        let from = self.state();
        if from == to {
            return;
        }
        self.state.store(to.as_u8(), Ordering::Release);
        info!(breaker = %self.name, ?from, ?to, "Circuit breaker transition");
        if let Some(callback) = self.on_state_changed.lock().await.as_ref() {
            callback(from, to);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn options(failure_threshold: u32, timeout_ms: u64) -> CircuitBreakerOptions {
        CircuitBreakerOptions {
            enabled: true,
            failure_threshold,
            success_threshold: 2,
            timeout_ms,
            half_open_duration_ms: 0,
            minimum_throughput: 100,
            failure_rate_threshold: 1.0,
            slow_call_rate_threshold: 1.0,
            slow_call_duration_threshold_ms: 60_000,
            window_ms: 60_000,
        }
    }

    async fn failing(breaker: &CircuitBreaker) -> Result<(), BrokerError> {
        breaker
            .execute(|| async { Err::<(), _>(BrokerError::PublishFailure("boom".into())) })
            .await
            .map(|()| ())
    }

    #[tokio::test]
    async fn breaker_starts_closed() {
        let breaker = CircuitBreaker::new("test", options(3, 30_000));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request().await.is_ok());
    }

    #[tokio::test]
    async fn consecutive_failures_open_the_circuit() {
        let breaker = CircuitBreaker::new("test", options(2, 30_000));

        let _first = failing(&breaker).await;
        let _second = failing(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Rejected without invoking the thunk.
        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked_clone = Arc::clone(&invoked);
        let result = breaker
            .execute(|| {
                let invoked = Arc::clone(&invoked_clone);
                async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BrokerError>(())
                }
            })
            .await;
        assert!(matches!(result, Err(BrokerError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn open_transitions_to_half_open_after_timeout() {
        let breaker = CircuitBreaker::new("test", options(2, 100));

        let _first = failing(&breaker).await;
        let _second = failing(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let result = breaker
            .execute(|| async { Ok::<_, BrokerError>("ok") })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_success_threshold_closes() {
        let breaker = CircuitBreaker::new("test", options(2, 50));

        let _first = failing(&breaker).await;
        let _second = failing(&breaker).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        for _ in 0..2 {
            breaker
                .execute(|| async { Ok::<_, BrokerError>(()) })
                .await
                .unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", options(2, 50));

        let _first = failing(&breaker).await;
        let _second = failing(&breaker).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        breaker.allow_request().await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let _reopened = failing(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn failure_rate_opens_with_minimum_throughput() {
        let mut opts = options(100, 30_000);
        opts.minimum_throughput = 4;
        opts.failure_rate_threshold = 0.5;
        let breaker = CircuitBreaker::new("test", opts);

        breaker
            .execute(|| async { Ok::<_, BrokerError>(()) })
            .await
            .unwrap();
        breaker
            .execute(|| async { Ok::<_, BrokerError>(()) })
            .await
            .unwrap();
        let _third = failing(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _fourth = failing(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn slow_call_rate_opens() {
        let mut opts = options(100, 30_000);
        opts.minimum_throughput = 2;
        opts.slow_call_rate_threshold = 0.5;
        opts.slow_call_duration_threshold_ms = 1;
        let breaker = CircuitBreaker::new("test", opts);

        for _ in 0..2 {
            let _slow = breaker
                .execute(|| async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, BrokerError>(())
                })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn reset_forces_closed_and_clears_metrics() {
        let breaker = CircuitBreaker::new("test", options(1, 30_000));
        let _failure = failing(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset().await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        let metrics = breaker.metrics().await;
        assert_eq!(metrics.window_calls, 0);
        assert_eq!(metrics.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn isolate_forces_open() {
        let breaker = CircuitBreaker::new("test", options(5, 30_000));
        breaker.isolate().await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.allow_request().await.is_err());
    }

    #[tokio::test]
    async fn disabled_breaker_passes_everything_through() {
        let mut opts = options(1, 30_000);
        opts.enabled = false;
        let breaker = CircuitBreaker::new("test", opts);

        for _ in 0..5 {
            let _ignored = failing(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(
            breaker
                .execute(|| async { Ok::<_, BrokerError>(()) })
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn callbacks_fire_on_transition_and_rejection() {
        let breaker = CircuitBreaker::new("test", options(1, 30_000));
        let transitions = Arc::new(AtomicUsize::new(0));
        let rejections = Arc::new(AtomicUsize::new(0));

        let transitions_clone = Arc::clone(&transitions);
        breaker
            .on_state_changed(Arc::new(move |_, _| {
                transitions_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await;
        let rejections_clone = Arc::clone(&rejections);
        breaker
            .on_rejected(Arc::new(move |_| {
                rejections_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let _failure = failing(&breaker).await;
        assert_eq!(transitions.load(Ordering::SeqCst), 1);

        let _rejected = breaker.allow_request().await;
        assert_eq!(rejections.load(Ordering::SeqCst), 1);
    }
}

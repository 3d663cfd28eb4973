//! Backpressure controller with hysteresis.
//!
//! Watches two signals: a sliding window of recent processing latencies
//! and an instantaneous queue depth. Throttling activates when either
//! signal crosses its threshold and stays active until **both** fall
//! below their recovery thresholds, so the signal does not flap around a
//! single boundary. Every transition raises an event and activations are
//! counted.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use courier_core::config::BackpressureOptions;

/// Direction of a throttle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureTransition {
    /// Throttling switched on.
    Activated,
    /// Throttling switched off.
    Deactivated,
}

/// Event raised on every throttle transition.
#[derive(Debug, Clone, PartialEq)]
pub struct BackpressureEvent {
    /// Which way the controller transitioned.
    pub transition: BackpressureTransition,
    /// Average latency over the sample window at transition time.
    pub average_latency: Duration,
    /// Queue depth at transition time.
    pub queue_depth: usize,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

/// Callback invoked with every [`BackpressureEvent`].
pub type BackpressureCallback = Arc<dyn Fn(BackpressureEvent) + Send + Sync>;

/// Latency and queue-depth monitor emitting a hysteretic throttle signal.
pub struct BackpressureController {
    options: BackpressureOptions,
    samples: Mutex<VecDeque<Duration>>,
    queue_depth: AtomicUsize,
    throttling: AtomicBool,
    activations: AtomicU64,
    on_transition: Mutex<Option<BackpressureCallback>>,
}

impl BackpressureController {
    /// Create a controller.
    #[must_use]
    pub fn new(options: BackpressureOptions) -> Self {
        Self {
            options,
            samples: Mutex::new(VecDeque::new()),
            queue_depth: AtomicUsize::new(0),
            throttling: AtomicBool::new(false),
            activations: AtomicU64::new(0),
            on_transition: Mutex::new(None),
        }
    }

    /// Register the transition callback.
    pub async fn on_transition(&self, callback: BackpressureCallback) {
        *self.on_transition.lock().await = Some(callback);
    }

    /// Record one processing duration and re-evaluate the signal.
    pub async fn record_sample(&self, duration: Duration) {
        if !self.options.enabled {
            return;
        }
        {
            let mut samples = self.samples.lock().await;
            samples.push_back(duration);
            while samples.len() > self.options.sample_size {
                samples.pop_front();
            }
        }
        self.evaluate().await;
    }

    /// Update the instantaneous queue depth and re-evaluate the signal.
    pub async fn set_queue_depth(&self, depth: usize) {
        if !self.options.enabled {
            return;
        }
        self.queue_depth.store(depth, Ordering::Release);
        self.evaluate().await;
    }

    /// Whether callers should throttle right now. Lock-free.
    #[must_use]
    pub fn should_throttle(&self) -> bool {
        self.throttling.load(Ordering::Acquire)
    }

    /// How many times throttling has activated.
    #[must_use]
    pub fn activation_count(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }

    /// Average latency over the current sample window.
    pub async fn average_latency(&self) -> Duration {
        let samples = self.samples.lock().await;
        average(&samples)
    }

    async fn evaluate(&self) {
        let average_latency = {
            let samples = self.samples.lock().await;
            average(&samples)
        };
        let depth = self.queue_depth.load(Ordering::Acquire);
        let throttling = self.throttling.load(Ordering::Acquire);

        if throttling {
            // Hysteresis: every signal must fall below its recovery
            // threshold before throttling releases.
            let latency_recovered = average_latency < self.options.recovery_latency_threshold();
            let depth_recovered = depth < self.options.recovery_queue_depth_threshold;
            if latency_recovered && depth_recovered {
                self.throttling.store(false, Ordering::Release);
                info!(
                    average_latency_ms = average_latency.as_millis() as u64,
                    queue_depth = depth,
                    "Backpressure deactivated"
                );
                self.raise(BackpressureTransition::Deactivated, average_latency, depth)
                    .await;
            }
        } else {
            let latency_breached = average_latency > self.options.latency_threshold();
            let depth_breached = depth > self.options.queue_depth_threshold;
            if latency_breached || depth_breached {
                self.throttling.store(true, Ordering::Release);
                self.activations.fetch_add(1, Ordering::Relaxed);
                warn!(
                    average_latency_ms = average_latency.as_millis() as u64,
                    queue_depth = depth,
                    "Backpressure activated"
                );
                self.raise(BackpressureTransition::Activated, average_latency, depth)
                    .await;
            }
        }
    }

    async fn raise(
        &self,
        transition: BackpressureTransition,
        average_latency: Duration,
        queue_depth: usize,
    ) {
        if let Some(callback) = self.on_transition.lock().await.as_ref() {
            callback(BackpressureEvent {
                transition,
                average_latency,
                queue_depth,
                at: Utc::now(),
            });
        }
    }
}

fn average(samples: &VecDeque<Duration>) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    let total: Duration = samples.iter().sum();
    total / u32::try_from(samples.len()).unwrap_or(u32::MAX)
}

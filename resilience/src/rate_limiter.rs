//! Rate limiter with pluggable accounting strategies.
//!
//! One limiter instance manages a bucket per key, so multi-tenant
//! configurations get isolated budgets by keying requests on the tenant
//! identity. Three strategies are available:
//!
//! - **Token bucket**: capacity `burst`, refilled at `rate_per_second`;
//!   one token per request.
//! - **Sliding window**: count of request timestamps within the trailing
//!   second.
//! - **Fixed window**: count within the current calendar second.
//!
//! A disabled limiter always allows and keeps no state.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::warn;

use courier_core::config::{RateLimitOptions, RateLimitStrategy};

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// The request may proceed.
    Allow {
        /// Requests remaining in the current window or bucket.
        remaining: u64,
        /// When the window or bucket fully resets.
        reset_at: DateTime<Utc>,
    },
    /// The request is rejected.
    Reject {
        /// How long until a slot frees up.
        retry_after: Duration,
        /// When the window or bucket fully resets.
        reset_at: DateTime<Utc>,
    },
}

impl RateLimitDecision {
    /// Whether this decision allows the request.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Per-key accounting state.
enum BucketState {
    TokenBucket {
        tokens: f64,
        last_refill: Instant,
    },
    SlidingWindow {
        timestamps: VecDeque<Instant>,
    },
    FixedWindow {
        window_start_secs: u64,
        count: u64,
    },
}

/// Aggregate counters across all keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimiterCounters {
    /// Checks performed.
    pub total: u64,
    /// Checks that allowed the request.
    pub allowed: u64,
    /// Checks that rejected the request.
    pub rejected: u64,
}

/// Keyed rate limiter.
pub struct RateLimiter {
    options: RateLimitOptions,
    buckets: Mutex<HashMap<String, BucketState>>,
    total: AtomicU64,
    allowed: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter from options.
    #[must_use]
    pub fn new(options: RateLimitOptions) -> Self {
        Self {
            options,
            buckets: Mutex::new(HashMap::new()),
            total: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Check whether a request under `key` may proceed, consuming one
    /// slot if so.
    pub async fn check(&self, key: &str) -> RateLimitDecision {
        if !self.options.enabled {
            return RateLimitDecision::Allow {
                remaining: u64::from(self.options.burst),
                reset_at: Utc::now(),
            };
        }

        self.total.fetch_add(1, Ordering::Relaxed);
        let decision = {
            let mut buckets = self.buckets.lock().await;
            let bucket = buckets
                .entry(key.to_string())
                .or_insert_with(|| self.new_bucket());
            self.check_bucket(bucket)
        };

        match &decision {
            RateLimitDecision::Allow { .. } => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
            },
            RateLimitDecision::Reject { retry_after, .. } => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(key, retry_after_ms = retry_after.as_millis() as u64, "Rate limited");
            },
        }
        decision
    }

    /// Aggregate counters.
    #[must_use]
    pub fn counters(&self) -> RateLimiterCounters {
        RateLimiterCounters {
            total: self.total.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Number of live per-key buckets.
    pub async fn bucket_count(&self) -> usize {
        self.buckets.lock().await.len()
    }

    fn new_bucket(&self) -> BucketState {
        match self.options.strategy {
            RateLimitStrategy::TokenBucket => BucketState::TokenBucket {
                tokens: f64::from(self.options.burst),
                last_refill: Instant::now(),
            },
            RateLimitStrategy::SlidingWindow => BucketState::SlidingWindow {
                timestamps: VecDeque::new(),
            },
            RateLimitStrategy::FixedWindow => BucketState::FixedWindow {
                window_start_secs: epoch_secs(),
                count: 0,
            },
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn check_bucket(&self, bucket: &mut BucketState) -> RateLimitDecision {
        let rate = self.options.rate_per_second;
        match bucket {
            BucketState::TokenBucket {
                tokens,
                last_refill,
            } => {
                let now = Instant::now();
                let refilled = now.duration_since(*last_refill).as_secs_f64() * rate;
                *tokens = (*tokens + refilled).min(f64::from(self.options.burst));
                *last_refill = now;

                let time_to_full = (f64::from(self.options.burst) - *tokens) / rate;
                let reset_at = Utc::now() + chrono::Duration::milliseconds((time_to_full * 1000.0) as i64);
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    RateLimitDecision::Allow {
                        remaining: *tokens as u64,
                        reset_at,
                    }
                } else {
                    let retry_after = Duration::from_secs_f64((1.0 - *tokens) / rate);
                    RateLimitDecision::Reject {
                        retry_after,
                        reset_at,
                    }
                }
            },
            BucketState::SlidingWindow { timestamps } => {
                let now = Instant::now();
                let window = Duration::from_secs(1);
                while timestamps
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    timestamps.pop_front();
                }

                let limit = rate.ceil() as u64;
                let reset_at = timestamps.front().map_or_else(Utc::now, |oldest| {
                    let until_reset = window.saturating_sub(now.duration_since(*oldest));
                    Utc::now() + chrono::Duration::from_std(until_reset).unwrap_or_default()
                });
                if (timestamps.len() as u64) < limit {
                    timestamps.push_back(now);
                    RateLimitDecision::Allow {
                        remaining: limit - timestamps.len() as u64,
                        reset_at,
                    }
                } else {
                    let retry_after = timestamps.front().map_or(window, |oldest| {
                        window.saturating_sub(now.duration_since(*oldest))
                    });
                    RateLimitDecision::Reject {
                        retry_after,
                        reset_at,
                    }
                }
            },
            BucketState::FixedWindow {
                window_start_secs,
                count,
            } => {
                let now_secs = epoch_secs();
                if now_secs != *window_start_secs {
                    *window_start_secs = now_secs;
                    *count = 0;
                }

                let limit = rate.ceil() as u64;
                let reset_at = Utc
                    .timestamp_opt(i64::try_from(now_secs + 1).unwrap_or(i64::MAX), 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                if *count < limit {
                    *count += 1;
                    RateLimitDecision::Allow {
                        remaining: limit - *count,
                        reset_at,
                    }
                } else {
                    let millis_into_window = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map_or(0, |d| d.subsec_millis());
                    let retry_after =
                        Duration::from_millis(u64::from(1000 - millis_into_window.min(999)));
                    RateLimitDecision::Reject {
                        retry_after,
                        reset_at,
                    }
                }
            },
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn options(strategy: RateLimitStrategy, rate: f64, burst: u32) -> RateLimitOptions {
        RateLimitOptions {
            enabled: true,
            strategy,
            rate_per_second: rate,
            burst,
            per_tenant: true,
            default_key: "global".to_string(),
        }
    }

    #[tokio::test]
    async fn token_bucket_allows_burst_then_rejects() {
        let limiter = RateLimiter::new(options(RateLimitStrategy::TokenBucket, 1.0, 3));

        for _ in 0..3 {
            assert!(limiter.check("k").await.is_allowed());
        }
        let decision = limiter.check("k").await;
        assert!(matches!(decision, RateLimitDecision::Reject { .. }));
        if let RateLimitDecision::Reject { retry_after, .. } = decision {
            assert!(retry_after > Duration::ZERO);
            assert!(retry_after <= Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn token_bucket_refills_over_time() {
        let limiter = RateLimiter::new(options(RateLimitStrategy::TokenBucket, 20.0, 2));

        assert!(limiter.check("k").await.is_allowed());
        assert!(limiter.check("k").await.is_allowed());
        assert!(!limiter.check("k").await.is_allowed());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.check("k").await.is_allowed());
    }

    #[tokio::test]
    async fn keys_have_isolated_buckets() {
        let limiter = RateLimiter::new(options(RateLimitStrategy::TokenBucket, 0.1, 1));

        assert!(limiter.check("tenant-a").await.is_allowed());
        assert!(!limiter.check("tenant-a").await.is_allowed());
        // A different tenant still has its full budget.
        assert!(limiter.check("tenant-b").await.is_allowed());
        assert_eq!(limiter.bucket_count().await, 2);
    }

    #[tokio::test]
    async fn sliding_window_counts_trailing_second() {
        let limiter = RateLimiter::new(options(RateLimitStrategy::SlidingWindow, 2.0, 2));

        assert!(limiter.check("k").await.is_allowed());
        assert!(limiter.check("k").await.is_allowed());
        assert!(!limiter.check("k").await.is_allowed());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(limiter.check("k").await.is_allowed());
    }

    #[tokio::test]
    async fn fixed_window_resets_on_the_second() {
        let limiter = RateLimiter::new(options(RateLimitStrategy::FixedWindow, 2.0, 2));

        assert!(limiter.check("k").await.is_allowed());
        assert!(limiter.check("k").await.is_allowed());
        assert!(!limiter.check("k").await.is_allowed());

        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert!(limiter.check("k").await.is_allowed());
    }

    #[tokio::test]
    async fn disabled_limiter_always_allows() {
        let mut opts = options(RateLimitStrategy::TokenBucket, 0.001, 1);
        opts.enabled = false;
        let limiter = RateLimiter::new(opts);

        for _ in 0..100 {
            assert!(limiter.check("k").await.is_allowed());
        }
        assert_eq!(limiter.counters(), RateLimiterCounters::default());
    }

    #[tokio::test]
    async fn counters_track_outcomes() {
        let limiter = RateLimiter::new(options(RateLimitStrategy::TokenBucket, 0.1, 2));

        let _a = limiter.check("k").await;
        let _b = limiter.check("k").await;
        let _c = limiter.check("k").await;

        let counters = limiter.counters();
        assert_eq!(counters.total, 3);
        assert_eq!(counters.allowed, 2);
        assert_eq!(counters.rejected, 1);
    }
}

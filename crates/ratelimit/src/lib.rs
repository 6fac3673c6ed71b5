//! Per-identity token bucket rate limiting.
//!
//! Each identity gets a bucket holding up to `capacity` tokens that refills
//! continuously at `refill_per_sec`. A message costs one token by default.
//! The limiter never blocks: it answers allow or deny immediately.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    dashmap::{DashMap, mapref::entry::Entry},
    tracing::debug,
};

#[cfg(feature = "metrics")]
use neuron_metrics::{counter, gauge, rate_limit as rl_metrics};

const CLEANUP_EVERY_CALLS: u64 = 512;

/// Bucket shape shared by every identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 5.0,
            refill_per_sec: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: config.capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        // `now` may trail `last_refill` when callers pass their own clock.
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_per_sec).min(config.capacity);
        self.last_refill = self.last_refill.max(now);
    }

    fn try_take(&mut self, cost: f64) -> bool {
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

/// Token buckets keyed by identity.
///
/// Cloning shares the underlying buckets.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Arc<DashMap<String, TokenBucket>>,
    calls_seen: Arc<AtomicU64>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Arc::new(DashMap::new()),
            calls_seen: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Consume `cost` tokens from `identity`'s bucket if it holds enough.
    pub fn try_consume(&self, identity: &str, cost: f64) -> bool {
        self.try_consume_at(identity, cost, Instant::now())
    }

    /// Same as [`RateLimiter::try_consume`] with an explicit clock reading.
    pub fn try_consume_at(&self, identity: &str, cost: f64, now: Instant) -> bool {
        let allowed = match self.buckets.entry(identity.to_string()) {
            Entry::Occupied(mut occupied) => {
                let bucket = occupied.get_mut();
                bucket.refill(&self.config, now);
                bucket.try_take(cost)
            },
            Entry::Vacant(vacant) => {
                let mut bucket = TokenBucket::full(&self.config, now);
                let allowed = bucket.try_take(cost);
                vacant.insert(bucket);
                allowed
            },
        };

        if allowed {
            #[cfg(feature = "metrics")]
            counter!(rl_metrics::ALLOWED_TOTAL).increment(1);
        } else {
            #[cfg(feature = "metrics")]
            counter!(rl_metrics::DENIED_TOTAL).increment(1);
            debug!(identity, cost, "rate limit exceeded");
        }

        self.cleanup_if_needed(now);
        allowed
    }

    /// Forget `identity`'s bucket; its next use starts at full capacity.
    pub fn reset(&self, identity: &str) {
        self.buckets.remove(identity);
        #[cfg(feature = "metrics")]
        gauge!(rl_metrics::BUCKETS).set(self.buckets.len() as f64);
    }

    /// Tokens `identity` would have at `now`, without consuming anything.
    ///
    /// Unknown identities report full capacity.
    pub fn tokens_at(&self, identity: &str, now: Instant) -> f64 {
        self.buckets
            .get(identity)
            .map(|bucket| {
                let mut probe = *bucket;
                probe.refill(&self.config, now);
                probe.tokens
            })
            .unwrap_or(self.config.capacity)
    }

    /// Number of identities with a live bucket.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop buckets idle long enough to be full again; they are
    /// indistinguishable from a freshly created one.
    fn cleanup_if_needed(&self, now: Instant) {
        let seen = self.calls_seen.fetch_add(1, Ordering::Relaxed) + 1;
        if !seen.is_multiple_of(CLEANUP_EVERY_CALLS) {
            return;
        }
        let Some(full_after) = self.time_to_full() else {
            return;
        };
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < full_after);
        #[cfg(feature = "metrics")]
        gauge!(rl_metrics::BUCKETS).set(self.buckets.len() as f64);
    }

    fn time_to_full(&self) -> Option<Duration> {
        if self.config.refill_per_sec <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(self.config.capacity / self.config.refill_per_sec).ok()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn limiter(capacity: f64, refill_per_sec: f64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            capacity,
            refill_per_sec,
        })
    }

    #[rstest]
    #[case(1.0)]
    #[case(5.0)]
    #[case(12.0)]
    fn nth_consumption_succeeds_iff_within_capacity(#[case] capacity: f64) {
        let rl = limiter(capacity, 1.0);
        let now = Instant::now();
        for n in 1..=(capacity as usize + 3) {
            let allowed = rl.try_consume_at("u1", 1.0, now);
            assert_eq!(allowed, (n as f64) <= capacity, "call #{n}");
        }
    }

    #[test]
    fn denial_leaves_tokens_untouched() {
        let rl = limiter(3.0, 1.0);
        let now = Instant::now();
        assert!(rl.try_consume_at("u1", 2.0, now));
        assert!(!rl.try_consume_at("u1", 2.0, now));
        assert_eq!(rl.tokens_at("u1", now), 1.0);
        assert!(rl.try_consume_at("u1", 1.0, now));
    }

    #[test]
    fn refill_is_continuous() {
        let rl = limiter(5.0, 2.0);
        let start = Instant::now();
        for _ in 0..5 {
            assert!(rl.try_consume_at("u1", 1.0, start));
        }
        assert!(!rl.try_consume_at("u1", 1.0, start));

        // 0.25s at 2 tokens/s restores half a token: not enough yet.
        let quarter = start + Duration::from_millis(250);
        assert!(!rl.try_consume_at("u1", 1.0, quarter));
        assert!((rl.tokens_at("u1", quarter) - 0.5).abs() < 1e-9);

        // Another 0.25s completes the token.
        assert!(rl.try_consume_at("u1", 1.0, start + Duration::from_millis(500)));
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let rl = limiter(4.0, 10.0);
        let start = Instant::now();
        assert!(rl.try_consume_at("u1", 1.0, start));

        let much_later = start + Duration::from_secs(3600);
        assert_eq!(rl.tokens_at("u1", much_later), 4.0);
        for _ in 0..4 {
            assert!(rl.try_consume_at("u1", 1.0, much_later));
        }
        assert!(!rl.try_consume_at("u1", 1.0, much_later));
        assert!(rl.tokens_at("u1", much_later) >= 0.0);
    }

    #[test]
    fn identities_are_independent_and_reset_restores_capacity() {
        let rl = limiter(1.0, 0.0);
        let now = Instant::now();
        assert!(rl.try_consume_at("alice", 1.0, now));
        assert!(!rl.try_consume_at("alice", 1.0, now));
        assert!(rl.try_consume_at("bob", 1.0, now));
        assert_eq!(rl.len(), 2);

        rl.reset("alice");
        assert!(rl.try_consume_at("alice", 1.0, now));
    }

    #[test]
    fn earlier_clock_reading_does_not_drain_or_rewind() {
        let rl = limiter(2.0, 1.0);
        let now = Instant::now() + Duration::from_secs(10);
        assert!(rl.try_consume_at("u1", 1.0, now));
        let earlier = now - Duration::from_secs(5);
        assert_eq!(rl.tokens_at("u1", earlier), 1.0);
    }

    #[test]
    fn idle_full_buckets_are_evicted() {
        let rl = limiter(1.0, 1.0);
        let start = Instant::now();
        assert!(rl.try_consume_at("idle", 1.0, start));

        let later = start + Duration::from_secs(5);
        for _ in 0..CLEANUP_EVERY_CALLS {
            rl.try_consume_at("busy", 0.0, later);
        }
        assert_eq!(rl.len(), 1);
        assert_eq!(rl.tokens_at("idle", later), 1.0);
    }
}

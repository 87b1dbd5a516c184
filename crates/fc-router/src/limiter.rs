//! Per-pool rate gate: a token bucket refilled at `rate_limit_per_minute`.
//!
//! Group workers park on the gate for a bounded time instead of bouncing
//! messages straight back to the broker; only when the park deadline lapses
//! does the pointer get NACKed with a short delay. The limiter is replaced
//! in place on config updates, so a parked worker picks up a new or removed
//! limit on its next poll.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::RwLock;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::metrics;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct RateGate {
    pool: String,
    limiter: RwLock<Option<Arc<DirectLimiter>>>,
    limit: RwLock<Option<u32>>,
}

impl RateGate {
    pub fn new(pool: impl Into<String>, rate_limit_per_minute: Option<u32>) -> Self {
        Self {
            pool: pool.into(),
            limiter: RwLock::new(Self::build(rate_limit_per_minute)),
            limit: RwLock::new(rate_limit_per_minute),
        }
    }

    fn build(rate_limit_per_minute: Option<u32>) -> Option<Arc<DirectLimiter>> {
        rate_limit_per_minute
            .and_then(NonZeroU32::new)
            .map(|rpm| Arc::new(RateLimiter::direct(Quota::per_minute(rpm))))
    }

    /// Swap the limiter for a new limit. `None` (or zero) disables limiting.
    pub fn update(&self, rate_limit_per_minute: Option<u32>) {
        let current = *self.limit.read();
        let normalized = rate_limit_per_minute.filter(|rpm| *rpm > 0);
        if current == normalized {
            return;
        }

        *self.limiter.write() = Self::build(normalized);
        *self.limit.write() = normalized;
        info!(
            pool = %self.pool,
            old = ?current,
            new = ?normalized,
            "rate limit updated in place"
        );
    }

    pub fn current_limit(&self) -> Option<u32> {
        *self.limit.read()
    }

    /// Non-blocking acquisition. Unlimited gates always succeed.
    pub fn try_acquire(&self) -> bool {
        let limiter = self.limiter.read().clone();
        match limiter {
            None => true,
            Some(rl) => rl.check().is_ok(),
        }
    }

    /// Park until a token is available or `park_max` lapses. Re-reads the
    /// limiter each poll so live config changes take effect mid-park.
    pub async fn acquire_within(&self, park_max: Duration) -> bool {
        if self.try_acquire() {
            metrics::record_rate_acquired(&self.pool);
            return true;
        }

        debug!(pool = %self.pool, "rate limited, parking");
        let deadline = tokio::time::Instant::now() + park_max;

        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            if self.try_acquire() {
                metrics::record_rate_acquired(&self.pool);
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                metrics::record_rate_rejected(&self.pool);
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_gate_always_admits() {
        let gate = RateGate::new("TEST", None);
        for _ in 0..1000 {
            assert!(gate.try_acquire());
        }
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let gate = RateGate::new("TEST", None);
        gate.update(Some(0));
        assert_eq!(gate.current_limit(), None);
        assert!(gate.try_acquire());
    }

    #[test]
    fn bucket_exhausts_at_capacity() {
        // 60/min: burst capacity of 60, then empty.
        let gate = RateGate::new("TEST", Some(60));
        let admitted = (0..120).filter(|_| gate.try_acquire()).count();
        assert!(admitted <= 60, "admitted {admitted} of 120");
        assert!(admitted >= 55, "bucket should start full, got {admitted}");
    }

    #[tokio::test]
    async fn park_times_out_when_bucket_is_dry() {
        let gate = RateGate::new("TEST", Some(60));
        while gate.try_acquire() {}

        let start = std::time::Instant::now();
        let acquired = gate.acquire_within(Duration::from_millis(120)).await;
        assert!(!acquired);
        assert!(start.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn removing_limit_unparks_waiters() {
        let gate = Arc::new(RateGate::new("TEST", Some(60)));
        while gate.try_acquire() {}

        let parked = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire_within(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(80)).await;
        gate.update(None);

        let acquired = tokio::time::timeout(Duration::from_secs(1), parked)
            .await
            .unwrap()
            .unwrap();
        assert!(acquired);
    }
}

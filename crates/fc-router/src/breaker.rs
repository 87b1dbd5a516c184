//! Count-windowed circuit breaker with half-open probing.
//!
//! One breaker per pool. Outcomes land in a ring of booleans; once at least
//! `minimum_calls` are buffered and the failure rate crosses the threshold,
//! the breaker opens and every call is rejected without I/O for
//! `wait_duration`. After that a limited number of probes run; all must
//! succeed to close the breaker, any failure re-opens it and restarts the
//! timer.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::metrics;

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub sliding_window_size: usize,
    pub minimum_calls: u32,
    pub failure_rate_threshold: f64,
    pub wait_duration: Duration,
    pub permitted_calls_in_half_open: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            sliding_window_size: 100,
            minimum_calls: 10,
            failure_rate_threshold: 0.5,
            wait_duration: Duration::from_secs(30),
            permitted_calls_in_half_open: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Verdict for one prospective call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Permit,
    Reject { retry_after: Duration },
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub failure_rate: f64,
    pub buffered_calls: u32,
    pub window_size: u32,
}

struct Inner {
    state: BreakerState,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_permits_used: u32,
    half_open_successes: u32,
}

pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let name = name.into();
        metrics::set_breaker_state(&name, BreakerState::Closed);
        Self {
            name,
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window: VecDeque::with_capacity(128),
                opened_at: None,
                half_open_permits_used: 0,
                half_open_successes: 0,
            }),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decide whether a call may proceed. Rejections carry the delay the
    /// caller should NACK with (`wait_duration`, per contract).
    pub fn try_call(&self) -> BreakerDecision {
        let mut inner = self.inner.lock();

        match inner.state {
            BreakerState::Closed => BreakerDecision::Permit,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.settings.wait_duration {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_permits_used = 1;
                    inner.half_open_successes = 0;
                    metrics::set_breaker_state(&self.name, BreakerState::HalfOpen);
                    info!(breaker = %self.name, "circuit breaker half-open, probing");
                    BreakerDecision::Permit
                } else {
                    self.reject();
                    BreakerDecision::Reject {
                        retry_after: self.settings.wait_duration,
                    }
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_permits_used < self.settings.permitted_calls_in_half_open {
                    inner.half_open_permits_used += 1;
                    BreakerDecision::Permit
                } else {
                    self.reject();
                    BreakerDecision::Reject {
                        retry_after: self.settings.wait_duration,
                    }
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
        metrics::record_breaker_call(&self.name, "success");

        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Self::push(&mut inner, &self.settings, true),
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.settings.permitted_calls_in_half_open {
                    inner.state = BreakerState::Closed;
                    inner.window.clear();
                    inner.opened_at = None;
                    metrics::set_breaker_state(&self.name, BreakerState::Closed);
                    info!(breaker = %self.name, "circuit breaker closed");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        metrics::record_breaker_call(&self.name, "failure");

        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                Self::push(&mut inner, &self.settings, false);
                let calls = inner.window.len() as u32;
                if calls >= self.settings.minimum_calls {
                    let failures = inner.window.iter().filter(|ok| !**ok).count();
                    let rate = failures as f64 / calls as f64;
                    if rate >= self.settings.failure_rate_threshold {
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                        metrics::set_breaker_state(&self.name, BreakerState::Open);
                        warn!(
                            breaker = %self.name,
                            failure_rate = rate,
                            calls,
                            "circuit breaker opened"
                        );
                    }
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_permits_used = 0;
                inner.half_open_successes = 0;
                metrics::set_breaker_state(&self.name, BreakerState::Open);
                warn!(breaker = %self.name, "probe failed, circuit breaker re-opened");
            }
            BreakerState::Open => {}
        }
    }

    fn push(inner: &mut Inner, settings: &BreakerSettings, success: bool) {
        if inner.window.len() >= settings.sliding_window_size {
            inner.window.pop_front();
        }
        inner.window.push_back(success);
    }

    fn reject(&self) {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
        metrics::record_breaker_call(&self.name, "rejected");
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Force the breaker closed, clearing the window. Operator action.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.window.clear();
        inner.opened_at = None;
        inner.half_open_permits_used = 0;
        inner.half_open_successes = 0;
        metrics::set_breaker_state(&self.name, BreakerState::Closed);
        info!(breaker = %self.name, "circuit breaker reset by operator");
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        let successful = self.successful_calls.load(Ordering::Relaxed);
        let failed = self.failed_calls.load(Ordering::Relaxed);
        let total = successful + failed;

        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            successful_calls: successful,
            failed_calls: failed,
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            failure_rate: if total > 0 {
                failed as f64 / total as f64
            } else {
                0.0
            },
            buffered_calls: inner.window.len() as u32,
            window_size: self.settings.sliding_window_size as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            sliding_window_size: 20,
            minimum_calls: 10,
            failure_rate_threshold: 0.5,
            wait_duration: Duration::from_millis(50),
            permitted_calls_in_half_open: 3,
        }
    }

    #[test]
    fn stays_closed_below_minimum_calls() {
        let breaker = CircuitBreaker::new("TEST", settings());
        for _ in 0..9 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.try_call(), BreakerDecision::Permit);
    }

    #[test]
    fn opens_at_failure_rate_threshold() {
        let breaker = CircuitBreaker::new("TEST", settings());
        for _ in 0..5 {
            breaker.record_success();
        }
        for _ in 0..5 {
            breaker.record_failure();
        }
        // 10 calls, 50% failures: at threshold, so open.
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(
            breaker.try_call(),
            BreakerDecision::Reject { .. }
        ));
    }

    #[test]
    fn rejects_carry_wait_duration() {
        let breaker = CircuitBreaker::new("TEST", settings());
        for _ in 0..10 {
            breaker.record_failure();
        }
        match breaker.try_call() {
            BreakerDecision::Reject { retry_after } => {
                assert_eq!(retry_after, Duration::from_millis(50));
            }
            BreakerDecision::Permit => panic!("open breaker must reject"),
        }
        assert_eq!(breaker.stats().rejected_calls, 1);
    }

    #[test]
    fn half_open_closes_after_all_probes_succeed() {
        let breaker = CircuitBreaker::new("TEST", settings());
        for _ in 0..10 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(60));

        // Three probes permitted.
        assert_eq!(breaker.try_call(), BreakerDecision::Permit);
        assert_eq!(breaker.try_call(), BreakerDecision::Permit);
        assert_eq!(breaker.try_call(), BreakerDecision::Permit);
        assert!(matches!(
            breaker.try_call(),
            BreakerDecision::Reject { .. }
        ));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);

        // Window was reset: old failures are forgotten.
        assert_eq!(breaker.stats().buffered_calls, 0);
    }

    #[test]
    fn half_open_failure_reopens_and_resets_timer() {
        let breaker = CircuitBreaker::new("TEST", settings());
        for _ in 0..10 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(breaker.try_call(), BreakerDecision::Permit);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Timer restarted: still rejecting right away.
        assert!(matches!(
            breaker.try_call(),
            BreakerDecision::Reject { .. }
        ));
    }

    #[test]
    fn reset_forces_closed() {
        let breaker = CircuitBreaker::new("TEST", settings());
        for _ in 0..10 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.try_call(), BreakerDecision::Permit);
    }

    #[test]
    fn window_slides_out_old_outcomes() {
        let breaker = CircuitBreaker::new("TEST", settings());
        // Fill the 20-slot window with successes, then 9 failures: rate 9/20
        // stays under 0.5 and the oldest successes slide out.
        for _ in 0..20 {
            breaker.record_success();
        }
        for _ in 0..9 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.stats().buffered_calls, 20);
    }
}

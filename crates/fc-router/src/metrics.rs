//! Prometheus metric emission for the router.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

use crate::breaker::BreakerState;

pub fn record_received(count: u64) {
    counter!("messages_received_total").increment(count);
}

pub fn record_acked() {
    counter!("messages_acked_total").increment(1);
}

pub fn record_nacked() {
    counter!("messages_nacked_total").increment(1);
}

pub fn record_mediation(pool: &str, outcome: &'static str, duration: Duration) {
    histogram!(
        "mediator_duration_seconds",
        "pool" => pool.to_string(),
        "outcome" => outcome
    )
    .record(duration.as_secs_f64());
}

pub fn set_active_workers(pool: &str, count: u32) {
    gauge!("pool_active_workers", "pool" => pool.to_string()).set(count as f64);
}

/// Router-internal backlog: pointers admitted to the pool but not yet
/// picked up by a worker. Broker-side depth is served separately through
/// `GET /api/queues` from the adapters' own figures.
pub fn set_queue_depth(pool: &str, depth: u32) {
    gauge!("pool_queue_depth", "pool" => pool.to_string()).set(depth as f64);
}

pub fn record_rate_acquired(pool: &str) {
    counter!("rate_limiter_acquired_total", "pool" => pool.to_string()).increment(1);
}

pub fn record_rate_rejected(pool: &str) {
    counter!("rate_limiter_rejected_total", "pool" => pool.to_string()).increment(1);
}

pub fn set_breaker_state(name: &str, state: BreakerState) {
    let code = match state {
        BreakerState::Closed => 0.0,
        BreakerState::Open => 1.0,
        BreakerState::HalfOpen => 2.0,
    };
    gauge!("circuit_breaker_state", "name" => name.to_string()).set(code);
}

pub fn record_breaker_call(name: &str, result: &'static str) {
    counter!(
        "circuit_breaker_calls_total",
        "name" => name.to_string(),
        "result" => result
    )
    .increment(1);
}

pub fn record_saturation(pool: &str) {
    counter!("saturation_events_total", "pool" => pool.to_string()).increment(1);
}

pub fn set_in_flight(count: usize) {
    gauge!("router_in_flight_messages").set(count as f64);
}

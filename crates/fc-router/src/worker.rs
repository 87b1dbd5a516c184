//! Group worker: one task per active `{pool, group}` lane.
//!
//! Strict in-group FIFO comes from the worker being the only consumer of
//! its inbox. Every mediation for the group happens here, behind the
//! pool's rate gate and circuit breaker. Idle workers exit after
//! `idle_worker_timeout_ms` and the scheduler forgets them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use fc_core::{
    AckDecision, DispatchMode, MediationOutcome, PoolConfig, WarningCategory, WarningSeverity,
};

use crate::breaker::{BreakerDecision, CircuitBreaker};
use crate::limiter::RateGate;
use crate::mediator::{DeliverySpec, Mediator};
use crate::metrics;
use crate::pool::{GroupTask, PoolCommand};
use crate::pool_metrics::PoolMetricsRecorder;
use crate::router::RouterCommand;
use crate::warning::WarningService;

/// Delay used when a pointer is skipped to preserve FIFO after an earlier
/// failure in its batch+group.
const FIFO_SKIP_DELAY_SECONDS: u32 = 1;
/// Delay used when the rate-limit park deadline lapses.
const RATE_LIMIT_NACK_DELAY_SECONDS: u32 = 2;
/// Idle window for ephemeral lanes (IMMEDIATE pointers): long enough to
/// catch a resubmit already in flight, short enough to free the slot.
const EPHEMERAL_IDLE_TIMEOUT: Duration = Duration::from_millis(20);

pub(crate) struct WorkerContext {
    pub pool_code: Arc<str>,
    pub group_id: Arc<str>,
    pub generation: u64,
    /// Per-pointer lane (IMMEDIATE dispatch): exits once the lane drains.
    pub ephemeral: bool,
    pub config_rx: watch::Receiver<Arc<PoolConfig>>,
    pub mediator: Arc<dyn Mediator>,
    pub gate: Arc<RateGate>,
    pub breaker: Arc<CircuitBreaker>,
    pub pool_tx: mpsc::Sender<PoolCommand>,
    pub router_tx: mpsc::Sender<RouterCommand>,
    pub queue_depth: Arc<AtomicU32>,
    pub recorder: Arc<PoolMetricsRecorder>,
    pub warnings: Arc<WarningService>,
    pub shutdown_rx: watch::Receiver<bool>,
}

struct WorkerState {
    /// Batch that failed in this group; subsequent pointers of the same
    /// batch are skipped until a new batch arrives.
    failed_batch: Option<Arc<str>>,
}

pub(crate) async fn run_group_worker(ctx: WorkerContext, mut rx: mpsc::Receiver<GroupTask>) {
    debug!(pool = %ctx.pool_code, group = %ctx.group_id, "group worker started");

    let mut state = WorkerState { failed_batch: None };
    let mut shutdown_rx = ctx.shutdown_rx.clone();

    loop {
        // Pool shutdown: the pointer in hand was already finished below;
        // queued pointers stay unacked and return via visibility timeout.
        if *shutdown_rx.borrow() {
            debug!(pool = %ctx.pool_code, group = %ctx.group_id, "shutdown flagged, exiting");
            break;
        }

        let idle_timeout = if ctx.ephemeral {
            EPHEMERAL_IDLE_TIMEOUT
        } else {
            Duration::from_millis(ctx.config_rx.borrow().idle_worker_timeout_ms.max(100))
        };

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            polled = tokio::time::timeout(idle_timeout, rx.recv()) => match polled {
                Ok(Some(task)) => process(&ctx, &mut state, task).await,
                Ok(None) => {
                    debug!(pool = %ctx.pool_code, group = %ctx.group_id, "inbox closed, exiting");
                    break;
                }
                Err(_) => {
                    if rx.is_empty() {
                        // Close first so a racing submit bounces back to the
                        // scheduler instead of landing in a dropped buffer,
                        // then drain anything that slipped in before the close.
                        rx.close();
                        while let Ok(task) = rx.try_recv() {
                            process(&ctx, &mut state, task).await;
                        }
                        debug!(pool = %ctx.pool_code, group = %ctx.group_id, "idle timeout, exiting");
                        break;
                    }
                }
            }
        }
    }

    // try_send: during pool shutdown the scheduler is joining workers and
    // not draining its inbox; a blocking send here would deadlock.
    let _ = ctx.pool_tx.try_send(PoolCommand::WorkerExited {
        group_id: Arc::clone(&ctx.group_id),
        generation: ctx.generation,
    });

    info!(pool = %ctx.pool_code, group = %ctx.group_id, "group worker exited");
}

async fn process(ctx: &WorkerContext, state: &mut WorkerState, task: GroupTask) {
    let depth = ctx.queue_depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
    metrics::set_queue_depth(&ctx.pool_code, depth);

    let config = ctx.config_rx.borrow().clone();
    let mode = task.pointer.dispatch_mode;

    // A new batch clears the failure latch for this group.
    if let Some(failed) = state.failed_batch.as_ref() {
        if *failed != task.batch_id {
            state.failed_batch = None;
        }
    }

    if mode == DispatchMode::BlockOnError && state.failed_batch.as_deref() == Some(&*task.batch_id) {
        debug!(
            pointer_id = %task.pointer.id,
            group = %ctx.group_id,
            "skipping pointer after earlier failure in batch+group"
        );
        complete(
            ctx,
            &task.pointer.id,
            AckDecision::Nack {
                delay_seconds: FIFO_SKIP_DELAY_SECONDS,
            },
        )
        .await;
        return;
    }

    // Rate gate: park for a bounded time, then give the attempt back to the
    // broker with a short delay.
    let park_max = Duration::from_millis(config.rate_limit_park_max_ms);
    if !ctx.gate.acquire_within(park_max).await {
        ctx.recorder.record_rate_parked();
        warn!(
            pointer_id = %task.pointer.id,
            pool = %ctx.pool_code,
            "rate-limit park deadline lapsed, returning pointer"
        );
        nack_and_latch(
            ctx,
            state,
            &task,
            mode,
            RATE_LIMIT_NACK_DELAY_SECONDS,
        )
        .await;
        return;
    }

    // Circuit breaker: while open, rejections carry the breaker's wait
    // duration and never touch the network.
    match ctx.breaker.try_call() {
        BreakerDecision::Permit => {}
        BreakerDecision::Reject { retry_after } => {
            debug!(
                pointer_id = %task.pointer.id,
                pool = %ctx.pool_code,
                "circuit open, rejecting without delivery"
            );
            nack_and_latch(ctx, state, &task, mode, retry_after.as_secs().max(1) as u32).await;
            return;
        }
    }

    let spec = DeliverySpec {
        timeout: Duration::from_millis(config.mediator_timeout_ms.max(1)),
        retry_min: Duration::from_millis(config.retry_min_ms.max(1)),
        retry_max: Duration::from_millis(config.retry_max_ms.max(config.retry_min_ms)),
        attempt: task.receive_count.max(1),
    };

    let started = Instant::now();
    let delivery = ctx.mediator.deliver(&task.pointer, &spec).await;
    let elapsed = started.elapsed();

    metrics::record_mediation(&ctx.pool_code, delivery.outcome.label(), elapsed);

    match delivery.outcome {
        MediationOutcome::Success => {
            ctx.breaker.record_success();
            ctx.recorder.record_success(elapsed.as_millis() as u64);
            complete(ctx, &task.pointer.id, AckDecision::Ack).await;
        }
        MediationOutcome::ErrorConfig { reason } => {
            // Terminal: retrying cannot help, so the pointer is ACKed as
            // poison. Misconfiguration is not a target fault.
            ctx.breaker.record_success();
            ctx.recorder.record_failure(elapsed.as_millis() as u64);
            warn!(
                pointer_id = %task.pointer.id,
                pool = %ctx.pool_code,
                target = %task.pointer.mediation_target,
                reason = %reason,
                "configuration error, acking pointer as poison"
            );
            ctx.warnings.add_warning(
                WarningCategory::Configuration,
                WarningSeverity::Error,
                format!(
                    "Pointer {} dropped as poison ({reason}), target {}",
                    task.pointer.id, task.pointer.mediation_target
                ),
                format!("GroupWorker:{}", ctx.pool_code),
            );
            complete(ctx, &task.pointer.id, AckDecision::Ack).await;
        }
        MediationOutcome::Nack {
            delay_seconds,
            reason,
        } => {
            if delivery.server_fault {
                ctx.breaker.record_failure();
            } else {
                ctx.breaker.record_success();
            }
            ctx.recorder.record_failure(elapsed.as_millis() as u64);

            if task.receive_count > ctx.config_rx.borrow().max_retries {
                warn!(
                    pointer_id = %task.pointer.id,
                    receive_count = task.receive_count,
                    max_retries = config.max_retries,
                    reason = %reason,
                    "pointer exceeded max retries, still returning to broker"
                );
            } else {
                debug!(
                    pointer_id = %task.pointer.id,
                    delay_seconds,
                    reason = %reason,
                    "delivery nacked"
                );
            }

            nack_and_latch(ctx, state, &task, mode, delay_seconds).await;
        }
    }
}

async fn nack_and_latch(
    ctx: &WorkerContext,
    state: &mut WorkerState,
    task: &GroupTask,
    mode: DispatchMode,
    delay_seconds: u32,
) {
    if mode == DispatchMode::BlockOnError {
        if state.failed_batch.is_none() {
            debug!(
                group = %ctx.group_id,
                batch = %task.batch_id,
                "batch+group latched as failed, successors will be skipped"
            );
        }
        state.failed_batch = Some(Arc::clone(&task.batch_id));
    }

    complete(ctx, &task.pointer.id, AckDecision::Nack { delay_seconds }).await;
}

async fn complete(ctx: &WorkerContext, pointer_id: &str, decision: AckDecision) {
    let _ = ctx
        .router_tx
        .send(RouterCommand::Complete {
            pointer_id: pointer_id.to_string(),
            decision,
        })
        .await;
}

pub(crate) fn spawn(
    ctx: WorkerContext,
    rx: mpsc::Receiver<GroupTask>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_group_worker(ctx, rx))
}

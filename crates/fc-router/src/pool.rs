//! Pool scheduler: one actor per pool.
//!
//! Owns the `group -> worker` map, the rate gate, and the circuit breaker.
//! Admission spawns group workers on demand while the active-worker count
//! stays under `concurrency`; beyond that (or with a full group inbox) the
//! submit is rejected with `POOL_FULL` and the router keeps the pointer
//! in flight for a later resubmit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use fc_core::{DispatchMode, MessagePointer, PoolConfig, PoolStats};

use crate::breaker::{BreakerSettings, BreakerStats, CircuitBreaker};
use crate::limiter::RateGate;
use crate::mediator::Mediator;
use crate::metrics;
use crate::pool_metrics::PoolMetricsRecorder;
use crate::router::RouterCommand;
use crate::warning::WarningService;
use crate::worker::{self, WorkerContext};

const POOL_INBOX: usize = 256;
const WORKER_INBOX: usize = 64;

/// One unit of work for a group lane.
pub struct GroupTask {
    pub pointer: MessagePointer,
    pub batch_id: Arc<str>,
    pub receive_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResult {
    Accepted,
    PoolFull,
}

pub enum PoolCommand {
    Submit {
        group_id: Arc<str>,
        task: GroupTask,
        reply: oneshot::Sender<SubmitResult>,
    },
    WorkerExited {
        group_id: Arc<str>,
        generation: u64,
    },
    UpdateConfig {
        config: PoolConfig,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    BreakerStats {
        reply: oneshot::Sender<BreakerStats>,
    },
    ResetBreaker {
        reply: oneshot::Sender<()>,
    },
    Drain,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct PoolHandle {
    code: Arc<str>,
    tx: mpsc::Sender<PoolCommand>,
}

impl PoolHandle {
    pub fn code(&self) -> &str {
        &self.code
    }

    pub async fn submit(&self, group_id: Arc<str>, task: GroupTask) -> SubmitResult {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(PoolCommand::Submit {
                group_id,
                task,
                reply,
            })
            .await
            .is_err()
        {
            return SubmitResult::PoolFull;
        }
        rx.await.unwrap_or(SubmitResult::PoolFull)
    }

    pub async fn update_config(&self, config: PoolConfig) {
        let _ = self.tx.send(PoolCommand::UpdateConfig { config }).await;
    }

    pub async fn stats(&self) -> Option<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PoolCommand::Stats { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn breaker_stats(&self) -> Option<BreakerStats> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PoolCommand::BreakerStats { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn reset_breaker(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(PoolCommand::ResetBreaker { reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.is_ok()
    }

    pub async fn drain(&self) {
        let _ = self.tx.send(PoolCommand::Drain).await;
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PoolCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct WorkerSlot {
    tx: mpsc::Sender<GroupTask>,
    generation: u64,
    handle: tokio::task::JoinHandle<()>,
}

pub struct PoolScheduler {
    code: Arc<str>,
    config_tx: watch::Sender<Arc<PoolConfig>>,
    workers: HashMap<Arc<str>, WorkerSlot>,
    gate: Arc<RateGate>,
    breaker: Arc<CircuitBreaker>,
    queue_depth: Arc<AtomicU32>,
    recorder: Arc<PoolMetricsRecorder>,
    warnings: Arc<WarningService>,
    mediator: Arc<dyn Mediator>,
    router_tx: mpsc::Sender<RouterCommand>,
    self_tx: mpsc::Sender<PoolCommand>,
    shutdown_tx: watch::Sender<bool>,
    generation: u64,
    draining: bool,
    drain_timeout: Duration,
}

impl PoolScheduler {
    pub fn spawn(
        config: PoolConfig,
        mediator: Arc<dyn Mediator>,
        router_tx: mpsc::Sender<RouterCommand>,
        warnings: Arc<WarningService>,
        breaker_settings: BreakerSettings,
        drain_timeout: Duration,
    ) -> PoolHandle {
        let code: Arc<str> = Arc::from(config.code.as_str());
        let (tx, rx) = mpsc::channel(POOL_INBOX);
        let (config_tx, _) = watch::channel(Arc::new(config.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        let scheduler = PoolScheduler {
            code: Arc::clone(&code),
            gate: Arc::new(RateGate::new(
                config.code.clone(),
                config.rate_limit_per_minute,
            )),
            breaker: Arc::new(CircuitBreaker::new(config.code.clone(), breaker_settings)),
            config_tx,
            workers: HashMap::new(),
            queue_depth: Arc::new(AtomicU32::new(0)),
            recorder: Arc::new(PoolMetricsRecorder::new()),
            warnings,
            mediator,
            router_tx,
            self_tx: tx.clone(),
            shutdown_tx,
            generation: 0,
            draining: false,
            drain_timeout,
        };

        info!(
            pool = %code,
            concurrency = config.concurrency,
            rate_limit = ?config.rate_limit_per_minute,
            "pool scheduler started"
        );

        tokio::spawn(scheduler.run(rx));

        PoolHandle { code, tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PoolCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                PoolCommand::Submit {
                    group_id,
                    task,
                    reply,
                } => {
                    let result = self.submit(group_id, task);
                    let _ = reply.send(result);
                }
                PoolCommand::WorkerExited {
                    group_id,
                    generation,
                } => {
                    let stale = self
                        .workers
                        .get(&group_id)
                        .map(|slot| slot.generation == generation)
                        .unwrap_or(false);
                    if stale {
                        self.workers.remove(&group_id);
                        metrics::set_active_workers(&self.code, self.workers.len() as u32);
                    }
                }
                PoolCommand::UpdateConfig { config } => self.apply_config(config),
                PoolCommand::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                PoolCommand::BreakerStats { reply } => {
                    let _ = reply.send(self.breaker.stats());
                }
                PoolCommand::ResetBreaker { reply } => {
                    self.breaker.reset();
                    let _ = reply.send(());
                }
                PoolCommand::Drain => {
                    info!(pool = %self.code, "pool draining, admission stopped");
                    self.draining = true;
                }
                PoolCommand::Shutdown { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }

        debug!(pool = %self.code, "pool scheduler stopped");
    }

    fn submit(&mut self, group_id: Arc<str>, task: GroupTask) -> SubmitResult {
        if self.draining {
            return SubmitResult::PoolFull;
        }

        if let Some(inbox) = self.workers.get(&group_id).map(|slot| slot.tx.clone()) {
            return match inbox.try_send(task) {
                Ok(()) => {
                    self.note_enqueued();
                    SubmitResult::Accepted
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::record_saturation(&self.code);
                    SubmitResult::PoolFull
                }
                Err(mpsc::error::TrySendError::Closed(task)) => {
                    // The worker idled out between our lookup and the send;
                    // replace it and re-deliver to the fresh inbox.
                    debug!(pool = %self.code, group = %group_id, "worker gone, respawning");
                    self.workers.remove(&group_id);
                    self.spawn_and_send(group_id, task)
                }
            };
        }

        let concurrency = self.config_tx.borrow().concurrency as usize;
        if self.workers.len() >= concurrency {
            metrics::record_saturation(&self.code);
            return SubmitResult::PoolFull;
        }

        self.spawn_and_send(group_id, task)
    }

    fn spawn_and_send(&mut self, group_id: Arc<str>, task: GroupTask) -> SubmitResult {
        // IMMEDIATE pointers arrive on per-pointer lanes; their workers
        // exit as soon as the lane drains instead of waiting out the idle
        // timeout, so they do not pin a concurrency slot.
        let ephemeral = task.pointer.dispatch_mode == DispatchMode::Immediate;
        let slot = self.spawn_worker(Arc::clone(&group_id), ephemeral);
        match slot.tx.try_send(task) {
            Ok(()) => {
                self.workers.insert(group_id, slot);
                metrics::set_active_workers(&self.code, self.workers.len() as u32);
                self.note_enqueued();
                SubmitResult::Accepted
            }
            Err(_) => {
                // A fresh inbox cannot be full; treat as saturation anyway.
                warn!(pool = %self.code, group = %group_id, "fresh worker rejected task");
                metrics::record_saturation(&self.code);
                SubmitResult::PoolFull
            }
        }
    }

    fn spawn_worker(&mut self, group_id: Arc<str>, ephemeral: bool) -> WorkerSlot {
        self.generation += 1;
        let (tx, rx) = mpsc::channel(WORKER_INBOX);

        let ctx = WorkerContext {
            pool_code: Arc::clone(&self.code),
            group_id,
            generation: self.generation,
            ephemeral,
            config_rx: self.config_tx.subscribe(),
            mediator: Arc::clone(&self.mediator),
            gate: Arc::clone(&self.gate),
            breaker: Arc::clone(&self.breaker),
            pool_tx: self.self_tx.clone(),
            router_tx: self.router_tx.clone(),
            queue_depth: Arc::clone(&self.queue_depth),
            recorder: Arc::clone(&self.recorder),
            warnings: Arc::clone(&self.warnings),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };

        WorkerSlot {
            tx,
            generation: self.generation,
            handle: worker::spawn(ctx, rx),
        }
    }

    fn note_enqueued(&self) {
        let depth = self.queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_queue_depth(&self.code, depth);
    }

    fn apply_config(&mut self, config: PoolConfig) {
        let previous = self.config_tx.borrow().clone();

        if previous.rate_limit_per_minute != config.rate_limit_per_minute {
            self.gate.update(config.rate_limit_per_minute);
        }
        if previous.concurrency != config.concurrency {
            // Growth opens slots immediately; reduction drains naturally as
            // idle workers exit.
            info!(
                pool = %self.code,
                old = previous.concurrency,
                new = config.concurrency,
                "pool concurrency updated"
            );
        }

        self.config_tx.send_replace(Arc::new(config));
    }

    fn stats(&self) -> PoolStats {
        let config = self.config_tx.borrow().clone();
        PoolStats {
            pool_code: self.code.to_string(),
            concurrency: config.concurrency,
            active_group_workers: self.workers.len() as u32,
            queue_depth: self.queue_depth.load(Ordering::SeqCst),
            rate_limit_per_minute: self.gate.current_limit(),
            circuit_state: self.breaker.state().as_str().to_string(),
            metrics: Some(self.recorder.snapshot()),
        }
    }

    async fn shutdown(&mut self) {
        info!(pool = %self.code, workers = self.workers.len(), "pool shutting down");
        self.draining = true;

        // Workers finish the pointer in hand and exit; queued pointers are
        // neither acked nor nacked, the broker's visibility timeout returns
        // them.
        self.shutdown_tx.send_replace(true);

        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        for (group_id, slot) in self.workers.drain() {
            let WorkerSlot { tx, mut handle, .. } = slot;
            drop(tx);
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!(pool = %self.code, group = %group_id, "worker exceeded drain timeout, cancelling");
                handle.abort();
            }
        }

        metrics::set_active_workers(&self.code, 0);
        metrics::set_queue_depth(&self.code, 0);
    }
}

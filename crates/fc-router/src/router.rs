//! Router actor: owns the in-flight table and the batch tracker.
//!
//! All mutation of routing state happens on this single task; consumers,
//! workers, the config applier, and the admin API talk to it through a
//! bounded command channel, with replies on oneshot channels embedded in
//! the commands. A pointer is in flight from the moment its batch is
//! admitted until its worker completes it with an ACK or NACK decision.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use indexmap::IndexMap;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use fc_broker::QueueAdapter;
use fc_core::{
    AckDecision, DispatchMode, InFlightEntry, InFlightInfo, PoolConfig, PoolStats,
    ReceivedPointer, WarningCategory, WarningSeverity,
};

use crate::breaker::{BreakerSettings, BreakerStats};
use crate::mediator::Mediator;
use crate::metrics;
use crate::pool::{GroupTask, PoolHandle, PoolScheduler, SubmitResult};
use crate::warning::WarningService;

const ROUTER_INBOX: usize = 1024;
const DEFAULT_POOL_CODE: &str = "DEFAULT-POOL";
const DEFAULT_GROUP: &str = "default";
/// Delay used when a pointer must be bounced without a delivery attempt.
const REQUEUE_DELAY_SECONDS: u32 = 5;

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub breaker_settings: BreakerSettings,
    pub drain_timeout: Duration,
    /// Base delay before retrying parked pointers; jitter is added on top.
    pub resubmit_base_delay: Duration,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            breaker_settings: BreakerSettings::default(),
            drain_timeout: Duration::from_secs(30),
            resubmit_base_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconfigureSummary {
    pub pools_created: usize,
    pub pools_updated: usize,
    pub pools_removed: usize,
}

pub enum RouterCommand {
    RegisterQueue {
        queue_id: String,
        adapter: Arc<dyn QueueAdapter>,
    },
    DeregisterQueue {
        queue_id: String,
    },
    SubmitBatch {
        batch: Vec<ReceivedPointer>,
    },
    Complete {
        pointer_id: String,
        decision: AckDecision,
    },
    ResubmitParked {
        pool_code: Arc<str>,
    },
    ExtendLongRunning {
        older_than: Duration,
        extension_seconds: u32,
    },
    Reconfigure {
        pools: Vec<PoolConfig>,
        reply: oneshot::Sender<ReconfigureSummary>,
    },
    QueryInFlight {
        limit: usize,
        reply: oneshot::Sender<Vec<InFlightInfo>>,
    },
    QueryPoolStats {
        reply: oneshot::Sender<Vec<PoolStats>>,
    },
    QueryBreakers {
        reply: oneshot::Sender<Vec<BreakerStats>>,
    },
    ResetBreaker {
        pool_code: String,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterCommand>,
    inflight_rx: watch::Receiver<usize>,
}

impl RouterHandle {
    pub async fn register_queue(&self, queue_id: String, adapter: Arc<dyn QueueAdapter>) {
        let _ = self
            .tx
            .send(RouterCommand::RegisterQueue { queue_id, adapter })
            .await;
    }

    pub async fn deregister_queue(&self, queue_id: &str) {
        let _ = self
            .tx
            .send(RouterCommand::DeregisterQueue {
                queue_id: queue_id.to_string(),
            })
            .await;
    }

    pub async fn submit_batch(&self, batch: Vec<ReceivedPointer>) {
        let _ = self.tx.send(RouterCommand::SubmitBatch { batch }).await;
    }

    pub async fn reconfigure(&self, pools: Vec<PoolConfig>) -> ReconfigureSummary {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RouterCommand::Reconfigure { pools, reply })
            .await
            .is_err()
        {
            return ReconfigureSummary::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn in_flight(&self, limit: usize) -> Vec<InFlightInfo> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RouterCommand::QueryInFlight { limit, reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn pool_stats(&self) -> Vec<PoolStats> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RouterCommand::QueryPoolStats { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn breakers(&self) -> Vec<BreakerStats> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RouterCommand::QueryBreakers { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn reset_breaker(&self, pool_code: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RouterCommand::ResetBreaker {
                pool_code: pool_code.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn extend_long_running(&self, older_than: Duration, extension_seconds: u32) {
        let _ = self
            .tx
            .send(RouterCommand::ExtendLongRunning {
                older_than,
                extension_seconds,
            })
            .await;
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RouterCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Live in-flight count, for supervisor backpressure.
    pub fn in_flight_watch(&self) -> watch::Receiver<usize> {
        self.inflight_rx.clone()
    }

    pub fn in_flight_count(&self) -> usize {
        *self.inflight_rx.borrow()
    }
}

enum AckWork {
    Decision(AckDecision),
    Extend { seconds: u32 },
}

struct AckJob {
    receipt_handle: String,
    work: AckWork,
}

/// Sequential ack/nack executor for one queue. Keeping one task per queue
/// preserves completion order on the broker, which is what makes the
/// per-group FIFO guarantee observable as an ordered ack sequence.
async fn run_acker(
    queue_id: String,
    adapter: Arc<dyn QueueAdapter>,
    mut rx: mpsc::Receiver<AckJob>,
) {
    while let Some(job) = rx.recv().await {
        match job.work {
            AckWork::Decision(AckDecision::Ack) => {
                if let Err(e) = adapter.ack(&job.receipt_handle).await {
                    warn!(queue = %queue_id, error = %e, "ack failed");
                }
                metrics::record_acked();
            }
            AckWork::Decision(AckDecision::Nack { delay_seconds }) => {
                if let Err(e) = adapter.nack(&job.receipt_handle, delay_seconds).await {
                    warn!(queue = %queue_id, error = %e, "nack failed");
                }
                metrics::record_nacked();
            }
            AckWork::Extend { seconds } => {
                if let Err(e) = adapter.extend_visibility(&job.receipt_handle, seconds).await {
                    warn!(queue = %queue_id, error = %e, "visibility extension failed");
                }
            }
        }
    }
    debug!(queue = %queue_id, "acker stopped");
}

pub struct Router {
    options: RouterOptions,
    mediator: Arc<dyn Mediator>,
    warnings: Arc<WarningService>,
    in_flight: HashMap<String, InFlightEntry>,
    ackers: HashMap<String, mpsc::Sender<AckJob>>,
    pools: HashMap<String, PoolHandle>,
    pool_configs: HashMap<String, PoolConfig>,
    /// Pointers rejected with POOL_FULL, per pool and group, in admission
    /// order. They stay in flight until a resubmit slot frees.
    parked: HashMap<Arc<str>, IndexMap<Arc<str>, VecDeque<String>>>,
    resubmit_scheduled: HashSet<Arc<str>>,
    batch_seq: u64,
    inflight_tx: watch::Sender<usize>,
    self_tx: mpsc::Sender<RouterCommand>,
}

impl Router {
    pub fn spawn(
        mediator: Arc<dyn Mediator>,
        warnings: Arc<WarningService>,
        options: RouterOptions,
    ) -> RouterHandle {
        let (tx, rx) = mpsc::channel(ROUTER_INBOX);
        let (inflight_tx, inflight_rx) = watch::channel(0usize);

        let router = Router {
            options,
            mediator,
            warnings,
            in_flight: HashMap::new(),
            ackers: HashMap::new(),
            pools: HashMap::new(),
            pool_configs: HashMap::new(),
            parked: HashMap::new(),
            resubmit_scheduled: HashSet::new(),
            batch_seq: 0,
            inflight_tx,
            self_tx: tx.clone(),
        };

        tokio::spawn(router.run(rx));

        RouterHandle { tx, inflight_rx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RouterCommand>) {
        info!("router actor started");

        while let Some(command) = rx.recv().await {
            match command {
                RouterCommand::RegisterQueue { queue_id, adapter } => {
                    debug!(queue = %queue_id, "queue registered with router");
                    let (tx, rx) = mpsc::channel(ROUTER_INBOX);
                    tokio::spawn(run_acker(queue_id.clone(), adapter, rx));
                    self.ackers.insert(queue_id, tx);
                }
                RouterCommand::DeregisterQueue { queue_id } => {
                    debug!(queue = %queue_id, "queue deregistered from router");
                    // The acker drains its backlog and stops once dropped.
                    self.ackers.remove(&queue_id);
                }
                RouterCommand::SubmitBatch { batch } => self.handle_batch(batch).await,
                RouterCommand::Complete {
                    pointer_id,
                    decision,
                } => self.handle_complete(&pointer_id, decision).await,
                RouterCommand::ResubmitParked { pool_code } => {
                    self.resubmit_parked(pool_code).await
                }
                RouterCommand::ExtendLongRunning {
                    older_than,
                    extension_seconds,
                } => {
                    self.extend_long_running(older_than, extension_seconds).await
                }
                RouterCommand::Reconfigure { pools, reply } => {
                    let summary = self.reconfigure(pools).await;
                    let _ = reply.send(summary);
                }
                RouterCommand::QueryInFlight { limit, reply } => {
                    let _ = reply.send(self.in_flight_snapshot(limit));
                }
                RouterCommand::QueryPoolStats { reply } => {
                    let mut stats = Vec::with_capacity(self.pools.len());
                    for pool in self.pools.values() {
                        if let Some(s) = pool.stats().await {
                            stats.push(s);
                        }
                    }
                    stats.sort_by(|a, b| a.pool_code.cmp(&b.pool_code));
                    let _ = reply.send(stats);
                }
                RouterCommand::QueryBreakers { reply } => {
                    let mut stats = Vec::with_capacity(self.pools.len());
                    for pool in self.pools.values() {
                        if let Some(s) = pool.breaker_stats().await {
                            stats.push(s);
                        }
                    }
                    stats.sort_by(|a, b| a.name.cmp(&b.name));
                    let _ = reply.send(stats);
                }
                RouterCommand::ResetBreaker { pool_code, reply } => {
                    let reset = match self.pools.get(&pool_code) {
                        Some(pool) => pool.reset_breaker().await,
                        None => false,
                    };
                    let _ = reply.send(reset);
                }
                RouterCommand::Shutdown { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }

        info!("router actor stopped");
    }

    async fn handle_batch(&mut self, batch: Vec<ReceivedPointer>) {
        if batch.is_empty() {
            return;
        }

        metrics::record_received(batch.len() as u64);
        self.batch_seq += 1;
        let batch_id: Arc<str> = Arc::from(format!("b{:016}", self.batch_seq).as_str());

        for received in batch {
            let pointer_id = received.pointer.id.clone();

            // Dedup by pointer id: a redelivery of an id that is already in
            // flight is ACKed straight away so the broker stops resending;
            // the original keeps processing.
            if self.in_flight.contains_key(&pointer_id) {
                debug!(
                    pointer_id = %pointer_id,
                    queue = %received.queue_id,
                    "duplicate delivery of in-flight pointer, acking"
                );
                self.ack_raw(&received.queue_id, received.receipt_handle).await;
                continue;
            }

            let pool_code = effective_pool_code(&received.pointer.pool_code);
            // IMMEDIATE relaxes ordering: the pointer gets its own ephemeral
            // lane instead of its group's, so deliveries run concurrently up
            // to the pool's concurrency bound. The broker's own ordering is
            // all the FIFO such pointers get.
            let group_id: Arc<str> = if received.pointer.dispatch_mode == DispatchMode::Immediate {
                Arc::from(format!("~{pointer_id}").as_str())
            } else {
                received
                    .pointer
                    .message_group_id
                    .as_deref()
                    .filter(|g| !g.is_empty())
                    .map(Arc::from)
                    .unwrap_or_else(|| Arc::from(DEFAULT_GROUP))
            };

            let entry = InFlightEntry {
                pointer: received.pointer,
                receipt_handle: received.receipt_handle,
                broker_message_id: received.broker_message_id,
                queue_id: received.queue_id,
                batch_id: Arc::clone(&batch_id),
                group_id: Arc::clone(&group_id),
                receive_count: received.receive_count,
                entered_at: Instant::now(),
            };
            self.in_flight.insert(pointer_id.clone(), entry);
            self.publish_in_flight();

            let pool_key: Arc<str> = Arc::from(pool_code.as_str());

            // FIFO: if this group already has parked predecessors, the new
            // pointer queues behind them instead of jumping ahead.
            let behind_parked = self
                .parked
                .get(&pool_key)
                .and_then(|groups| groups.get(&group_id))
                .map(|q| !q.is_empty())
                .unwrap_or(false);

            if behind_parked {
                self.park(pool_key, group_id, pointer_id);
                continue;
            }

            if !self.try_submit(&pointer_id).await {
                metrics::record_saturation(&pool_key);
                self.park(pool_key, group_id, pointer_id);
            }
        }
    }

    /// Submit one in-flight pointer to its pool. Returns false on POOL_FULL.
    async fn try_submit(&mut self, pointer_id: &str) -> bool {
        let Some(entry) = self.in_flight.get(pointer_id) else {
            return true;
        };

        let pool_code = effective_pool_code(&entry.pointer.pool_code);
        let task = GroupTask {
            pointer: entry.pointer.clone(),
            batch_id: Arc::clone(&entry.batch_id),
            receive_count: entry.receive_count,
        };
        let group_id = Arc::clone(&entry.group_id);

        let pool = self.get_or_create_pool(&pool_code);
        match pool.submit(group_id, task).await {
            SubmitResult::Accepted => true,
            SubmitResult::PoolFull => false,
        }
    }

    fn park(&mut self, pool_key: Arc<str>, group_id: Arc<str>, pointer_id: String) {
        self.parked
            .entry(Arc::clone(&pool_key))
            .or_default()
            .entry(group_id)
            .or_default()
            .push_back(pointer_id);
        self.schedule_resubmit(pool_key);
    }

    fn schedule_resubmit(&mut self, pool_key: Arc<str>) {
        if !self.resubmit_scheduled.insert(Arc::clone(&pool_key)) {
            return;
        }

        let base = self.options.resubmit_base_delay;
        let jitter_ms = rand::rng().random_range(0..base.as_millis().max(1) as u64);
        let delay = base + Duration::from_millis(jitter_ms);
        let tx = self.self_tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx
                .send(RouterCommand::ResubmitParked {
                    pool_code: pool_key,
                })
                .await;
        });
    }

    async fn resubmit_parked(&mut self, pool_key: Arc<str>) {
        self.resubmit_scheduled.remove(&pool_key);

        let Some(mut groups) = self.parked.remove(&pool_key) else {
            return;
        };

        let mut still_parked: IndexMap<Arc<str>, VecDeque<String>> = IndexMap::new();

        for (group_id, mut queue) in groups.drain(..) {
            while let Some(pointer_id) = queue.front().cloned() {
                if !self.in_flight.contains_key(&pointer_id) {
                    queue.pop_front();
                    continue;
                }
                if self.try_submit(&pointer_id).await {
                    queue.pop_front();
                } else {
                    break;
                }
            }
            if !queue.is_empty() {
                still_parked.insert(group_id, queue);
            }
        }

        if !still_parked.is_empty() {
            let remaining: usize = still_parked.values().map(|q| q.len()).sum();
            debug!(pool = %pool_key, remaining, "pool still saturated, parking again");
            self.parked.insert(Arc::clone(&pool_key), still_parked);
            self.schedule_resubmit(pool_key);
        }
    }

    async fn handle_complete(&mut self, pointer_id: &str, decision: AckDecision) {
        let Some(entry) = self.in_flight.remove(pointer_id) else {
            debug!(pointer_id = %pointer_id, "completion for unknown pointer ignored");
            return;
        };
        self.publish_in_flight();

        let Some(acker) = self.ackers.get(&entry.queue_id) else {
            warn!(
                pointer_id = %pointer_id,
                queue = %entry.queue_id,
                "queue adapter gone, pointer will return via visibility timeout"
            );
            return;
        };

        let _ = acker
            .send(AckJob {
                receipt_handle: entry.receipt_handle,
                work: AckWork::Decision(decision),
            })
            .await;
    }

    /// ACK a delivery that never entered the pipeline (duplicates).
    async fn ack_raw(&self, queue_id: &str, receipt_handle: String) {
        let Some(acker) = self.ackers.get(queue_id) else {
            return;
        };
        let _ = acker
            .send(AckJob {
                receipt_handle,
                work: AckWork::Decision(AckDecision::Ack),
            })
            .await;
    }

    /// Extend the visibility window of pointers that have been processing
    /// longer than `older_than`, so slow targets do not trigger redelivery
    /// of a pointer that is still in a worker's hands.
    async fn extend_long_running(&self, older_than: Duration, extension_seconds: u32) {
        let mut extended = 0usize;
        for entry in self.in_flight.values() {
            if entry.entered_at.elapsed() < older_than {
                continue;
            }
            if let Some(acker) = self.ackers.get(&entry.queue_id) {
                let _ = acker
                    .send(AckJob {
                        receipt_handle: entry.receipt_handle.clone(),
                        work: AckWork::Extend {
                            seconds: extension_seconds,
                        },
                    })
                    .await;
                extended += 1;
            }
        }
        if extended > 0 {
            debug!(extended, "extended visibility for long-running pointers");
        }
    }

    fn get_or_create_pool(&mut self, pool_code: &str) -> PoolHandle {
        if let Some(pool) = self.pools.get(pool_code) {
            return pool.clone();
        }

        let config = self.pool_configs.get(pool_code).cloned().unwrap_or_else(|| {
            warn!(pool = %pool_code, "pointer for unconfigured pool, creating with defaults");
            self.warnings.add_warning(
                WarningCategory::Routing,
                WarningSeverity::Warn,
                format!("Pool [{pool_code}] not in configuration, created with defaults"),
                "Router".to_string(),
            );
            PoolConfig::named(pool_code)
        });

        let pool = PoolScheduler::spawn(
            config,
            Arc::clone(&self.mediator),
            self.self_tx.clone(),
            Arc::clone(&self.warnings),
            self.options.breaker_settings.clone(),
            self.options.drain_timeout,
        );
        self.pools.insert(pool_code.to_string(), pool.clone());
        pool
    }

    async fn reconfigure(&mut self, pools: Vec<PoolConfig>) -> ReconfigureSummary {
        let mut summary = ReconfigureSummary::default();
        let desired: HashMap<String, PoolConfig> =
            pools.into_iter().map(|p| (p.code.clone(), p)).collect();

        // Removed pools stop admitting, then get forcibly shut down after
        // the drain window. Their parked pointers go back to the broker.
        let removed: Vec<String> = self
            .pools
            .keys()
            .filter(|code| !desired.contains_key(*code))
            .cloned()
            .collect();
        for code in removed {
            if let Some(pool) = self.pools.remove(&code) {
                info!(pool = %code, "pool removed from configuration, draining");
                pool.drain().await;
                let drain_timeout = self.options.drain_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(drain_timeout).await;
                    pool.shutdown().await;
                });
                summary.pools_removed += 1;
            }
            self.pool_configs.remove(&code);

            let pool_key: Arc<str> = Arc::from(code.as_str());
            if let Some(groups) = self.parked.remove(&pool_key) {
                for (_, queue) in groups {
                    for pointer_id in queue {
                        self.handle_complete(
                            &pointer_id,
                            AckDecision::Nack {
                                delay_seconds: REQUEUE_DELAY_SECONDS,
                            },
                        )
                        .await;
                    }
                }
            }
        }

        for (code, config) in desired {
            match self.pool_configs.get(&code) {
                Some(previous) if *previous == config => {}
                Some(_) => {
                    if let Some(pool) = self.pools.get(&code) {
                        pool.update_config(config.clone()).await;
                    }
                    summary.pools_updated += 1;
                }
                None => {
                    summary.pools_created += 1;
                }
            }
            self.pool_configs.insert(code.clone(), config);
            if !self.pools.contains_key(&code) {
                self.get_or_create_pool(&code);
            }
        }

        info!(
            created = summary.pools_created,
            updated = summary.pools_updated,
            removed = summary.pools_removed,
            "router reconfigured"
        );
        summary
    }

    fn in_flight_snapshot(&self, limit: usize) -> Vec<InFlightInfo> {
        let mut entries: Vec<InFlightInfo> = self
            .in_flight
            .iter()
            .map(|(id, entry)| entry.info(id))
            .collect();
        entries.sort_by(|a, b| b.elapsed_ms.cmp(&a.elapsed_ms));
        entries.truncate(limit);
        entries
    }

    fn publish_in_flight(&self) {
        let count = self.in_flight.len();
        self.inflight_tx.send_replace(count);
        metrics::set_in_flight(count);
    }

    async fn shutdown(&mut self) {
        info!(
            pools = self.pools.len(),
            in_flight = self.in_flight.len(),
            "router shutting down"
        );

        for (code, pool) in self.pools.drain() {
            debug!(pool = %code, "shutting down pool");
            pool.shutdown().await;
        }

        let remaining = self.in_flight.len();
        if remaining > 0 {
            // Neither acked nor nacked: the broker's visibility timeout
            // returns them to the queue.
            warn!(
                remaining,
                "in-flight pointers left to visibility timeout at shutdown"
            );
            self.in_flight.clear();
            self.publish_in_flight();
        }
    }
}

fn effective_pool_code(pool_code: &str) -> String {
    if pool_code.is_empty() {
        DEFAULT_POOL_CODE.to_string()
    } else {
        pool_code.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_pool_code_defaults() {
        assert_eq!(effective_pool_code(""), DEFAULT_POOL_CODE);
        assert_eq!(effective_pool_code("ORDERS"), "ORDERS");
    }
}

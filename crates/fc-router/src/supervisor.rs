//! Consumer supervisor: per-queue long-poll loops, bounded by the global
//! in-flight cap and gated on the standby role.
//!
//! Each configured queue runs `connections` poll loops. A loop pauses while
//! the instance is not primary, parks when the router's in-flight count
//! reaches the cap (resuming below the 0.75 low-water mark), backs off
//! exponentially on transient broker errors, and stops with a critical
//! warning on fatal ones.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

use fc_broker::{AdapterFactory, QueueAdapter, QueueDepth};
use fc_core::{QueueConfig, WarningCategory, WarningSeverity};
use fc_standby::Role;

use crate::health::HealthService;
use crate::router::RouterHandle;
use crate::warning::WarningService;

const LOW_WATER_RATIO: f64 = 0.75;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Messages per receive call (the broker may cap this lower).
    pub max_batch: u32,
    /// Long-poll wait per receive call.
    pub poll_wait: Duration,
    /// Global bound on pointers admitted but not yet completed.
    pub in_flight_cap: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_batch: 10,
            poll_wait: Duration::from_secs(5),
            in_flight_cap: 1_000,
        }
    }
}

struct QueueRuntime {
    config: QueueConfig,
    adapter: Arc<dyn QueueAdapter>,
    stop_tx: broadcast::Sender<()>,
}

pub struct ConsumerSupervisor {
    router: RouterHandle,
    factory: Arc<dyn AdapterFactory>,
    settings: SupervisorSettings,
    role_rx: watch::Receiver<Role>,
    warnings: Arc<WarningService>,
    health: Arc<HealthService>,
    queues: Mutex<HashMap<String, QueueRuntime>>,
}

impl ConsumerSupervisor {
    pub fn new(
        router: RouterHandle,
        factory: Arc<dyn AdapterFactory>,
        settings: SupervisorSettings,
        role_rx: watch::Receiver<Role>,
        warnings: Arc<WarningService>,
        health: Arc<HealthService>,
    ) -> Self {
        Self {
            router,
            factory,
            settings,
            role_rx,
            warnings,
            health,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile the running consumers with the desired queue set.
    /// Returns `(queues_added, queues_removed)`.
    pub async fn apply_queues(&self, desired: Vec<QueueConfig>) -> (usize, usize) {
        let desired_map: HashMap<String, QueueConfig> = desired
            .into_iter()
            .map(|q| (q.identifier().to_string(), q))
            .collect();

        let mut queues = self.queues.lock().await;
        let mut added = 0;
        let mut removed = 0;

        // Stop consumers whose queue left the configuration (or changed).
        let current: Vec<String> = queues.keys().cloned().collect();
        for queue_id in current {
            let keep = desired_map
                .get(&queue_id)
                .map(|cfg| {
                    queues
                        .get(&queue_id)
                        .map(|rt| rt.config == *cfg)
                        .unwrap_or(false)
                })
                .unwrap_or(false);

            if !keep {
                if let Some(runtime) = queues.remove(&queue_id) {
                    info!(queue = %queue_id, "stopping consumer for removed or changed queue");
                    let _ = runtime.stop_tx.send(());
                    runtime.adapter.stop().await;
                    self.router.deregister_queue(&queue_id).await;
                    self.health.remove_component(&format!("broker:{queue_id}"));
                    removed += 1;
                }
            }
        }

        // Start consumers for queues that are not running yet.
        for (queue_id, config) in desired_map {
            if queues.contains_key(&queue_id) {
                continue;
            }

            match self.factory.create(&config).await {
                Ok(adapter) => {
                    self.router
                        .register_queue(queue_id.clone(), Arc::clone(&adapter))
                        .await;

                    let (stop_tx, _) = broadcast::channel(1);
                    for connection in 0..config.connections.max(1) {
                        self.spawn_poll_loop(
                            queue_id.clone(),
                            connection,
                            Arc::clone(&adapter),
                            stop_tx.subscribe(),
                        );
                    }

                    info!(
                        queue = %queue_id,
                        connections = config.connections.max(1),
                        "consumer started"
                    );
                    self.health
                        .set_component(&format!("broker:{queue_id}"), true, None);
                    queues.insert(
                        queue_id,
                        QueueRuntime {
                            config,
                            adapter,
                            stop_tx,
                        },
                    );
                    added += 1;
                }
                Err(e) => {
                    error!(queue = %queue_id, error = %e, "failed to create queue adapter");
                    self.warnings.add_warning(
                        WarningCategory::QueueConnectivity,
                        WarningSeverity::Critical,
                        format!("Failed to create consumer for queue [{queue_id}]: {e}"),
                        "ConsumerSupervisor".to_string(),
                    );
                    self.health.set_component(
                        &format!("broker:{queue_id}"),
                        false,
                        Some(e.to_string()),
                    );
                }
            }
        }

        (added, removed)
    }

    fn spawn_poll_loop(
        &self,
        queue_id: String,
        connection: u32,
        adapter: Arc<dyn QueueAdapter>,
        mut stop_rx: broadcast::Receiver<()>,
    ) {
        let router = self.router.clone();
        let mut role_rx = self.role_rx.clone();
        let mut inflight_rx = router.in_flight_watch();
        let settings = self.settings.clone();
        let warnings = Arc::clone(&self.warnings);
        let health = Arc::clone(&self.health);

        tokio::spawn(async move {
            debug!(queue = %queue_id, connection, "poll loop started");
            let low_water = (settings.in_flight_cap as f64 * LOW_WATER_RATIO) as usize;
            let mut backoff = Duration::from_secs(1);

            'poll: loop {
                // Standby gate: only the primary consumes. Unacked messages
                // return through the broker's visibility timeout.
                if *role_rx.borrow() != Role::Primary {
                    tokio::select! {
                        _ = stop_rx.recv() => break,
                        changed = role_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            continue;
                        }
                    }
                }

                // Backpressure gate: park at the cap, resume below low water.
                if *inflight_rx.borrow() >= settings.in_flight_cap {
                    debug!(queue = %queue_id, "in-flight cap reached, parking consumer");
                    loop {
                        tokio::select! {
                            _ = stop_rx.recv() => break 'poll,
                            changed = inflight_rx.changed() => {
                                if changed.is_err() {
                                    break 'poll;
                                }
                                if *inflight_rx.borrow() <= low_water {
                                    break;
                                }
                            }
                        }
                    }
                }

                tokio::select! {
                    _ = stop_rx.recv() => break,
                    polled = adapter.receive_batch(settings.max_batch, settings.poll_wait) => {
                        match polled {
                            Ok(batch) => {
                                backoff = Duration::from_secs(1);
                                health.set_component(&format!("broker:{queue_id}"), true, None);
                                if batch.is_empty() {
                                    // Long poll came back dry; loop around.
                                    tokio::time::sleep(Duration::from_millis(50)).await;
                                } else {
                                    router.submit_batch(batch).await;
                                }
                            }
                            Err(e) if e.is_fatal() => {
                                error!(queue = %queue_id, error = %e, "fatal broker error, stopping consumer");
                                warnings.add_warning(
                                    WarningCategory::QueueConnectivity,
                                    WarningSeverity::Critical,
                                    format!("Consumer for [{queue_id}] stopped: {e}"),
                                    "ConsumerSupervisor".to_string(),
                                );
                                health.set_component(
                                    &format!("broker:{queue_id}"),
                                    false,
                                    Some(e.to_string()),
                                );
                                adapter.stop().await;
                                break;
                            }
                            Err(fc_broker::BrokerError::Stopped) => break,
                            Err(e) => {
                                warn!(
                                    queue = %queue_id,
                                    error = %e,
                                    backoff_secs = backoff.as_secs(),
                                    "transient broker error, backing off"
                                );
                                tokio::time::sleep(backoff).await;
                                backoff = (backoff * 2).min(MAX_BACKOFF);
                            }
                        }
                    }
                }
            }

            debug!(queue = %queue_id, connection, "poll loop stopped");
        });
    }

    /// Stop every consumer. Used at shutdown.
    pub async fn stop_all(&self) {
        let mut queues = self.queues.lock().await;
        for (queue_id, runtime) in queues.drain() {
            info!(queue = %queue_id, "stopping consumer");
            let _ = runtime.stop_tx.send(());
            runtime.adapter.stop().await;
        }
    }

    pub async fn queue_ids(&self) -> Vec<String> {
        self.queues.lock().await.keys().cloned().collect()
    }

    /// Broker-side backlog for every running queue, as the backend reports
    /// it. Backends without depth figures are skipped; a failed query logs
    /// and is skipped too, so one sick broker cannot wedge the admin API.
    pub async fn queue_depths(&self) -> Vec<QueueDepth> {
        let queues = self.queues.lock().await;
        let mut depths = Vec::with_capacity(queues.len());

        for (queue_id, runtime) in queues.iter() {
            match runtime.adapter.depth().await {
                Ok(Some(depth)) => depths.push(depth),
                Ok(None) => {
                    debug!(queue = %queue_id, "backend does not report queue depth");
                }
                Err(e) => {
                    warn!(queue = %queue_id, error = %e, "queue depth query failed");
                }
            }
        }

        depths.sort_by(|a, b| a.queue_id.cmp(&b.queue_id));
        depths
    }
}

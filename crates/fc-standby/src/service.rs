//! Standby service: lease-driven PRIMARY/STANDBY role machine.
//!
//! Every refresh tick the standby tries to acquire the lease and the
//! primary refreshes it with a CAS on its own instance id. A failed CAS
//! means another instance owns the lease; the only safe reaction is to
//! demote, deregister, and terminate the process so the orchestrator
//! restarts it cold.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::lease::LeaseStore;
use crate::traffic::TrafficCoordinator;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Standby,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "PRIMARY",
            Role::Standby => "STANDBY",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StandbyConfig {
    pub enabled: bool,
    pub lock_key: String,
    pub lock_ttl: Duration,
    pub refresh_interval: Duration,
    pub instance_id: String,
}

impl Default for StandbyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lock_key: "fc:router:primary".to_string(),
            lock_ttl: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(10),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Snapshot for the admin API.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StandbyStatus {
    pub enabled: bool,
    pub role: String,
    pub store_healthy: bool,
    pub traffic: String,
    pub instance_id: String,
}

pub struct StandbyService {
    config: StandbyConfig,
    store: Option<Arc<dyn LeaseStore>>,
    traffic: Arc<TrafficCoordinator>,
    role_tx: watch::Sender<Role>,
    store_healthy: AtomicBool,
    store_failures: AtomicU32,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl StandbyService {
    /// Coordinated mode: role follows the distributed lease.
    pub fn new(
        config: StandbyConfig,
        store: Arc<dyn LeaseStore>,
        traffic: Arc<TrafficCoordinator>,
    ) -> Self {
        let (role_tx, _) = watch::channel(Role::Standby);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            store: Some(store),
            traffic,
            role_tx,
            store_healthy: AtomicBool::new(true),
            store_failures: AtomicU32::new(0),
            running: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Single-instance mode: always primary, no coordination store.
    pub fn single_node(traffic: Arc<TrafficCoordinator>, instance_id: String) -> Self {
        let config = StandbyConfig {
            enabled: false,
            instance_id,
            ..Default::default()
        };
        let (role_tx, _) = watch::channel(Role::Primary);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            store: None,
            traffic,
            role_tx,
            store_healthy: AtomicBool::new(true),
            store_failures: AtomicU32::new(0),
            running: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn role(&self) -> Role {
        *self.role_tx.borrow()
    }

    pub fn is_primary(&self) -> bool {
        self.role() == Role::Primary
    }

    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    pub fn store_healthy(&self) -> bool {
        self.store_healthy.load(Ordering::SeqCst)
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn status(&self) -> StandbyStatus {
        StandbyStatus {
            enabled: self.config.enabled,
            role: self.role().as_str().to_string(),
            store_healthy: self.store_healthy(),
            traffic: self.traffic.status().to_string(),
            instance_id: self.config.instance_id.clone(),
        }
    }

    /// Start the role machine. `fatal_tx` receives a message when the lease
    /// is lost while primary; the binary turns that into a process exit.
    pub async fn start(self: &Arc<Self>, fatal_tx: mpsc::Sender<String>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(crate::StandbyError::AlreadyRunning);
        }

        if self.store.is_none() {
            info!(
                instance_id = %self.config.instance_id,
                "standby disabled, instance is permanently primary"
            );
            self.set_role(Role::Primary).await;
            return Ok(());
        }

        info!(
            instance_id = %self.config.instance_id,
            lock_key = %self.config.lock_key,
            ttl_secs = self.config.lock_ttl.as_secs(),
            "starting standby coordination"
        );

        // Contend once immediately so a fresh cluster elects within one tick.
        self.tick(&fatal_tx).await;

        let service = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.config.refresh_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        service.tick(&fatal_tx).await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(instance_id = %service.config.instance_id, "standby loop stopping");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    async fn tick(&self, fatal_tx: &mpsc::Sender<String>) {
        let Some(store) = self.store.as_ref() else {
            return;
        };

        match self.role() {
            Role::Primary => {
                match store
                    .refresh(
                        &self.config.lock_key,
                        &self.config.instance_id,
                        self.config.lock_ttl,
                    )
                    .await
                {
                    Ok(true) => {
                        self.mark_store_ok();
                        debug!(instance_id = %self.config.instance_id, "lease refreshed");
                    }
                    Ok(false) => {
                        // Another instance owns the lease. Split-brain risk:
                        // demote, pull out of traffic, and crash on purpose.
                        error!(
                            instance_id = %self.config.instance_id,
                            lock_key = %self.config.lock_key,
                            "CRITICAL: lease lost while primary, demoting and terminating"
                        );
                        self.set_role(Role::Standby).await;
                        let _ = fatal_tx
                            .send("lease lost while primary".to_string())
                            .await;
                    }
                    Err(e) => self.mark_store_error(e.to_string()),
                }
            }
            Role::Standby => {
                match store
                    .try_acquire(
                        &self.config.lock_key,
                        &self.config.instance_id,
                        self.config.lock_ttl,
                    )
                    .await
                {
                    Ok(true) => {
                        self.mark_store_ok();
                        info!(instance_id = %self.config.instance_id, "lease acquired, promoting to primary");
                        self.set_role(Role::Primary).await;
                    }
                    Ok(false) => {
                        self.mark_store_ok();
                        debug!(instance_id = %self.config.instance_id, "lease held by peer");
                    }
                    Err(e) => self.mark_store_error(e.to_string()),
                }
            }
        }
    }

    fn mark_store_ok(&self) {
        self.store_failures.store(0, Ordering::SeqCst);
        if !self.store_healthy.swap(true, Ordering::SeqCst) {
            info!("coordination store reachable again");
        }
    }

    fn mark_store_error(&self, error: String) {
        let failures = self.store_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(failures, error = %error, "coordination store unreachable");

        // One missed cycle is tolerated; beyond that the instance is
        // UNHEALTHY and the health endpoint reports FAILED. The current
        // role is retained.
        if failures > 1 && self.store_healthy.swap(false, Ordering::SeqCst) {
            error!(
                failures,
                "CRITICAL: coordination store unreachable for more than one refresh cycle"
            );
        }
    }

    async fn set_role(&self, role: Role) {
        let previous = *self.role_tx.borrow();
        if previous == role {
            return;
        }

        self.role_tx.send_replace(role);
        metrics::gauge!("standby_role").set(match role {
            Role::Primary => 1.0,
            Role::Standby => 0.0,
        });

        match role {
            Role::Primary => {
                info!(instance_id = %self.config.instance_id, "became PRIMARY");
                self.traffic.register_as_active().await;
            }
            Role::Standby => {
                warn!(instance_id = %self.config.instance_id, "became STANDBY");
                self.traffic.deregister_from_active().await;
            }
        }
    }

    /// Graceful shutdown: release the lease explicitly so the peer takes
    /// over without waiting for the TTL.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        if let Some(store) = self.store.as_ref() {
            if self.is_primary() {
                match store
                    .release(&self.config.lock_key, &self.config.instance_id)
                    .await
                {
                    Ok(true) => info!(instance_id = %self.config.instance_id, "lease released"),
                    Ok(false) => debug!("lease was not held at shutdown"),
                    Err(e) => warn!(error = %e, "lease release failed, peer will wait for TTL"),
                }
            }
        }

        self.set_role(Role::Standby).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::MemoryLeaseStore;

    fn service(
        store: Arc<MemoryLeaseStore>,
        instance_id: &str,
        interval_ms: u64,
    ) -> Arc<StandbyService> {
        let config = StandbyConfig {
            enabled: true,
            lock_key: "test:primary".to_string(),
            lock_ttl: Duration::from_secs(2),
            refresh_interval: Duration::from_millis(interval_ms),
            instance_id: instance_id.to_string(),
        };
        Arc::new(StandbyService::new(
            config,
            store,
            Arc::new(TrafficCoordinator::noop()),
        ))
    }

    #[tokio::test]
    async fn single_node_is_always_primary() {
        let service = Arc::new(StandbyService::single_node(
            Arc::new(TrafficCoordinator::noop()),
            "solo".to_string(),
        ));
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);

        service.start(fatal_tx).await.unwrap();
        assert!(service.is_primary());
    }

    #[tokio::test]
    async fn exactly_one_instance_becomes_primary() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = service(store.clone(), "instance-a", 25);
        let b = service(store.clone(), "instance-b", 25);
        let (fatal_tx, _fatal_rx) = mpsc::channel(4);

        a.start(fatal_tx.clone()).await.unwrap();
        b.start(fatal_tx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let primaries = [a.is_primary(), b.is_primary()]
            .iter()
            .filter(|p| **p)
            .count();
        assert_eq!(primaries, 1, "standby exclusivity violated");
    }

    #[tokio::test]
    async fn graceful_shutdown_hands_over_within_one_tick() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = service(store.clone(), "instance-a", 25);
        let (fatal_tx, _fatal_rx) = mpsc::channel(4);

        a.start(fatal_tx.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(a.is_primary());

        let b = service(store.clone(), "instance-b", 25);
        b.start(fatal_tx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!b.is_primary());

        a.shutdown().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(b.is_primary(), "peer must take over after explicit release");
        assert_eq!(store.holder("test:primary").as_deref(), Some("instance-b"));
    }

    #[tokio::test]
    async fn lost_lease_emits_fatal_event() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = service(store.clone(), "instance-a", 25);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(4);

        a.start(fatal_tx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(a.is_primary());

        // Simulate the lease being stolen (TTL expiry plus a faster peer).
        store.release("test:primary", "instance-a").await.unwrap();
        store
            .try_acquire("test:primary", "intruder", Duration::from_secs(5))
            .await
            .unwrap();

        let fatal = tokio::time::timeout(Duration::from_millis(500), fatal_rx.recv())
            .await
            .expect("fatal event expected")
            .unwrap();
        assert!(fatal.contains("lease lost"));
        assert!(!a.is_primary());
    }
}

//! Consumer supervisor scenarios: standby gating and fatal broker errors.

mod common;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use common::{pointer, pool, wait_until, ScriptedMediator};
use fc_broker::{AdapterFactory, BrokerError, QueueAdapter, QueueDepth};
use fc_core::{QueueConfig, ReceivedPointer};
use fc_router::{
    ConsumerSupervisor, HealthService, Router, RouterOptions, SupervisorSettings,
    WarningService, WarningServiceConfig,
};
use fc_standby::Role;

/// Adapter fed from an in-memory script of batches.
struct ScriptedAdapter {
    id: String,
    batches: parking_lot::Mutex<VecDeque<Vec<ReceivedPointer>>>,
    acked: parking_lot::Mutex<Vec<String>>,
    fail_with: parking_lot::Mutex<Option<BrokerError>>,
    depth: parking_lot::Mutex<Option<QueueDepth>>,
    polls: std::sync::atomic::AtomicU32,
}

impl ScriptedAdapter {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            batches: parking_lot::Mutex::new(VecDeque::new()),
            acked: parking_lot::Mutex::new(Vec::new()),
            fail_with: parking_lot::Mutex::new(None),
            depth: parking_lot::Mutex::new(None),
            polls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    fn push_batch(&self, batch: Vec<ReceivedPointer>) {
        self.batches.lock().push_back(batch);
    }

    fn poll_count(&self) -> u32 {
        self.polls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueAdapter for ScriptedAdapter {
    fn identifier(&self) -> &str {
        &self.id
    }

    async fn receive_batch(
        &self,
        _max_messages: u32,
        wait: Duration,
    ) -> fc_broker::Result<Vec<ReceivedPointer>> {
        self.polls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        if let Some(error) = self.fail_with.lock().take() {
            return Err(error);
        }

        if let Some(batch) = self.batches.lock().pop_front() {
            return Ok(batch);
        }

        // Simulate an empty long poll without spinning the loop hot.
        tokio::time::sleep(wait.min(Duration::from_millis(20))).await;
        Ok(Vec::new())
    }

    async fn ack(&self, receipt_handle: &str) -> fc_broker::Result<()> {
        self.acked.lock().push(receipt_handle.to_string());
        Ok(())
    }

    async fn nack(&self, _receipt_handle: &str, _delay_seconds: u32) -> fc_broker::Result<()> {
        Ok(())
    }

    async fn extend_visibility(&self, _receipt_handle: &str, _seconds: u32) -> fc_broker::Result<()> {
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }

    async fn stop(&self) {}

    async fn depth(&self) -> fc_broker::Result<Option<QueueDepth>> {
        Ok(self.depth.lock().clone())
    }
}

struct StubFactory {
    adapter: Arc<ScriptedAdapter>,
}

#[async_trait]
impl AdapterFactory for StubFactory {
    async fn create(&self, _config: &QueueConfig) -> fc_broker::Result<Arc<dyn QueueAdapter>> {
        Ok(self.adapter.clone())
    }
}

fn queue(uri: &str) -> QueueConfig {
    QueueConfig {
        queue_name: uri.to_string(),
        queue_uri: uri.to_string(),
        connections: 1,
    }
}

struct Fixture {
    supervisor: Arc<ConsumerSupervisor>,
    adapter: Arc<ScriptedAdapter>,
    role_tx: tokio::sync::watch::Sender<Role>,
    warnings: Arc<WarningService>,
    mediator: Arc<ScriptedMediator>,
}

async fn fixture(initial_role: Role) -> Fixture {
    let mediator = Arc::new(ScriptedMediator::new(Duration::from_millis(5)));
    let warnings = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let health = Arc::new(HealthService::new());
    let router = Router::spawn(
        mediator.clone(),
        warnings.clone(),
        RouterOptions::default(),
    );
    router.reconfigure(vec![pool("P", 4)]).await;

    let adapter = Arc::new(ScriptedAdapter::new("scripted-queue"));
    let (role_tx, role_rx) = tokio::sync::watch::channel(initial_role);

    let supervisor = Arc::new(ConsumerSupervisor::new(
        router,
        Arc::new(StubFactory {
            adapter: adapter.clone(),
        }),
        SupervisorSettings {
            max_batch: 10,
            poll_wait: Duration::from_millis(20),
            in_flight_cap: 100,
        },
        role_rx,
        warnings.clone(),
        health,
    ));

    Fixture {
        supervisor,
        adapter,
        role_tx,
        warnings,
        mediator,
    }
}

#[tokio::test]
async fn primary_consumes_and_acks() {
    let f = fixture(Role::Primary).await;
    f.adapter
        .push_batch(vec![pointer("p1", "P", Some("g")), pointer("p2", "P", Some("g"))]);

    let (added, removed) = f.supervisor.apply_queues(vec![queue("scripted-queue")]).await;
    assert_eq!((added, removed), (1, 0));

    assert!(
        wait_until(|| f.adapter.acked.lock().len() == 2, Duration::from_secs(5)).await,
        "batch must be consumed and acked"
    );
    assert_eq!(f.mediator.processed(), vec!["p1", "p2"]);
}

#[tokio::test]
async fn standby_does_not_consume_until_promoted() {
    let f = fixture(Role::Standby).await;
    f.adapter.push_batch(vec![pointer("p1", "P", Some("g"))]);
    f.supervisor.apply_queues(vec![queue("scripted-queue")]).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(f.adapter.poll_count(), 0, "standby must not poll");
    assert!(f.mediator.processed().is_empty());

    // Promotion starts consumption.
    f.role_tx.send_replace(Role::Primary);
    assert!(
        wait_until(|| f.adapter.acked.lock().len() == 1, Duration::from_secs(5)).await,
        "promoted instance must consume"
    );
}

#[tokio::test]
async fn demotion_pauses_consumption() {
    let f = fixture(Role::Primary).await;
    f.supervisor.apply_queues(vec![queue("scripted-queue")]).await;

    assert!(
        wait_until(|| f.adapter.poll_count() > 0, Duration::from_secs(2)).await,
        "primary must poll"
    );

    f.role_tx.send_replace(Role::Standby);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let polls_at_demotion = f.adapter.poll_count();

    tokio::time::sleep(Duration::from_millis(300)).await;
    // A poll already in flight may finish, but no new loop iterations run.
    assert!(f.adapter.poll_count() <= polls_at_demotion + 1);
}

#[tokio::test]
async fn fatal_broker_error_stops_consumer_with_critical_warning() {
    let f = fixture(Role::Primary).await;
    *f.adapter.fail_with.lock() = Some(BrokerError::Fatal("credentials invalid".to_string()));

    f.supervisor.apply_queues(vec![queue("scripted-queue")]).await;

    assert!(
        wait_until(|| f.warnings.critical_count() > 0, Duration::from_secs(2)).await,
        "fatal error must raise a critical warning"
    );

    let polls_after_failure = f.adapter.poll_count();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        f.adapter.poll_count(),
        polls_after_failure,
        "consumer must stop after a fatal error"
    );
}

#[tokio::test]
async fn queue_depths_surface_broker_backlog() {
    let f = fixture(Role::Standby).await;
    *f.adapter.depth.lock() = Some(QueueDepth {
        queue_id: "scripted-queue".to_string(),
        pending: 41,
        in_flight: 3,
    });

    f.supervisor.apply_queues(vec![queue("scripted-queue")]).await;

    let depths = f.supervisor.queue_depths().await;
    assert_eq!(depths.len(), 1);
    assert_eq!(depths[0].queue_id, "scripted-queue");
    assert_eq!(depths[0].pending, 41);
    assert_eq!(depths[0].in_flight, 3);

    // Backends without figures are skipped, not reported as zeroes.
    *f.adapter.depth.lock() = None;
    assert!(f.supervisor.queue_depths().await.is_empty());
}

#[tokio::test]
async fn removed_queue_stops_its_consumer() {
    let f = fixture(Role::Primary).await;
    f.supervisor.apply_queues(vec![queue("scripted-queue")]).await;
    assert_eq!(f.supervisor.queue_ids().await.len(), 1);

    let (added, removed) = f.supervisor.apply_queues(vec![]).await;
    assert_eq!((added, removed), (0, 1));
    assert!(f.supervisor.queue_ids().await.is_empty());
}

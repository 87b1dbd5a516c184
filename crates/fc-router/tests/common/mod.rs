//! Shared test doubles: a scripted mediator and a recording queue adapter.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fc_broker::QueueAdapter;
use fc_core::{
    DispatchMode, MediationOutcome, MediationType, MessagePointer, PoolConfig, ReceivedPointer,
};
use fc_router::{Delivery, DeliverySpec, Mediator, Router, RouterHandle, RouterOptions,
    WarningService, WarningServiceConfig,
};

/// Mediator that records delivery order and returns scripted outcomes.
pub struct ScriptedMediator {
    delay: Duration,
    processed: parking_lot::Mutex<Vec<String>>,
    script: parking_lot::Mutex<HashMap<String, MediationOutcome>>,
}

impl ScriptedMediator {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            processed: parking_lot::Mutex::new(Vec::new()),
            script: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Override the outcome for one pointer id; everything else succeeds.
    pub fn script(&self, pointer_id: &str, outcome: MediationOutcome) {
        self.script
            .lock()
            .insert(pointer_id.to_string(), outcome);
    }

    pub fn processed(&self) -> Vec<String> {
        self.processed.lock().clone()
    }
}

#[async_trait]
impl Mediator for ScriptedMediator {
    async fn deliver(&self, pointer: &MessagePointer, _spec: &DeliverySpec) -> Delivery {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.processed.lock().push(pointer.id.clone());

        let outcome = self
            .script
            .lock()
            .get(&pointer.id)
            .cloned()
            .unwrap_or(MediationOutcome::Success);

        let server_fault = matches!(outcome, MediationOutcome::Nack { .. });
        Delivery {
            outcome,
            status_code: None,
            server_fault,
        }
    }
}

/// Adapter that records the router's ack/nack decisions.
pub struct RecordingAdapter {
    id: String,
    acked: parking_lot::Mutex<Vec<String>>,
    nacked: parking_lot::Mutex<Vec<(String, u32)>>,
}

impl RecordingAdapter {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            acked: parking_lot::Mutex::new(Vec::new()),
            nacked: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().clone()
    }

    pub fn nacked(&self) -> Vec<(String, u32)> {
        self.nacked.lock().clone()
    }

    pub fn completed_count(&self) -> usize {
        self.acked.lock().len() + self.nacked.lock().len()
    }
}

#[async_trait]
impl QueueAdapter for RecordingAdapter {
    fn identifier(&self) -> &str {
        &self.id
    }

    async fn receive_batch(
        &self,
        _max_messages: u32,
        _wait: Duration,
    ) -> fc_broker::Result<Vec<ReceivedPointer>> {
        Ok(Vec::new())
    }

    async fn ack(&self, receipt_handle: &str) -> fc_broker::Result<()> {
        self.acked.lock().push(receipt_handle.to_string());
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: u32) -> fc_broker::Result<()> {
        self.nacked
            .lock()
            .push((receipt_handle.to_string(), delay_seconds));
        Ok(())
    }

    async fn extend_visibility(&self, _receipt_handle: &str, _seconds: u32) -> fc_broker::Result<()> {
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }

    async fn stop(&self) {}
}

pub fn pointer(id: &str, pool: &str, group: Option<&str>) -> ReceivedPointer {
    pointer_with_mode(id, pool, group, DispatchMode::BlockOnError)
}

pub fn pointer_with_mode(
    id: &str,
    pool: &str,
    group: Option<&str>,
    mode: DispatchMode,
) -> ReceivedPointer {
    ReceivedPointer {
        pointer: MessagePointer {
            id: id.to_string(),
            pool_code: pool.to_string(),
            auth_token: None,
            mediation_type: MediationType::HTTP,
            mediation_target: "http://localhost:9/unused".to_string(),
            message_group_id: group.map(|g| g.to_string()),
            dispatch_mode: mode,
        },
        receipt_handle: format!("r-{id}"),
        broker_message_id: Some(format!("b-{id}")),
        queue_id: "test-queue".to_string(),
        receive_count: 1,
    }
}

pub fn pool(code: &str, concurrency: u32) -> PoolConfig {
    PoolConfig {
        concurrency,
        idle_worker_timeout_ms: 60_000,
        ..PoolConfig::named(code)
    }
}

pub async fn setup(
    pools: Vec<PoolConfig>,
    mediator: Arc<ScriptedMediator>,
    options: RouterOptions,
) -> (RouterHandle, Arc<RecordingAdapter>) {
    let warnings = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let router = Router::spawn(mediator, warnings, options);

    let adapter = Arc::new(RecordingAdapter::new("test-queue"));
    router
        .register_queue("test-queue".to_string(), adapter.clone())
        .await;
    router.reconfigure(pools).await;

    (router, adapter)
}

/// Poll until `predicate` holds or the deadline lapses.
pub async fn wait_until<F: Fn() -> bool>(predicate: F, deadline: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

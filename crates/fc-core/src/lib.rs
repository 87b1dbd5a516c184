use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use utoipa::ToSchema;

pub mod logging;
pub mod tsid;

// ============================================================================
// Secrets
// ============================================================================

/// Opaque secret value. Serializes transparently on the wire but never leaks
/// through `Debug` or `Display`, so pointers and config snapshots can be
/// logged freely.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the underlying value. Call sites are the only audit surface.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Core Pointer Types
// ============================================================================

/// Dispatch mode controlling the FIFO failure policy within a batch+group.
///
/// Travels on the pointer; producers that omit it get `BlockOnError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchMode {
    /// A failed delivery skips the remaining pointers of the same
    /// batch+group (they are NACKed without attempting delivery).
    BlockOnError,
    /// A failed delivery does not affect the rest of the batch+group.
    NextOnError,
    /// No ordering enforcement beyond what the broker provides.
    Immediate,
}

impl Default for DispatchMode {
    fn default() -> Self {
        DispatchMode::BlockOnError
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub enum MediationType {
    HTTP,
}

/// The pointer record that flows through the router. The payload itself
/// stays wherever the producer put it; the router only brokers pointers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePointer {
    /// Business identifier, unique across retries (TSID).
    pub id: String,
    #[serde(default)]
    pub pool_code: String,
    /// Bearer token presented to the mediation target.
    #[serde(default)]
    pub auth_token: Option<Secret>,
    pub mediation_type: MediationType,
    pub mediation_target: String,
    /// FIFO lane within the pool. `None` maps to the default group.
    #[serde(default)]
    pub message_group_id: Option<String>,
    #[serde(default)]
    pub dispatch_mode: DispatchMode,
}

/// A pointer as received from a broker, with the delivery bookkeeping the
/// adapter needs to ACK or NACK it later.
#[derive(Debug, Clone)]
pub struct ReceivedPointer {
    pub pointer: MessagePointer,
    /// Opaque handle the adapter resolves back to the broker message.
    pub receipt_handle: String,
    /// The broker's own message id, when the backend exposes one.
    pub broker_message_id: Option<String>,
    pub queue_id: String,
    /// How many times the broker has delivered this message (1 = first).
    pub receive_count: u32,
}

/// Terminal decision for one pointer, sent back to the owning adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Nack { delay_seconds: u32 },
}

// ============================================================================
// Mediation Outcome
// ============================================================================

/// Classified outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediationOutcome {
    /// Delivered; the pointer is removed from the queue.
    Success,
    /// Transient failure; return to the queue after `delay_seconds`.
    Nack { delay_seconds: u32, reason: String },
    /// Permanent misconfiguration; no retry will ever succeed. The pointer
    /// is ACKed as poison with an audit-worthy log entry.
    ErrorConfig { reason: String },
}

impl MediationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            MediationOutcome::Success => "success",
            MediationOutcome::Nack { .. } => "nack",
            MediationOutcome::ErrorConfig { .. } => "error_config",
        }
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

fn default_concurrency() -> u32 {
    10
}

fn default_idle_worker_timeout_ms() -> u64 {
    300_000
}

fn default_mediator_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_min_ms() -> u64 {
    1_000
}

fn default_retry_max_ms() -> u64 {
    300_000
}

fn default_rate_limit_park_max_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub code: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default = "default_idle_worker_timeout_ms")]
    pub idle_worker_timeout_ms: u64,
    #[serde(default = "default_mediator_timeout_ms")]
    pub mediator_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_min_ms")]
    pub retry_min_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// How long a worker may park waiting for a rate-limit token before the
    /// pointer is NACKed back to the broker.
    #[serde(default = "default_rate_limit_park_max_ms")]
    pub rate_limit_park_max_ms: u64,
}

impl PoolConfig {
    pub fn named(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            concurrency: default_concurrency(),
            rate_limit_per_minute: None,
            idle_worker_timeout_ms: default_idle_worker_timeout_ms(),
            mediator_timeout_ms: default_mediator_timeout_ms(),
            max_retries: default_max_retries(),
            retry_min_ms: default_retry_min_ms(),
            retry_max_ms: default_retry_max_ms(),
            rate_limit_park_max_ms: default_rate_limit_park_max_ms(),
        }
    }
}

fn default_connections() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default)]
    pub queue_name: String,
    pub queue_uri: String,
    /// Number of concurrent long-poll loops for this queue.
    #[serde(default = "default_connections")]
    pub connections: u32,
}

impl QueueConfig {
    /// Stable identifier for the queue: the name when present, else the URI.
    pub fn identifier(&self) -> &str {
        if self.queue_name.is_empty() {
            &self.queue_uri
        } else {
            &self.queue_name
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    #[serde(default)]
    pub processing_pools: Vec<PoolConfig>,
    #[serde(default = "default_connections")]
    pub connections: u32,
}

// ============================================================================
// Warning System Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum WarningCategory {
    Routing,
    Processing,
    Configuration,
    RateLimiting,
    QueueConnectivity,
    PoolHealth,
    ConsumerHealth,
    Coordination,
    Resource,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Warning {
    pub fn new(
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message,
            source,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes()
    }
}

// ============================================================================
// Health & Stats Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Up,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

/// Point-in-time statistics for one pool, served by the admin API.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub pool_code: String,
    pub concurrency: u32,
    pub active_group_workers: u32,
    pub queue_depth: u32,
    pub rate_limit_per_minute: Option<u32>,
    pub circuit_state: String,
    pub metrics: Option<PoolThroughput>,
}

/// Sliding-window throughput figures for one pool.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolThroughput {
    pub total_success: u64,
    pub total_failure: u64,
    pub total_rate_parked: u64,
    pub success_rate: f64,
    pub avg_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub sample_count: u64,
}

/// One entry of the router's in-flight table, as exposed to operators.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InFlightInfo {
    pub pointer_id: String,
    pub broker_message_id: Option<String>,
    pub queue_id: String,
    pub pool_code: String,
    pub group_id: String,
    pub batch_id: String,
    pub elapsed_ms: u64,
}

/// Internal in-flight record owned by the router actor.
#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub pointer: MessagePointer,
    pub receipt_handle: String,
    pub broker_message_id: Option<String>,
    pub queue_id: String,
    pub batch_id: std::sync::Arc<str>,
    pub group_id: std::sync::Arc<str>,
    pub receive_count: u32,
    pub entered_at: Instant,
}

impl InFlightEntry {
    pub fn info(&self, pointer_id: &str) -> InFlightInfo {
        InFlightInfo {
            pointer_id: pointer_id.to_string(),
            broker_message_id: self.broker_message_id.clone(),
            queue_id: self.queue_id.clone(),
            pool_code: self.pointer.pool_code.clone(),
            group_id: self.group_id.to_string(),
            batch_id: self.batch_id.to_string(),
            elapsed_ms: self.entered_at.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_redacted_in_debug() {
        let pointer = MessagePointer {
            id: "0HZXEQ5Y8JY5Z".to_string(),
            pool_code: "ORDERS".to_string(),
            auth_token: Some(Secret::new("hunter2-token")),
            mediation_type: MediationType::HTTP,
            mediation_target: "https://example.com/hook".to_string(),
            message_group_id: None,
            dispatch_mode: DispatchMode::BlockOnError,
        };

        let rendered = format!("{:?}", pointer);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("Secret(***)"));
    }

    #[test]
    fn pointer_deserializes_with_defaults() {
        let json = r#"{
            "id": "0HZXEQ5Y8JY5Z",
            "mediationType": "HTTP",
            "mediationTarget": "https://example.com/hook"
        }"#;

        let pointer: MessagePointer = serde_json::from_str(json).unwrap();
        assert_eq!(pointer.pool_code, "");
        assert_eq!(pointer.message_group_id, None);
        assert_eq!(pointer.dispatch_mode, DispatchMode::BlockOnError);
    }

    #[test]
    fn pool_config_deserializes_with_defaults() {
        let json = r#"{"code": "ORDERS", "concurrency": 4}"#;
        let config: PoolConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.idle_worker_timeout_ms, 300_000);
        assert_eq!(config.mediator_timeout_ms, 30_000);
        assert_eq!(config.rate_limit_per_minute, None);
    }

    #[test]
    fn queue_identifier_falls_back_to_uri() {
        let q = QueueConfig {
            queue_name: String::new(),
            queue_uri: "sqlite://orders.fifo".to_string(),
            connections: 1,
        };
        assert_eq!(q.identifier(), "sqlite://orders.fifo");
    }
}

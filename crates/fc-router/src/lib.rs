//! FlowCatalyst Message Router core.
//!
//! Consumes pointer messages from external queues, delivers each pointer's
//! payload location to a configured HTTP endpoint, and guarantees
//! per-message-group FIFO ordering under concurrency limits, token-bucket
//! rate limits, and circuit breakers. Coordination across a warm-standby
//! pair lives in `fc-standby`; the queue backends in `fc-broker`.
//!
//! The concurrency model is actor-shaped: the router actor owns the
//! in-flight table, one scheduler actor owns each pool, and one worker task
//! owns each active `{pool, group}` FIFO lane. Bounded channels connect
//! them, with replies on oneshot channels carried inside the commands.

pub mod api;
pub mod breaker;
pub mod config_fetch;
pub mod credentials;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod limiter;
pub mod mediator;
pub mod metrics;
pub mod pool;
pub mod pool_metrics;
pub mod router;
pub mod settings;
pub mod supervisor;
pub mod warning;

mod worker;

pub use breaker::{BreakerDecision, BreakerSettings, BreakerState, BreakerStats, CircuitBreaker};
pub use config_fetch::{
    merge_sources, spawn_config_sync_task, ConfigFetcher, ConfigFetcherSettings,
};
pub use credentials::{CredentialsCache, OAuthClientCredentials, WebhookCredentials};
pub use error::RouterError;
pub use health::HealthService;
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use limiter::RateGate;
pub use mediator::{Delivery, DeliverySpec, HttpMediator, Mediator, SigningConfig};
pub use router::{ReconfigureSummary, Router, RouterHandle, RouterOptions};
pub use settings::RouterSettings;
pub use supervisor::{ConsumerSupervisor, SupervisorSettings};
pub use warning::{WarningService, WarningServiceConfig};

pub type Result<T> = std::result::Result<T, RouterError>;

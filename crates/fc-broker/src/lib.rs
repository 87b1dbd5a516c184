//! Queue adapters: a uniform pull/ack/nack surface over SQS FIFO, ActiveMQ,
//! NATS JetStream, and an embedded SQLite FIFO broker.
//!
//! Each backend preserves per-group ordering when consumed by a single
//! consumer; the router builds its FIFO guarantees on top of that.

use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use fc_core::{MessagePointer, QueueConfig, ReceivedPointer};

pub mod error;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqs")]
pub mod sqs;

#[cfg(feature = "activemq")]
pub mod activemq;

#[cfg(feature = "nats")]
pub mod nats;

pub use error::BrokerError;

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Approximate queue depth, for monitoring.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepth {
    pub queue_id: String,
    pub pending: u64,
    pub in_flight: u64,
}

/// Pull/ack/nack surface over one queue.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Stable identifier for this queue (name or URI).
    fn identifier(&self) -> &str;

    /// Long-poll for up to `max_messages`, waiting at most `wait`.
    async fn receive_batch(&self, max_messages: u32, wait: Duration)
        -> Result<Vec<ReceivedPointer>>;

    /// Remove the message from the queue. Idempotent: an expired or unknown
    /// handle logs and returns Ok.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Return the message to the queue for redelivery after `delay_seconds`.
    /// Backends without an explicit NACK fall back to visibility expiry.
    async fn nack(&self, receipt_handle: &str, delay_seconds: u32) -> Result<()>;

    /// Extend the visibility window for a message still being processed.
    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()>;

    fn is_healthy(&self) -> bool;

    async fn stop(&self);

    /// Approximate depth figures; `None` when the backend cannot report them.
    async fn depth(&self) -> Result<Option<QueueDepth>> {
        Ok(None)
    }
}

/// Publish surface, used by the dev seeding endpoint and tests.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    fn identifier(&self) -> &str;

    async fn publish(&self, pointer: MessagePointer) -> Result<String>;

    async fn publish_batch(&self, pointers: Vec<MessagePointer>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            ids.push(self.publish(pointer).await?);
        }
        Ok(ids)
    }
}

/// Which backend family a queue URI belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Sqs,
    Embedded,
    ActiveMq,
    Nats,
}

impl FromStr for QueueKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "SQS" => Ok(QueueKind::Sqs),
            "EMBEDDED" => Ok(QueueKind::Embedded),
            "ACTIVEMQ" => Ok(QueueKind::ActiveMq),
            "NATS" => Ok(QueueKind::Nats),
            other => Err(BrokerError::Config(format!("unknown queue type: {other}"))),
        }
    }
}

/// Creates adapters for queues as they appear in configuration.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn create(&self, config: &QueueConfig) -> Result<Arc<dyn QueueAdapter>>;
}

/// Factory over the concrete backends, parameterized by the shared client
/// each backend needs. The binary builds exactly one variant from
/// `QUEUE_TYPE`.
pub enum BackendFactory {
    #[cfg(feature = "sqs")]
    Sqs {
        client: aws_sdk_sqs::Client,
        visibility_timeout_seconds: u32,
    },
    #[cfg(feature = "sqlite")]
    Embedded {
        pool: sqlx::Pool<sqlx::Sqlite>,
        visibility_timeout_seconds: u32,
    },
    #[cfg(feature = "activemq")]
    ActiveMq { uri: String },
    #[cfg(feature = "nats")]
    Nats {
        context: async_nats::jetstream::Context,
        ack_wait_seconds: u32,
    },
}

#[async_trait]
impl AdapterFactory for BackendFactory {
    async fn create(&self, config: &QueueConfig) -> Result<Arc<dyn QueueAdapter>> {
        match self {
            #[cfg(feature = "sqs")]
            BackendFactory::Sqs {
                client,
                visibility_timeout_seconds,
            } => Ok(Arc::new(sqs::SqsAdapter::from_queue_url(
                client.clone(),
                config.queue_uri.clone(),
                *visibility_timeout_seconds as i32,
            ))),
            #[cfg(feature = "sqlite")]
            BackendFactory::Embedded {
                pool,
                visibility_timeout_seconds,
            } => {
                let adapter = sqlite::SqliteBroker::new(
                    pool.clone(),
                    config.identifier().to_string(),
                    *visibility_timeout_seconds,
                );
                adapter.init_schema().await?;
                Ok(Arc::new(adapter))
            }
            #[cfg(feature = "activemq")]
            BackendFactory::ActiveMq { uri } => {
                let adapter =
                    activemq::AmqpAdapter::connect(uri, config.identifier()).await?;
                Ok(Arc::new(adapter))
            }
            #[cfg(feature = "nats")]
            BackendFactory::Nats {
                context,
                ack_wait_seconds,
            } => {
                let adapter = nats::JetStreamAdapter::bind(
                    context.clone(),
                    config.identifier(),
                    Duration::from_secs(*ack_wait_seconds as u64),
                )
                .await?;
                Ok(Arc::new(adapter))
            }
        }
    }
}

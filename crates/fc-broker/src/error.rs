use thiserror::Error;

/// Broker failures, split along the recovery policy: transient errors are
/// retried with backoff by the poll loop, fatal errors stop the consumer
/// and raise a critical warning.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("transient broker error: {0}")]
    Transient(String),

    #[error("fatal broker error: {0}")]
    Fatal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown receipt handle: {0}")]
    UnknownHandle(String),

    #[error("adapter is stopped")]
    Stopped,

    #[error("configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Whether the consumer loop should give up instead of backing off.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Fatal(_) | BrokerError::Config(_))
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for BrokerError {
    fn from(e: sqlx::Error) -> Self {
        BrokerError::Transient(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

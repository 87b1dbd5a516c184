use thiserror::Error;

#[derive(Error, Debug)]
pub enum StandbyError {
    #[error("coordination store connection error: {0}")]
    Connection(String),

    #[error("coordination store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("already running")]
    AlreadyRunning,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StandbyError>;

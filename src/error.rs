use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Data lock lost for job {0}, buffered writes discarded")]
    LockLost(String),

    #[error("Operation cancelled while waiting for the data lock")]
    Cancelled,

    #[error("Invalid admin secret")]
    Unauthorized,

    #[error("Store integrity error: {0}")]
    Integrity(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Redis error: {0}")]
    Redis(#[from] fred::error::Error),

    #[error("Data source error: {0}")]
    DataSource(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;

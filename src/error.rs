//! Error types for leasehold

use thiserror::Error;

/// Main error type for leasehold
#[derive(Error, Debug)]
pub enum Error {
    #[error("Shard list is empty")]
    OptionEmpty,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Rebuild failed: {0}")]
    Rebuild(#[source] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote store (transport) errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Pool checkout failed: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("Pool creation failed: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),

    #[error("Command timed out")]
    Timeout,

    #[error("Increment or decrement would overflow")]
    Overflow,

    #[error("Wrong value type at key {0}")]
    WrongType(String),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}

impl Error {
    /// True for transport failures the caller may retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(
                StoreError::Redis(_) | StoreError::Pool(_) | StoreError::Timeout
            )
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

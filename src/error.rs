//! Error types for the Ratewarden service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors that escaped the limiter (startup only)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for ServiceError {
    fn from(err: config::ConfigError) -> Self {
        ServiceError::Config(err.to_string())
    }
}

/// Errors returned by a counter store.
///
/// The limiter treats every variant the same way: the call is served from the
/// local store instead.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or the handshake failed
    #[error("Store connection failed: {0}")]
    Connection(String),

    /// The store was reached but the command failed
    #[error("Store command failed: {0}")]
    Command(#[from] redis::RedisError),

    /// Connect or command did not finish in time
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The store refuses all work
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

//! Error types for the seckill core.
//!
//! Only infrastructure faults live here. Business rejections (rate limited,
//! sold out, already participated, ...) are ordinary values of
//! [`RejectionReason`](crate::reservation::RejectionReason) so that callers can
//! tell "try again" apart from "this is final" without matching on errors.

use std::time::Duration;
use thiserror::Error;

/// Result type for seckill operations.
pub type Result<T> = std::result::Result<T, SeckillError>;

/// Main error type for seckill operations.
#[derive(Debug, Error)]
pub enum SeckillError {
    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connection error (e.g., Redis connection failed).
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// The lock could not be acquired before the wait time elapsed.
    #[error("Timed out after {waited:?} waiting for lock {key}")]
    LockTimeout {
        /// The contended lock key.
        key: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// No activity record exists for the id.
    #[error("Activity not found: {0}")]
    ActivityNotFound(u64),

    /// The activity definition is malformed.
    #[error("Invalid activity: {0}")]
    InvalidActivity(String),

    /// The purchase request itself is malformed (e.g. zero quantity).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SeckillError {
    /// Whether the error came from the shared store rather than from the caller's input.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Connection(_))
    }
}

/// Storage-related errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Generic storage operation failed.
    #[error("{message}")]
    OperationFailed {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Atomic operation failed (optimistic transaction kept conflicting).
    #[error("Atomic operation failed, state was modified concurrently")]
    AtomicConflict,

    /// Connection pool exhausted.
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// The store cannot be reached at all.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Create a new operation failed error.
    pub fn operation_failed(message: impl Into<String>, retryable: bool) -> Self {
        Self::OperationFailed {
            message: message.into(),
            retryable,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::OperationFailed { retryable, .. } => *retryable,
            Self::AtomicConflict | Self::PoolExhausted | Self::Unavailable(_) => true,
            Self::Serialization(_) => false,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid quota configuration.
    #[error("Invalid quota: {0}")]
    InvalidQuota(String),

    /// Unknown limiter strategy name.
    #[error("Unknown limiter algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Invalid lock timing.
    #[error("Invalid lock configuration: {0}")]
    InvalidLock(String),

    /// Invalid storage configuration.
    #[error("Invalid storage configuration: {0}")]
    InvalidStorage(String),

    /// Missing required configuration.
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    /// A setting could not be parsed.
    #[error("Invalid value {value:?} for {name}")]
    InvalidValue {
        /// Setting name.
        name: String,
        /// Raw value.
        value: String,
    },
}

/// Connection-related errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to connect.
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    /// Connection timeout.
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),

    /// Connection closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    Closed,
}

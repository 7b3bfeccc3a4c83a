//! Error types for stats-refresh-consumer
//!
//! Error hierarchy covering:
//! - Queue store (Redis) transport errors
//! - Wire message schema violations
//! - External batch processor failures
//! - Configuration errors
//! - Shutdown and loop-termination conditions
//!
//! Per-message errors (`MalformedMessageError`, `RefreshFailure`) are handled
//! inside a single loop iteration and never reach the process boundary.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for the consumer
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Queue store errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Wire message schema violations
    #[error("Malformed message: {0}")]
    Malformed(#[from] MalformedMessageError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A message could not be serialized for a push
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    /// The store kept failing mid-run
    #[error("Giving up after {count} consecutive transport errors: {last}")]
    TooManyTransportErrors { count: u32, last: TransportError },

    /// Draining took longer than the grace ceiling
    #[error("{0}")]
    ShutdownTimeout(#[from] ShutdownTimeoutExceeded),

    /// The consumer task died unexpectedly
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Queue store errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Could not establish a connection
    #[error("Failed to connect to Redis at '{addr}': {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connect did not complete in time
    #[error("Timed out connecting to Redis at '{addr}' after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// Command failed because the connection dropped
    #[error("Connection to Redis lost: {0}")]
    ConnectionLost(String),

    /// Command was rejected or returned an unexpected reply
    #[error("Redis command '{command}' failed: {reason}")]
    CommandFailed { command: &'static str, reason: String },

    /// Transport has already been closed
    #[error("Transport is closed")]
    Closed,
}

impl TransportError {
    /// Whether the error means the store is unreachable, as opposed to a
    /// rejected command
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed { .. }
                | TransportError::ConnectTimeout { .. }
                | TransportError::ConnectionLost(_)
                | TransportError::Closed
        )
    }

    pub(crate) fn from_redis(command: &'static str, err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            TransportError::ConnectionLost(err.to_string())
        } else {
            TransportError::CommandFailed {
                command,
                reason: err.to_string(),
            }
        }
    }
}

impl From<redis::RedisError> for TransportError {
    fn from(err: redis::RedisError) -> Self {
        TransportError::from_redis("unknown", err)
    }
}

/// Wire message schema violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedMessageError {
    /// Payload is not valid JSON
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(String),

    /// Payload is JSON but not an object
    #[error("Payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// A required field is absent
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    /// A field has the wrong JSON type or an out-of-range value
    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// retryCount exceeds the retry ceiling
    #[error("retryCount {retry_count} exceeds the retry ceiling {max_retries}")]
    RetryCountOutOfRange { retry_count: u32, max_retries: u32 },
}

/// The external batch processor failed for one user
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Refresh failed for user {user_id}: {reason}")]
pub struct RefreshFailure {
    /// User whose refresh failed
    pub user_id: u64,
    /// Human-readable cause
    pub reason: String,
}

impl RefreshFailure {
    pub fn new(user_id: u64, reason: impl Into<String>) -> Self {
        Self {
            user_id,
            reason: reason.into(),
        }
    }
}

/// Draining exceeded the graceful shutdown ceiling
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("ShutdownTimeoutExceeded: in-flight work did not finish within {grace:?}; the current message may be lost")]
pub struct ShutdownTimeoutExceeded {
    pub grace: Duration,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Redis port out of range
    #[error("Invalid Redis port {0}: must be between 1 and 65535")]
    InvalidPort(u16),

    /// Grace ceiling too small
    #[error("Invalid graceful shutdown timeout {0}s: must be at least 1 second")]
    InvalidShutdownTimeout(u64),

    /// Dead-letter cap too small
    #[error("Invalid failed queue size {0}: must be at least 1")]
    InvalidFailedQueueSize(u64),

    /// Log level not understood by the filter parser
    #[error("Invalid log level '{level}': {reason}")]
    InvalidLogLevel { level: String, reason: String },

    /// Batch processor command missing or empty
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Result type for queue store operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

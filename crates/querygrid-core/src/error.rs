//! Error types shared by every QueryGrid component.
//!
//! Errors are `Clone` because a single backend failure is fanned out to
//! every caller coalesced onto the same fingerprint.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for QueryGrid operations.
pub type QueryResult<T> = Result<T, QueryError>;

/// Failures reported by the backend transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("backend call timed out: {0}")]
    Timeout(String),

    #[error("backend returned an error: {0}")]
    Backend(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Unreachable(_) | TransportError::Timeout(_) | TransportError::Closed
        )
    }

    /// Whether the connection that produced this error must not be reused.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Unreachable(_) | TransportError::Protocol(_) | TransportError::Closed
        )
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors surfaced to callers of the QueryGrid layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("connection pool exhausted (waited {timeout:?})")]
    PoolExhausted { timeout: Duration },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("query cost {cost} exceeds ceiling {ceiling}")]
    QueryTooExpensive { cost: u32, ceiling: u32 },

    #[error("chunk {chunk} failed after {attempts} attempt(s): {reason}")]
    ChunkFailed {
        chunk: usize,
        attempts: u32,
        reason: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl QueryError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retriable(&self) -> bool {
        match self {
            QueryError::PoolExhausted { .. } | QueryError::DeadlineExceeded(_) => true,
            QueryError::Transport(e) => e.is_transient(),
            _ => false,
        }
    }
}

//! Cluster error types

use thiserror::Error;

use crate::machine::ClusterState;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster errors
#[derive(Debug, Error)]
pub enum ClusterError {
    // ==================== Operator Errors ====================
    #[error("cannot execute unless idle (cluster is {0})")]
    NotIdle(ClusterState),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ==================== Agreement Errors ====================
    #[error("cluster divergence: {0}")]
    Divergence(String),

    #[error("no acknowledgement from {missing} of {total} nodes")]
    MissingAcks { missing: usize, total: usize },

    // ==================== Protocol Errors ====================
    #[error("serialization error: {0}")]
    Serialization(String),

    // ==================== Storage Errors ====================
    #[error(transparent)]
    Database(#[from] switchover_db::Error),

    // ==================== Internal Errors ====================
    #[error("request timeout")]
    Timeout,

    #[error("channel closed")]
    ChannelClosed,

    #[error("shutdown in progress")]
    ShuttingDown,
}

impl ClusterError {
    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        match self {
            ClusterError::Timeout | ClusterError::MissingAcks { .. } => true,
            ClusterError::Database(e) => e.is_retriable(),
            _ => false,
        }
    }
}

// Conversion from channel errors
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ClusterError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ClusterError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ClusterError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ClusterError::ChannelClosed
    }
}

impl From<tokio::time::error::Elapsed> for ClusterError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ClusterError::Timeout
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<tokio_postgres::Error> for ClusterError {
    fn from(e: tokio_postgres::Error) -> Self {
        ClusterError::Database(e.into())
    }
}

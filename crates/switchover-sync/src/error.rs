//! Error types for sync operations
//!
//! Database failures keep their [`switchover_db::ErrorCategory`] so the
//! caller can tell a retriable serialization failure from a broken schema.

use thiserror::Error;

/// Replication and change tracking errors
#[derive(Error, Debug)]
pub enum SyncError {
    /// The replication session lock is held by another node
    #[error("Sync lock is held by another session")]
    NoLock,

    /// Database state does not allow the operation
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Foreign keys between tables form a cycle
    #[error("Circular foreign key dependency between tables: {}", tables.join(", "))]
    CircularDependency {
        /// Tables that could not be ordered
        tables: Vec<String>,
    },

    /// A table without an `id` column cannot be replicated
    #[error("Table {table} has no id column")]
    MissingIdColumn {
        /// Table name
        table: String,
    },

    /// A change log row id could not be parsed for its table's id type
    #[error("Invalid row id {id:?} for table {table}")]
    InvalidRowId {
        /// Table name
        table: String,
        /// Raw id text from the change log
        id: String,
    },

    /// Schema does not match what the replicator expects
    #[error("Schema error: {0}")]
    Schema(String),

    /// The enclosing task was cancelled
    #[error("Sync cancelled")]
    Cancelled,

    /// Database error
    #[error(transparent)]
    Database(#[from] switchover_db::Error),
}

impl SyncError {
    /// Create a precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Whether running the same operation again may succeed.
    ///
    /// Serialization failures, deadlocks and lock timeouts during a sync
    /// pass are expected under load.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Database(e) => e.is_retriable(),
            Self::NoLock => true,
            _ => false,
        }
    }

    /// Whether the replication session must be reset before continuing.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CircularDependency { .. } | Self::MissingIdColumn { .. } | Self::Schema(_)
        )
    }
}

impl From<tokio_postgres::Error> for SyncError {
    fn from(err: tokio_postgres::Error) -> Self {
        Self::Database(err.into())
    }
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Map a driver error, keeping the failing statement.
pub(crate) fn pg_err(sql: &str) -> impl FnOnce(tokio_postgres::Error) -> SyncError + '_ {
    move |e| SyncError::Database(switchover_db::Error::from_pg(e, sql))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::CircularDependency {
            tables: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            err.to_string(),
            "Circular foreign key dependency between tables: a, b"
        );

        let err = SyncError::precondition("state is not idle");
        assert_eq!(err.to_string(), "Precondition failed: state is not idle");
    }

    #[test]
    fn test_error_classification() {
        assert!(SyncError::NoLock.is_retriable());
        assert!(SyncError::Database(switchover_db::Error::timeout("lock")).is_retriable());
        assert!(!SyncError::Cancelled.is_retriable());
        assert!(!SyncError::precondition("x").is_retriable());

        assert!(SyncError::MissingIdColumn {
            table: "t".into()
        }
        .is_fatal());
        assert!(!SyncError::NoLock.is_fatal());
    }
}

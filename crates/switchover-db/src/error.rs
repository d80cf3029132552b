//! Error types for switchover-db
//!
//! Provides granular error classification for proper retry handling:
//! - Retriable errors (connection, timeout, deadlock, serialization failure)
//! - Non-retriable errors (precondition, schema, configuration)

use std::fmt;
use thiserror::Error;

/// Result type for switchover-db operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-related errors (retriable)
    Connection,
    /// Query execution errors
    Query,
    /// Transaction errors, including serialization failures (retriable)
    Transaction,
    /// Timeout or lock_timeout errors (retriable)
    Timeout,
    /// Deadlock detected (retriable)
    Deadlock,
    /// Configuration error
    Configuration,
    /// Pool exhausted or paused (retriable with backoff)
    PoolExhausted,
    /// Switchover state does not allow the operation
    Precondition,
    /// Schema-related errors
    Schema,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Transaction | Self::Timeout | Self::Deadlock | Self::PoolExhausted
        )
    }
}

/// Main error type for switchover-db
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transaction error (serialization failures land here)
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Deadlock detected
    #[error("deadlock detected")]
    Deadlock,

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Connection pool exhausted
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// Switchover state precondition failed
    #[error("precondition failed: {message}")]
    Precondition { message: String },

    /// Schema error (missing bookkeeping table, unexpected value)
    #[error("schema error: {message}")]
    Schema { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// SQLSTATE serialization_failure
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE deadlock_detected
const SQLSTATE_DEADLOCK: &str = "40P01";
/// SQLSTATE lock_not_available
const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";
/// SQLSTATE query_canceled (raised by statement_timeout)
const SQLSTATE_QUERY_CANCELED: &str = "57014";

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Deadlock => ErrorCategory::Deadlock,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::Precondition { .. } => ErrorCategory::Precondition,
            Self::Schema { .. } => ErrorCategory::Schema,
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a precondition error
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify a driver error, attaching the SQL that produced it.
    pub fn from_pg(err: tokio_postgres::Error, sql: &str) -> Self {
        let message = err.to_string();
        let code = err.code().map(|c| c.code().to_string());
        match code.as_deref() {
            Some(SQLSTATE_SERIALIZATION_FAILURE) => Self::Transaction {
                message,
                source: Some(Box::new(err)),
            },
            Some(SQLSTATE_DEADLOCK) => Self::Deadlock,
            Some(SQLSTATE_LOCK_NOT_AVAILABLE) | Some(SQLSTATE_QUERY_CANCELED) => {
                Self::Timeout { message }
            }
            _ if err.is_closed() => Self::Connection {
                message,
                source: Some(Box::new(err)),
            },
            _ => Self::Query {
                message,
                sql: Some(sql.to_string()),
                source: Some(Box::new(err)),
            },
        }
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        Self::from_pg(err, "")
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::Transaction => write!(f, "transaction"),
            Self::Timeout => write!(f, "timeout"),
            Self::Deadlock => write!(f, "deadlock"),
            Self::Configuration => write!(f, "configuration"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::Precondition => write!(f, "precondition"),
            Self::Schema => write!(f, "schema"),
            Self::Other => write!(f, "other"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retriable() {
        assert!(ErrorCategory::Connection.is_retriable());
        assert!(ErrorCategory::Transaction.is_retriable());
        assert!(ErrorCategory::Timeout.is_retriable());
        assert!(ErrorCategory::Deadlock.is_retriable());
        assert!(ErrorCategory::PoolExhausted.is_retriable());

        assert!(!ErrorCategory::Precondition.is_retriable());
        assert!(!ErrorCategory::Schema.is_retriable());
        assert!(!ErrorCategory::Query.is_retriable());
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(Error::connection("failed").is_retriable());
        assert!(Error::timeout("lock_timeout").is_retriable());
        assert!(Error::Deadlock.is_retriable());
        assert!(Error::transaction("could not serialize access").is_retriable());

        assert!(!Error::precondition("not idle").is_retriable());
        assert!(!Error::schema("missing switchover_state").is_retriable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::precondition("switchover state is not idle");
        assert_eq!(err.to_string(), "precondition failed: switchover state is not idle");

        let err = Error::query_with_sql("syntax error", "SELEC 1");
        assert!(err.to_string().contains("syntax error"));
        assert_eq!(err.category(), ErrorCategory::Query);
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::PoolExhausted.to_string(), "pool_exhausted");
        assert_eq!(ErrorCategory::Precondition.to_string(), "precondition");
    }
}

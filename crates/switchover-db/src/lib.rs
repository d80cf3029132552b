//! # switchover-db
//!
//! PostgreSQL connectivity for a zero-downtime database switchover.
//!
//! This crate owns everything that touches a single database connection:
//!
//! ## Features
//!
//! - **Connection Providers**: `DirectProvider` for fixed targets, `RoutedProvider`
//!   that follows the switchover state from the main to the next database
//! - **Routing Pool**: semaphore-bounded pool that releases and re-checks
//!   routed connections between checkouts, with pause/resume for the final sync
//! - **Switchover State**: the single-row `switchover_state` value and database identity
//! - **Advisory Locks**: the lock ids shared by the router and the replicator
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use switchover_db::prelude::*;
//!
//! let provider = Arc::new(RoutedProvider::new(
//!     ConnectionConfig::new("postgres://app@old-db/app"),
//!     ConnectionConfig::new("postgres://app@new-db/app"),
//! ));
//! let pool = RoutingPool::new(PoolConfig::default().with_max_size(20), provider);
//!
//! let conn = pool.get().await?;
//! let rows = conn.query("SELECT id FROM users", &[]).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod observability;
pub mod pool;
pub mod postgres;
pub mod router;
pub mod state;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Connections
    pub use crate::connection::{ConnectionConfig, ConnectionProvider, Target};
    pub use crate::postgres::{connect, connect_client, PgConnection};

    // Routing
    pub use crate::router::{DirectProvider, RoutedProvider};

    // Pool
    pub use crate::lifecycle::PauseResumer;
    pub use crate::pool::{PoolConfig, PoolStats, PooledConnection, RoutingPool};

    // State
    pub use crate::state::{ConnectionCount, DatabaseInfo, SwitchoverState};

    pub use std::sync::Arc;
}

pub use connection::{ConnectionConfig, ConnectionProvider, Target};
pub use error::{Error, ErrorCategory, Result};
pub use lifecycle::PauseResumer;
pub use pool::{PoolConfig, PooledConnection, RoutingPool};
pub use postgres::PgConnection;
pub use router::{DirectProvider, RoutedProvider};
pub use state::{ConnectionCount, DatabaseInfo, SwitchoverState};

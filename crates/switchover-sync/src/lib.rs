//! # switchover-sync
//!
//! Moves data from the main database to the next one while the application
//! keeps writing to main.
//!
//! ## Features
//!
//! - **Table Catalog**: replicable tables with their id type and foreign key
//!   dependencies, ordered so parents always precede children
//! - **Change Tracking**: trigger-maintained `change_log` of row identities,
//!   active only while the switchover state is `in_progress`
//! - **Logical Replication**: snapshot copy, repeatable catch-up passes and
//!   a final pass that commits the flip atomically with the last changes
//!
//! ## Architecture
//!
//! ```text
//!   main database                          next database
//! ┌────────────────────┐               ┌────────────────────┐
//! │ tables ──trigger──►│  change_log   │ tables             │
//! │ switchover_state   │──────┐        │ (user triggers off)│
//! └────────────────────┘      │        └────────────────────┘
//!                             ▼                  ▲
//!                    ┌─────────────────┐         │
//!                    │LogicalReplicator│─────────┘
//!                    │ catalog · plan  │ upsert / delete
//!                    │ row tracker     │ in dependency order
//!                    └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use switchover_sync::prelude::*;
//!
//! let mut repl = LogicalReplicator::connect(ReplicatorConfig::default(), &main, &next).await?;
//! let cancel = CancellationToken::new();
//! repl.reset().await?;
//! repl.start(&cancel).await?;
//! repl.full_initial_sync(&cancel).await?;
//! repl.logical_sync(&cancel).await?;
//! repl.final_sync(&cancel).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod catalog;
pub mod changelog;
pub mod config;
pub mod error;
pub mod observability;
pub mod plan;
pub mod replicator;
pub mod sequence;
pub mod table;
pub mod tracker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::ReplicatorConfig;
    pub use crate::error::{Result, SyncError};
    pub use crate::replicator::{LogicalReplicator, ProgressFn, SyncStats};
    pub use crate::table::{IdType, Table};

    pub use tokio_util::sync::CancellationToken;
}

pub use config::ReplicatorConfig;
pub use error::{Result, SyncError};
pub use replicator::{LogicalReplicator, ProgressFn, SyncStats};
pub use table::{IdType, Table};

//! Switchover Node Daemon (switchoverd)
//!
//! Runs one application node's part of a zero-downtime PostgreSQL
//! switchover, and the operator commands that drive it.
//!
//! ## Commands
//!
//! - **install**: create the switchover bookkeeping schema on both databases
//! - **run**: join the cluster and serve the routed connection pool
//! - **status / reset / execute / cancel / ping**: one-shot operator commands
//!
//! ## Quick Start
//!
//! ```bash
//! export SWITCHOVER_MAIN_URL=postgres://app@old-db/app
//! export SWITCHOVER_NEXT_URL=postgres://app@new-db/app
//!
//! switchoverd install
//! switchoverd run &          # on every application node
//! switchoverd reset
//! switchoverd execute
//! switchoverd status
//! ```

pub mod cli;
pub mod executor;
pub mod manager;

pub use cli::{Cli, Command};
pub use executor::ReplicatorExecutor;
pub use manager::{
    attach_operator, install, DatabasePair, ManagerConfig, ManagerStatus, SwitchoverManager,
};

//! Switchover Integration Tests
//!
//! This crate contains Docker-backed tests for the switchover crates. It is
//! NOT published to crates.io.
//!
//! # Test Categories
//!
//! - **replication**: reset, initial copy and logical catch-up between two databases
//! - **atomic_flip**: the final sync and its exclusive switchover lock
//! - **router**: routed pool behavior before and after the flip, pause/resume
//! - **message_log**: ordering of the shared cluster message log
//! - **cluster_switchover**: two nodes driving a complete switchover
//!
//! # Running Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test -p switchover-integration-tests -- --ignored
//!
//! # Run specific test suite
//! cargo test -p switchover-integration-tests --test replication -- --ignored
//!
//! # Run with logging
//! RUST_LOG=debug cargo test -p switchover-integration-tests -- --ignored --nocapture
//! ```
//!
//! # Requirements
//!
//! Every test starts a PostgreSQL container and requires Docker to be running.

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;

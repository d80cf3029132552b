//! # switchover-cluster
//!
//! Keeps every application node of a switchover in agreement.
//!
//! Nodes never talk to each other directly. They share one append-only
//! message log in the main database, and each node derives the cluster state
//! by replaying that log through the same pure transition function.
//!
//! ## Features
//!
//! - **Message Log**: gap-free, totally ordered append with polling readers
//! - **Coordinator**: per-node actor that elects a leader per epoch, runs
//!   the sync/pause/exec tasks and aborts on any divergence
//! - **Operator**: passive replay of the current epoch for one-shot commands
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  switchover_log (main db)                │
//! │  reset → hello… → reset-end → execute → pause → paused…  │
//! │        → done                                            │
//! └──────────┬──────────────────┬──────────────────┬─────────┘
//!            │ replay           │ replay           │ replay
//!     ┌──────▼──────┐    ┌──────▼──────┐    ┌──────▼──────┐
//!     │ Coordinator │    │ Coordinator │    │  Operator   │
//!     │  (leader)   │    │  (follower) │    │  (passive)  │
//!     │ TaskState   │    │ TaskState   │    │ TaskState   │
//!     └─────────────┘    └─────────────┘    └─────────────┘
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod machine;
pub mod message;
pub mod msglog;
pub mod observability;
pub mod operator;
pub mod status;

pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, CoordinatorHandle};
pub use error::{ClusterError, Result};
pub use executor::{Executor, TaskContext, TaskError, TaskResult};
pub use machine::{Action, ClusterState, TaskKind, TaskState};
pub use message::{Message, NodeInfo, Payload};
pub use msglog::{LogStore, MemoryLog, MessageLog};
pub use operator::Operator;
pub use status::ClusterStatus;

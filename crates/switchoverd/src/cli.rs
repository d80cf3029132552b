//! CLI argument parsing for the switchover daemon

use clap::{Parser, Subcommand};
use std::time::Duration;

use switchover_cluster::CoordinatorConfig;
use switchover_db::{ConnectionConfig, PoolConfig};
use switchover_sync::ReplicatorConfig;

use crate::manager::ManagerConfig;

/// Zero-downtime PostgreSQL switchover
///
/// Moves a running application from its main database to a next database
/// while every application node keeps serving traffic.
#[derive(Parser, Debug)]
#[command(name = "switchoverd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    // ============ Databases ============
    /// URL of the database the application currently uses
    #[arg(long, env = "SWITCHOVER_MAIN_URL", global = true, default_value = "")]
    pub main_url: String,

    /// URL of the database to switch to
    #[arg(long, env = "SWITCHOVER_NEXT_URL", global = true, default_value = "")]
    pub next_url: String,

    /// Connect timeout in milliseconds
    #[arg(long, default_value = "10000", env = "SWITCHOVER_CONNECT_TIMEOUT_MS", global = true)]
    pub connect_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "SWITCHOVER_LOG_LEVEL", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Operator commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create the switchover schema on both databases
    Install,
    /// Print the cluster status as JSON
    Status,
    /// Start a new switchover epoch
    Reset,
    /// Begin the switchover (cluster must be idle)
    Execute,
    /// Abort the current switchover
    Cancel,
    /// Check that every node is responsive
    Ping,
    /// Run a switchover node until interrupted
    Run(RunArgs),
}

/// Node settings for `run`
#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    // ============ Node ============
    /// Never become leader or run the replicator on this node
    #[arg(long, env = "SWITCHOVER_NO_EXEC")]
    pub no_exec: bool,

    /// Message log position to resume reading after
    #[arg(long, env = "SWITCHOVER_RESUME_FROM")]
    pub resume_from: Option<i64>,

    // ============ Pool ============
    /// Maximum connections in the routed pool
    #[arg(long, default_value = "10", env = "SWITCHOVER_POOL_MAX_SIZE")]
    pub pool_max_size: usize,

    /// Pool acquire timeout in milliseconds
    #[arg(long, default_value = "30000", env = "SWITCHOVER_POOL_ACQUIRE_TIMEOUT_MS")]
    pub pool_acquire_timeout_ms: u64,

    // ============ Replication ============
    /// Approximate bytes per insert batch during the initial copy
    #[arg(long, default_value = "1048576", env = "SWITCHOVER_BATCH_BYTES")]
    pub batch_bytes: usize,

    /// Tables never to replicate (comma-separated)
    #[arg(long, value_delimiter = ',', env = "SWITCHOVER_EXCLUDE_TABLES")]
    pub exclude_tables: Vec<String>,

    /// Catch-up passes before pausing regardless of backlog
    #[arg(long, default_value = "10", env = "SWITCHOVER_MAX_SYNC_PASSES")]
    pub max_sync_passes: usize,

    /// Backlog small enough to pause the application
    #[arg(long, default_value = "100", env = "SWITCHOVER_PAUSE_THRESHOLD")]
    pub pause_threshold: usize,

    /// Lock timeout for the final sync in milliseconds
    #[arg(long, default_value = "30000", env = "SWITCHOVER_FINAL_LOCK_TIMEOUT_MS")]
    pub final_lock_timeout_ms: u64,

    // ============ Coordination ============
    /// Delay between leader election and idle, in milliseconds
    #[arg(long, default_value = "3000", env = "SWITCHOVER_RESET_DELAY_MS")]
    pub reset_delay_ms: u64,

    /// Upper bound for pausing this node, in milliseconds
    #[arg(long, default_value = "30000", env = "SWITCHOVER_PAUSE_TIMEOUT_MS")]
    pub pause_timeout_ms: u64,

    /// Message log poll interval in milliseconds
    #[arg(long, default_value = "250", env = "SWITCHOVER_LOG_POLL_MS")]
    pub log_poll_ms: u64,

    /// Graceful shutdown timeout in seconds
    #[arg(long, default_value = "30", env = "SWITCHOVER_SHUTDOWN_TIMEOUT_SECS")]
    pub shutdown_timeout_secs: u64,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            no_exec: false,
            resume_from: None,
            pool_max_size: 10,
            pool_acquire_timeout_ms: 30_000,
            batch_bytes: 1024 * 1024,
            exclude_tables: Vec::new(),
            max_sync_passes: 10,
            pause_threshold: 100,
            final_lock_timeout_ms: 30_000,
            reset_delay_ms: 3_000,
            pause_timeout_ms: 30_000,
            log_poll_ms: 250,
            shutdown_timeout_secs: 30,
        }
    }
}

impl Cli {
    pub fn main_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.main_url.clone())
            .with_connect_timeout(self.connect_timeout_ms)
            .with_application_name("switchoverd")
    }

    pub fn next_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.next_url.clone())
            .with_connect_timeout(self.connect_timeout_ms)
            .with_application_name("switchoverd")
    }

    /// Poll interval for one-shot operator commands.
    pub fn operator_poll(&self) -> Duration {
        Duration::from_millis(250)
    }

    /// Node configuration for `run`; defaults for other commands.
    pub fn to_manager_config(&self) -> ManagerConfig {
        let run = match &self.command {
            Command::Run(args) => args.clone(),
            _ => RunArgs::default(),
        };

        let mut replicator = ReplicatorConfig::default()
            .with_batch_bytes(run.batch_bytes)
            .with_final_lock_timeout(Duration::from_millis(run.final_lock_timeout_ms))
            .with_pause_threshold(run.pause_threshold);
        replicator.max_sync_passes = run.max_sync_passes;
        for table in &run.exclude_tables {
            replicator = replicator.with_excluded_table(table.clone());
        }

        let mut coordinator = CoordinatorConfig::default()
            .with_can_exec(!run.no_exec)
            .with_reset_delay(Duration::from_millis(run.reset_delay_ms))
            .with_pause_timeout(Duration::from_millis(run.pause_timeout_ms))
            .with_log_poll(Duration::from_millis(run.log_poll_ms));
        if let Some(position) = run.resume_from {
            coordinator = coordinator.with_resume_from(position);
        }

        ManagerConfig {
            main: self.main_config(),
            next: self.next_config(),
            pool: PoolConfig::default()
                .with_max_size(run.pool_max_size)
                .with_acquire_timeout(Duration::from_millis(run.pool_acquire_timeout_ms)),
            replicator,
            coordinator,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.main_url.is_empty() {
            return Err("main database URL (--main-url / SWITCHOVER_MAIN_URL) is required".into());
        }
        if self.next_url.is_empty() {
            return Err("next database URL (--next-url / SWITCHOVER_NEXT_URL) is required".into());
        }
        if self.main_url == self.next_url {
            return Err("main and next database URLs must differ".into());
        }

        if let Command::Run(run) = &self.command {
            if run.pool_max_size == 0 {
                return Err("pool_max_size must be at least 1".into());
            }
            if run.batch_bytes == 0 {
                return Err("batch_bytes must be positive".into());
            }
            if run.log_poll_ms == 0 {
                return Err("log_poll_ms must be positive".into());
            }
            if run.resume_from.is_some_and(|p| p < 0) {
                return Err("resume_from must not be negative".into());
            }
        }

        Ok(())
    }
}

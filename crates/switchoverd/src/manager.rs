//! Switchover node service
//!
//! [`SwitchoverManager`] wires one application node together: the routed
//! connection pool the application uses, the coordinator that keeps the node
//! in step with the cluster, and (when the node may lead) the replicator
//! executor.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use switchover_cluster::{
    ClusterStatus, Coordinator, CoordinatorConfig, CoordinatorHandle, LogStore, MessageLog,
    NodeInfo, Operator,
};
use switchover_db::pool::PoolStats;
use switchover_db::postgres::connect_client;
use switchover_db::{state, ConnectionConfig, DatabaseInfo, PoolConfig, RoutedProvider, RoutingPool};
use switchover_sync::{changelog, ReplicatorConfig};

use crate::executor::ReplicatorExecutor;

/// Everything a node needs to take part in a switchover.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub main: ConnectionConfig,
    pub next: ConnectionConfig,
    pub pool: PoolConfig,
    pub replicator: ReplicatorConfig,
    pub coordinator: CoordinatorConfig,
}

/// Identity of both databases.
#[derive(Debug, Clone, Serialize)]
pub struct DatabasePair {
    pub main: DatabaseInfo,
    pub next: DatabaseInfo,
}

impl DatabasePair {
    /// Read `switchover_state` identity from both databases.
    pub async fn load(main: &ConnectionConfig, next: &ConnectionConfig) -> anyhow::Result<Self> {
        let main_client = connect_client(main).await?;
        let next_client = connect_client(next).await?;
        Ok(Self {
            main: state::database_info(&main_client).await?,
            next: state::database_info(&next_client).await?,
        })
    }
}

/// Operator-facing node report.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub cluster: ClusterStatus,
    pub databases: DatabasePair,
    /// Whether this process routes new connections to the next database
    pub flipped: bool,
    pub pool: PoolStats,
}

/// Create the bookkeeping schema on both databases.
///
/// Idempotent. The message log and change log live on main; the state
/// table is needed on both so each database has an identity.
pub async fn install(main: &ConnectionConfig, next: &ConnectionConfig) -> anyhow::Result<()> {
    let main_client = connect_client(main).await?;
    state::install(&main_client).await?;
    changelog::install(&main_client).await?;
    MessageLog::new(main_client).install().await?;

    let next_client = connect_client(next).await?;
    state::install(&next_client).await?;

    info!(main = %main.redacted_url(), next = %next.redacted_url(), "Switchover schema installed");
    Ok(())
}

/// Attach a one-shot operator to the cluster that switches `main` to `next`.
pub async fn attach_operator(
    main: &ConnectionConfig,
    next: &ConnectionConfig,
    poll: Duration,
) -> anyhow::Result<(Operator, DatabasePair)> {
    let databases = DatabasePair::load(main, next).await?;
    let log: Arc<dyn LogStore> = Arc::new(MessageLog::connect(main).await?);
    let operator = Operator::attach(log, databases.main.id, databases.next.id, poll).await?;
    Ok((operator, databases))
}

/// One running switchover node.
pub struct SwitchoverManager {
    handle: CoordinatorHandle,
    coordinator: JoinHandle<()>,
    pool: Arc<RoutingPool>,
    provider: Arc<RoutedProvider>,
    databases: DatabasePair,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SwitchoverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchoverManager")
            .field("node_id", &self.handle.node_id())
            .field("databases", &self.databases)
            .finish_non_exhaustive()
    }
}

impl SwitchoverManager {
    /// Connect, join the cluster and start coordinating.
    pub async fn start(config: ManagerConfig, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let databases = DatabasePair::load(&config.main, &config.next).await?;
        if databases.main.id == databases.next.id {
            anyhow::bail!(
                "main and next databases share identity {}; refusing to switch a database onto itself",
                databases.main.id
            );
        }

        let provider = Arc::new(RoutedProvider::new(config.main.clone(), config.next.clone()));
        let pool = RoutingPool::new(config.pool.clone(), provider.clone());

        let executor = Arc::new(ReplicatorExecutor::new(
            config.replicator.clone(),
            config.main.clone(),
            config.next.clone(),
        ));
        let log: Arc<dyn LogStore> = Arc::new(MessageLog::connect(&config.main).await?);
        let local = NodeInfo::new(
            config.coordinator.can_exec,
            databases.main.id,
            databases.next.id,
        );

        let shutdown = shutdown.child_token();
        let (handle, coordinator) = Coordinator::start(
            config.coordinator,
            local,
            log,
            executor,
            pool.clone(),
            shutdown.clone(),
        )
        .await?;

        info!(
            node_id = %handle.node_id(),
            main_db = %databases.main.id,
            next_db = %databases.next.id,
            "Switchover node started"
        );

        Ok(Self {
            handle,
            coordinator,
            pool,
            provider,
            databases,
            shutdown,
        })
    }

    /// Pool the application should take its connections from.
    pub fn pool(&self) -> &Arc<RoutingPool> {
        &self.pool
    }

    pub fn handle(&self) -> &CoordinatorHandle {
        &self.handle
    }

    pub fn databases(&self) -> &DatabasePair {
        &self.databases
    }

    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            cluster: self.handle.status(),
            databases: self.databases.clone(),
            flipped: self.provider.is_flipped(),
            pool: self.pool.stats(),
        }
    }

    /// Stop coordinating and close the pool.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        if let Err(e) = self.coordinator.await {
            warn!("Coordinator task ended abnormally: {}", e);
        }
        self.pool.close().await?;
        info!(node_id = %self.handle.node_id(), "Switchover node stopped");
        Ok(())
    }
}

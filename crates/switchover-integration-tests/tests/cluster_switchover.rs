//! End-to-end switchover tests
//!
//! Two application nodes run [`SwitchoverManager`] against the same pair of
//! databases while an out-of-process operator drives the cluster through the
//! shared message log.
//!
//! Run with: cargo test -p switchover-integration-tests --test cluster_switchover -- --ignored --nocapture
//!
//! Requirements: Docker must be running for testcontainers.

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;
use switchover_cluster::{ClusterError, ClusterState, CoordinatorConfig};
use switchover_db::{PoolConfig, Target};
use switchover_integration_tests::fixtures::*;
use switchover_integration_tests::helpers::*;
use switchover_sync::ReplicatorConfig;
use switchoverd::{attach_operator, ManagerConfig, SwitchoverManager};
use tokio_util::sync::CancellationToken;
use tracing::info;

const STEP_TIMEOUT: Duration = Duration::from_secs(60);
const OPERATOR_POLL: Duration = Duration::from_millis(20);

fn node_config(pair: &SwitchoverPair, can_exec: bool) -> ManagerConfig {
    ManagerConfig {
        main: pair.main.clone(),
        next: pair.next.clone(),
        pool: PoolConfig::default().with_max_size(4),
        replicator: ReplicatorConfig::default().with_active_tx_poll(Duration::from_millis(50)),
        coordinator: CoordinatorConfig::default()
            .with_can_exec(can_exec)
            .with_reset_delay(Duration::from_millis(500))
            .with_log_poll(Duration::from_millis(20))
            .with_status_throttle(Duration::from_millis(50)),
    }
}

async fn start_nodes(
    pair: &SwitchoverPair,
    shutdown: &CancellationToken,
) -> Result<(SwitchoverManager, SwitchoverManager)> {
    let leader = SwitchoverManager::start(node_config(pair, true), shutdown.clone()).await?;
    let follower = SwitchoverManager::start(node_config(pair, false), shutdown.clone()).await?;
    Ok((leader, follower))
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
#[serial]
async fn test_two_node_switchover() -> Result<()> {
    init_tracing();

    let pg = TestPostgres::start().await?;
    let pair = pg.switchover_pair().await?;
    let main = pair.connect_main().await?;
    let next = pair.connect_next().await?;
    seed_users(&main, &[8, 1, 1]).await?;

    let shutdown = CancellationToken::new();
    let (leader, follower) = start_nodes(&pair, &shutdown).await?;

    let (mut operator, databases) = attach_operator(&pair.main, &pair.next, OPERATOR_POLL).await?;
    assert_ne!(databases.main.id, databases.next.id);

    // status reports who is connected, including the nodes' log readers
    let sessions = |info: &switchover_db::DatabaseInfo| {
        info.connections
            .iter()
            .find(|c| c.application_name == "switchover-tests")
            .map_or(0, |c| c.count)
    };
    assert!(sessions(&databases.main) >= 3, "{:?}", databases.main.connections);
    assert!(sessions(&databases.next) >= 1, "{:?}", databases.next.connections);

    operator.reset().await?;
    let idle = operator
        .wait_for(|s| s.state == ClusterState::Idle, STEP_TIMEOUT)
        .await?;
    assert_eq!(idle.leader, Some(leader.handle().node_id()));
    assert_eq!(idle.nodes.len(), 2);
    assert_eq!(operator.ping(Duration::from_secs(5)).await?, 2);
    info!("Cluster idle with leader {}", leader.handle().node_id());

    // application traffic through a node keeps landing on main until the flip
    {
        let conn = follower.pool().get().await?;
        assert_eq!(conn.connection().target(), Target::Main);
        seed_users(&conn, &[2]).await?;
    }

    operator.execute().await?;
    for node in [&leader, &follower] {
        node.handle()
            .wait_for_state(ClusterState::Done, STEP_TIMEOUT)
            .await?;
    }
    info!("Switchover done");

    assert_eq!(switchover_state(&main).await?, "use_next_db");
    assert_eq!(count_rows(&next, "users").await?, 4);
    assert_eq!(count_rows(&next, "alerts").await?, 12);
    assert_eq!(table_json(&main, "users").await?, table_json(&next, "users").await?);
    assert_eq!(table_json(&main, "alerts").await?, table_json(&next, "alerts").await?);

    // both nodes resumed and now route to the next database
    for node in [&leader, &follower] {
        let pool = node.pool();
        wait_for_condition(|| async move { !pool.is_paused() }).await?;
        let conn = node.pool().get().await?;
        assert_eq!(conn.connection().target(), Target::Next);
        assert!(node.status().flipped);
    }

    let status = operator.refresh().await?;
    assert_eq!(status.state, ClusterState::Done);
    assert!(status.last_error.is_empty());

    shutdown.cancel();
    leader.shutdown().await?;
    follower.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
#[serial]
async fn test_cancel_requires_a_new_reset() -> Result<()> {
    init_tracing();

    let pg = TestPostgres::start().await?;
    let pair = pg.switchover_pair().await?;
    let main = pair.connect_main().await?;
    seed_users(&main, &[1]).await?;

    let shutdown = CancellationToken::new();
    let (leader, follower) = start_nodes(&pair, &shutdown).await?;
    let (mut operator, _) = attach_operator(&pair.main, &pair.next, OPERATOR_POLL).await?;

    // nothing happens before the first reset
    let err = operator.execute().await.unwrap_err();
    assert!(matches!(err, ClusterError::NotIdle(ClusterState::Unknown)));

    operator.reset().await?;
    operator
        .wait_for(|s| s.state == ClusterState::Idle, STEP_TIMEOUT)
        .await?;

    operator.cancel().await?;
    for node in [&leader, &follower] {
        node.handle()
            .wait_for_state(ClusterState::Unknown, STEP_TIMEOUT)
            .await?;
    }
    let err = operator.execute().await.unwrap_err();
    assert!(matches!(err, ClusterError::NotIdle(ClusterState::Unknown)));

    operator.reset().await?;
    let idle = operator
        .wait_for(|s| s.state == ClusterState::Idle, STEP_TIMEOUT)
        .await?;
    assert_eq!(idle.nodes.len(), 2);
    assert_eq!(switchover_state(&main).await?, "idle");

    shutdown.cancel();
    leader.shutdown().await?;
    follower.shutdown().await?;
    Ok(())
}

//! Final sync integration tests
//!
//! The flip to the next database commits only while no routed connection
//! is using the main database, and only after the destination holds every
//! change.
//!
//! Run with: cargo test -p switchover-integration-tests --test atomic_flip -- --ignored --nocapture
//!
//! Requirements: Docker must be running for testcontainers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serial_test::serial;
use switchover_db::lock::{LOCK_SHARED_SQL, SWITCHOVER_LOCK_ID, UNLOCK_SHARED_SQL};
use switchover_db::{PoolConfig, RoutedProvider, RoutingPool, Target};
use switchover_integration_tests::fixtures::*;
use switchover_integration_tests::helpers::*;
use switchover_sync::{LogicalReplicator, ReplicatorConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

fn replicator_config() -> ReplicatorConfig {
    ReplicatorConfig::default()
        .with_active_tx_poll(Duration::from_millis(50))
        .with_final_lock_timeout(Duration::from_millis(500))
}

const WAITING_LOCKS_SQL: &str =
    "SELECT count(*) FROM pg_locks WHERE locktype = 'advisory' AND NOT granted";

async fn synced_replicator(pair: &SwitchoverPair) -> Result<LogicalReplicator> {
    synced_replicator_with(pair, replicator_config()).await
}

async fn synced_replicator_with(
    pair: &SwitchoverPair,
    config: ReplicatorConfig,
) -> Result<LogicalReplicator> {
    let cancel = CancellationToken::new();
    let mut repl = LogicalReplicator::connect(config, &pair.main, &pair.next).await?;
    repl.reset().await?;
    repl.start(&cancel).await?;
    repl.full_initial_sync(&cancel).await?;
    Ok(repl)
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
#[serial]
async fn test_final_sync_flips_state_and_copies_remaining_changes() -> Result<()> {
    init_tracing();

    let pg = TestPostgres::start().await?;
    let pair = pg.switchover_pair().await?;
    let main = pair.connect_main().await?;
    let next = pair.connect_next().await?;
    seed_users(&main, &[3, 2]).await?;

    let mut repl = synced_replicator(&pair).await?;
    seed_users(&main, &[4]).await?;

    let cancel = CancellationToken::new();
    let stats = repl.final_sync(&cancel).await?;
    info!(%stats, "Final sync applied");
    assert_eq!(stats.inserted, 5);

    assert_eq!(switchover_state(&main).await?, "use_next_db");
    assert_eq!(table_json(&main, "users").await?, table_json(&next, "users").await?);
    assert_eq!(table_json(&main, "alerts").await?, table_json(&next, "alerts").await?);

    // destination triggers are live again once it is authoritative
    let disabled = next
        .query_one(
            "SELECT count(*) FROM pg_trigger t JOIN pg_class c ON c.oid = t.tgrelid \
             WHERE c.relname IN ('users', 'alerts') AND t.tgenabled = 'D'",
            &[],
        )
        .await?;
    assert_eq!(disabled.get::<_, i64>(0), 0);

    // a committed flip cannot be reset
    assert!(repl.reset().await.is_err());
    assert_eq!(switchover_state(&main).await?, "use_next_db");

    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
#[serial]
async fn test_routed_connection_blocks_the_flip() -> Result<()> {
    init_tracing();

    let pg = TestPostgres::start().await?;
    let pair = pg.switchover_pair().await?;
    let main = pair.connect_main().await?;
    let next = pair.connect_next().await?;
    seed_users(&main, &[2]).await?;

    let provider = Arc::new(RoutedProvider::new(pair.main.clone(), pair.next.clone()));
    let pool = RoutingPool::new(PoolConfig::default().with_max_size(4), provider.clone());

    let mut repl = synced_replicator(&pair).await?;
    let cancel = CancellationToken::new();

    // a request in flight on the main database holds the shared lock
    let conn = pool.get().await?;
    assert_eq!(conn.connection().target(), Target::Main);
    conn.execute("UPDATE alerts SET message = 'in flight'", &[]).await?;

    let err = repl.final_sync(&cancel).await.unwrap_err();
    info!("Final sync refused while a routed connection is busy: {}", err);
    assert_eq!(switchover_state(&main).await?, "in_progress");
    assert_eq!(count_rows(&next, "alerts").await?, 2);
    let stale = next
        .query_one("SELECT count(*) FROM alerts WHERE message = 'in flight'", &[])
        .await?;
    assert_eq!(stale.get::<_, i64>(0), 0);

    drop(conn);
    let pool_ref = &pool;
    wait_for_condition(|| async move { pool_ref.in_use() == 0 }).await?;

    repl.final_sync(&cancel).await?;
    assert_eq!(switchover_state(&main).await?, "use_next_db");
    assert_eq!(table_json(&main, "alerts").await?, table_json(&next, "alerts").await?);

    // the idle main connection is re-checked and replaced
    let conn = pool.get().await?;
    assert_eq!(conn.connection().target(), Target::Next);
    assert!(provider.is_flipped());
    let db: String = conn.query_one("SELECT current_database()", &[]).await?.get(0);
    assert_eq!(db, "next_db");

    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
#[serial]
async fn test_write_committed_while_final_sync_waits_is_copied() -> Result<()> {
    init_tracing();

    let pg = TestPostgres::start().await?;
    let pair = pg.switchover_pair().await?;
    let main = pair.connect_main().await?;
    let next = pair.connect_next().await?;
    let app = pair.connect_main().await?;
    seed_users(&main, &[2]).await?;

    let config = replicator_config().with_final_lock_timeout(Duration::from_secs(20));
    let mut repl = synced_replicator_with(&pair, config).await?;
    let cancel = CancellationToken::new();

    // an application session is using main when the final sync starts
    app.execute(LOCK_SHARED_SQL, &[&SWITCHOVER_LOCK_ID]).await?;

    let writer = async {
        let main = &main;
        wait_for_condition(|| async move {
            match main.query_one(WAITING_LOCKS_SQL, &[]).await {
                Ok(row) => row.get::<_, i64>(0) == 1,
                Err(_) => false,
            }
        })
        .await?;

        // commits after the final sync asked for the lock, before it is granted
        seed_users(&app, &[3]).await?;
        app.execute(UNLOCK_SHARED_SQL, &[&SWITCHOVER_LOCK_ID]).await?;
        anyhow::Ok(())
    };
    let (flipped, written) = tokio::join!(repl.final_sync(&cancel), writer);
    written?;
    let stats = flipped?;
    info!(%stats, "Final sync applied after waiting for the lock");
    assert_eq!(stats.inserted, 4);

    assert_eq!(switchover_state(&main).await?, "use_next_db");
    assert_eq!(count_rows(&next, "users").await?, 2);
    assert_eq!(count_rows(&next, "alerts").await?, 5);
    assert_eq!(table_json(&main, "users").await?, table_json(&next, "users").await?);
    assert_eq!(table_json(&main, "alerts").await?, table_json(&next, "alerts").await?);
    assert_eq!(count_rows(&main, "change_log").await?, 0);

    // the exclusive lock is released with the session still open
    let held = main
        .query_one(
            "SELECT count(*) FROM pg_locks WHERE locktype = 'advisory' AND objid = $1",
            &[&(SWITCHOVER_LOCK_ID as u32)],
        )
        .await?;
    assert_eq!(held.get::<_, i64>(0), 0);

    Ok(())
}

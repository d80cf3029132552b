//! Message log integration tests
//!
//! Every node appends to and replays the same `switchover_log` table, so
//! positions must be gap-free and every reader must see one total order.
//!
//! Run with: cargo test -p switchover-integration-tests --test message_log -- --ignored --nocapture
//!
//! Requirements: Docker must be running for testcontainers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::try_join_all;
use serial_test::serial;
use switchover_cluster::msglog::subscribe;
use switchover_cluster::{LogStore, Message, MessageLog, Payload};
use switchover_integration_tests::fixtures::*;
use switchover_integration_tests::helpers::*;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const WRITERS: usize = 4;
const PER_WRITER: usize = 25;

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
#[serial]
async fn test_concurrent_appends_are_gap_free_and_ordered() -> Result<()> {
    init_tracing();

    let pg = TestPostgres::start().await?;
    let pair = pg.switchover_pair().await?;

    let writers = (0..WRITERS).map(|_| {
        let config = pair.main.clone();
        async move {
            let log = MessageLog::connect(&config).await?;
            let node = Uuid::new_v4();
            let mut positions = Vec::with_capacity(PER_WRITER);
            for i in 0..PER_WRITER {
                let msg = Message::new(node, None, Payload::Status(i.to_string()));
                positions.push(log.append(&msg).await?);
            }
            anyhow::Ok(positions)
        }
    });
    let positions = try_join_all(writers).await?;

    // each writer sees its own appends in increasing positions
    for own in &positions {
        assert!(own.windows(2).all(|w| w[0] < w[1]));
    }
    let mut all: Vec<i64> = positions.into_iter().flatten().collect();
    all.sort_unstable();
    let expected: Vec<i64> = (1..=(WRITERS * PER_WRITER) as i64).collect();
    assert_eq!(all, expected);

    // readers see each writer's messages in append order
    let reader = MessageLog::connect(&pair.main).await?;
    let (last, messages) = reader.read_after(0, 1000).await?;
    assert_eq!(last, (WRITERS * PER_WRITER) as i64);
    assert_eq!(messages.len(), WRITERS * PER_WRITER);

    let mut next_seq: HashMap<Uuid, usize> = HashMap::new();
    for msg in &messages {
        let Payload::Status(seq) = &msg.body else {
            panic!("unexpected payload {:?}", msg.body);
        };
        let expected = next_seq.entry(msg.node_id).or_insert(0);
        assert_eq!(seq.parse::<usize>()?, *expected);
        *expected += 1;
    }
    assert_eq!(next_seq.len(), WRITERS);

    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
#[serial]
async fn test_replay_starts_before_last_reset() -> Result<()> {
    init_tracing();

    let pg = TestPostgres::start().await?;
    let pair = pg.switchover_pair().await?;
    let log = MessageLog::connect(&pair.main).await?;
    let node = Uuid::new_v4();

    assert_eq!(log.position_before_last("reset").await?, 0);

    log.append(&Message::new(node, None, Payload::Reset)).await?;
    log.append(&Message::new(node, None, Payload::Cancel(None))).await?;
    let reset = Message::new(node, None, Payload::Reset);
    let position = log.append(&reset).await?;
    log.append(&Message::new(node, Some(reset.id), Payload::ResetEnd))
        .await?;

    assert_eq!(position, 3);
    assert_eq!(log.position_before_last("reset").await?, 2);
    assert_eq!(log.last_id().await?, 4);

    let (_, replay) = log.read_after(2, 100).await?;
    assert_eq!(replay.len(), 2);
    assert_eq!(replay[0], reset);
    assert_eq!(replay[1].ack_id, Some(reset.id));

    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
#[serial]
async fn test_subscriber_follows_new_appends() -> Result<()> {
    init_tracing();

    let pg = TestPostgres::start().await?;
    let pair = pg.switchover_pair().await?;
    let writer = MessageLog::connect(&pair.main).await?;
    let node = Uuid::new_v4();

    // history before the subscription point is not delivered
    writer.append(&Message::new(node, None, Payload::Ping)).await?;
    let tail = writer.last_id().await?;

    let reader: Arc<dyn LogStore> = Arc::new(MessageLog::connect(&pair.main).await?);
    let shutdown = CancellationToken::new();
    let (mut rx, handle) = subscribe(reader, tail, Duration::from_millis(20), shutdown.clone());

    let sent: Vec<Message> = (0..5)
        .map(|i| Message::new(node, None, Payload::Status(format!("step {i}"))))
        .collect();
    for msg in &sent {
        writer.append(msg).await?;
    }

    for expected in &sent {
        let got = timeout(Duration::from_secs(5), rx.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("subscription ended early"))?;
        assert_eq!(&got, expected);
    }

    shutdown.cancel();
    timeout(Duration::from_secs(5), handle).await??;
    Ok(())
}

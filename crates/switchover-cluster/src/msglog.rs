//! Durable, totally ordered message log
//!
//! Messages live in `switchover_log` on the main database. Appends take an
//! exclusive table lock so concurrent writers on different nodes get gap-free,
//! strictly increasing ids; readers poll for ids above the last one seen.
//!
//! A node cannot resume from its own acknowledgements: node ids are chosen
//! per process, so a restarted node never recognises what it acked before.
//! Readers start at the tail ([`LogStore::last_id`]) or at an explicit
//! position such as [`LogStore::position_before_last`]`("reset")`.
//!
//! # Example
//!
//! ```rust,ignore
//! use switchover_cluster::msglog::{subscribe, LogStore, MessageLog};
//!
//! let log: Arc<dyn LogStore> = Arc::new(MessageLog::connect(&main_config).await?);
//! let (mut rx, _reader) = subscribe(log.clone(), log.last_id().await?, Duration::from_millis(250), shutdown);
//! log.append(&Message::new(node_id, None, Payload::Reset)).await?;
//! while let Some(msg) = rx.recv().await {
//!     println!("{} from {}", msg.kind(), msg.node_id);
//! }
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use switchover_db::ConnectionConfig;

use crate::error::Result;
use crate::message::Message;
use crate::observability::ClusterMetrics;

/// Backing table, created by [`MessageLog::install`].
pub const LOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS switchover_log (
    id BIGINT PRIMARY KEY,
    timestamp TIMESTAMPTZ NOT NULL DEFAULT now(),
    data JSONB NOT NULL
)
"#;

const LOCK_SQL: &str = "LOCK TABLE switchover_log IN EXCLUSIVE MODE";
const APPEND_SQL: &str = "INSERT INTO switchover_log (id, data) SELECT coalesce(max(id), 0) + 1, $1::jsonb FROM switchover_log RETURNING id";
const READ_SQL: &str = "SELECT id, data FROM switchover_log WHERE id > $1 ORDER BY id LIMIT $2";
const LAST_ID_SQL: &str = "SELECT coalesce(max(id), 0) FROM switchover_log";
const BEFORE_LAST_SQL: &str =
    "SELECT coalesce(max(id) - 1, 0) FROM switchover_log WHERE data->>'type' = $1";

/// Messages fetched per poll
const READ_BATCH: i64 = 100;

/// Append-only, totally ordered message storage.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append a message; returns its log position.
    async fn append(&self, msg: &Message) -> Result<i64>;

    /// Position of the newest message, 0 when empty.
    async fn last_id(&self) -> Result<i64>;

    /// Up to `limit` messages after position `after`, in order, plus the
    /// position of the last entry read.
    async fn read_after(&self, after: i64, limit: i64) -> Result<(i64, Vec<Message>)>;

    /// Position just before the newest message of type `kind`, 0 when there
    /// is none. Replaying from here reconstructs the current epoch.
    async fn position_before_last(&self, kind: &str) -> Result<i64>;
}

/// Message log over one dedicated session.
pub struct MessageLog {
    client: Mutex<Client>,
}

impl std::fmt::Debug for MessageLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLog").finish_non_exhaustive()
    }
}

impl MessageLog {
    /// Use an existing session.
    pub fn new(client: Client) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }

    /// Open a dedicated session to the database holding the log.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let client = switchover_db::postgres::connect_client(config).await?;
        Ok(Self::new(client))
    }

    /// Create the log table if missing.
    pub async fn install(&self) -> Result<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(LOG_SCHEMA)
            .await
            .map_err(|e| switchover_db::Error::from_pg(e, LOG_SCHEMA))?;
        Ok(())
    }
}

#[async_trait]
impl LogStore for MessageLog {
    async fn append(&self, msg: &Message) -> Result<i64> {
        let data = serde_json::to_value(msg)?;
        let mut client = self.client.lock().await;

        let tx = client.transaction().await?;
        tx.batch_execute(LOCK_SQL)
            .await
            .map_err(|e| switchover_db::Error::from_pg(e, LOCK_SQL))?;
        let row = tx
            .query_one(APPEND_SQL, &[&data])
            .await
            .map_err(|e| switchover_db::Error::from_pg(e, APPEND_SQL))?;
        tx.commit().await?;

        let position: i64 = row.try_get(0)?;
        trace!(position, msg_id = %msg.id, kind = msg.kind(), "Appended message");
        Ok(position)
    }

    async fn last_id(&self) -> Result<i64> {
        let client = self.client.lock().await;
        let row = client
            .query_one(LAST_ID_SQL, &[])
            .await
            .map_err(|e| switchover_db::Error::from_pg(e, LAST_ID_SQL))?;
        Ok(row.try_get(0)?)
    }

    async fn position_before_last(&self, kind: &str) -> Result<i64> {
        let client = self.client.lock().await;
        let row = client
            .query_one(BEFORE_LAST_SQL, &[&kind])
            .await
            .map_err(|e| switchover_db::Error::from_pg(e, BEFORE_LAST_SQL))?;
        Ok(row.try_get(0)?)
    }

    /// Entries that do not decode are skipped (every reader skips the same
    /// ones) but still advance the returned position.
    async fn read_after(&self, after: i64, limit: i64) -> Result<(i64, Vec<Message>)> {
        let rows = {
            let client = self.client.lock().await;
            client
                .query(READ_SQL, &[&after, &limit])
                .await
                .map_err(|e| switchover_db::Error::from_pg(e, READ_SQL))?
        };

        let mut last = after;
        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get(0)?;
            let data: serde_json::Value = row.try_get(1)?;
            last = id;
            match serde_json::from_value::<Message>(data) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!(position = id, "Skipping undecodable log entry: {}", e),
            }
        }
        Ok((last, messages))
    }
}

/// In-process log shared by every node of a single process.
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<Message>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every entry, in order.
    pub async fn entries(&self) -> Vec<Message> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl LogStore for MemoryLog {
    async fn append(&self, msg: &Message) -> Result<i64> {
        let mut entries = self.entries.lock().await;
        entries.push(msg.clone());
        Ok(entries.len() as i64)
    }

    async fn last_id(&self) -> Result<i64> {
        Ok(self.entries.lock().await.len() as i64)
    }

    async fn read_after(&self, after: i64, limit: i64) -> Result<(i64, Vec<Message>)> {
        let entries = self.entries.lock().await;
        let start = (after.max(0) as usize).min(entries.len());
        let end = start.saturating_add(limit.max(0) as usize).min(entries.len());
        Ok((end as i64, entries[start..end].to_vec()))
    }

    async fn position_before_last(&self, kind: &str) -> Result<i64> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .rposition(|m| m.kind() == kind)
            .map_or(0, |i| i as i64))
    }
}

/// Tail `log` from position `after` until `shutdown` fires or the receiver
/// is dropped.
///
/// Polls at most once per `poll_interval` while caught up; read errors are
/// logged and retried on the next poll.
pub fn subscribe(
    log: Arc<dyn LogStore>,
    after: i64,
    poll_interval: Duration,
    shutdown: CancellationToken,
) -> (mpsc::Receiver<Message>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(READ_BATCH as usize);
    let handle = tokio::spawn(async move {
        let mut position = after;
        debug!(position, "Message log reader started");
        loop {
            let caught_up = match log.read_after(position, READ_BATCH).await {
                Ok((last, messages)) => {
                    let full = last - position >= READ_BATCH;
                    position = last;
                    for msg in messages {
                        ClusterMetrics::increment_observed(msg.kind());
                        if tx.send(msg).await.is_err() {
                            debug!("Message log receiver dropped");
                            return;
                        }
                    }
                    !full
                }
                Err(e) => {
                    warn!("Failed to read message log: {}", e);
                    true
                }
            };

            if caught_up {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            } else if shutdown.is_cancelled() {
                return;
            }
        }
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use uuid::Uuid;

    #[test]
    fn test_append_is_serialized_by_table_lock() {
        assert!(LOCK_SQL.contains("EXCLUSIVE MODE"));
        assert!(APPEND_SQL.contains("coalesce(max(id), 0) + 1"));
    }

    #[test]
    fn test_read_is_ordered() {
        assert!(READ_SQL.contains("id > $1 ORDER BY id"));
    }

    fn msg(body: Payload) -> Message {
        Message::new(Uuid::new_v4(), None, body)
    }

    #[tokio::test]
    async fn test_memory_log_positions() {
        let log = MemoryLog::new();
        assert_eq!(log.last_id().await.unwrap(), 0);
        assert_eq!(log.append(&msg(Payload::Reset)).await.unwrap(), 1);
        assert_eq!(log.append(&msg(Payload::Ping)).await.unwrap(), 2);

        let (last, messages) = log.read_after(1, 10).await.unwrap();
        assert_eq!(last, 2);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, Payload::Ping);

        let (last, messages) = log.read_after(2, 10).await.unwrap();
        assert_eq!(last, 2);
        assert!(messages.is_empty());

        assert_eq!(log.position_before_last("ping").await.unwrap(), 1);
        assert_eq!(log.position_before_last("reset").await.unwrap(), 0);
        assert_eq!(log.position_before_last("done").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_delivers_in_order() {
        let log = Arc::new(MemoryLog::new());
        log.append(&msg(Payload::Reset)).await.unwrap();

        let shutdown = CancellationToken::new();
        let store: Arc<dyn LogStore> = log.clone();
        let (mut rx, reader) = subscribe(store, 1, Duration::from_millis(5), shutdown.clone());

        let sent: Vec<Message> = (0..150).map(|_| msg(Payload::Ping)).collect();
        for m in &sent {
            log.append(m).await.unwrap();
        }

        for expected in &sent {
            let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got.id, expected.id);
        }

        shutdown.cancel();
        reader.await.unwrap();
    }
}

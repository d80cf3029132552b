//! Out-of-process operator client
//!
//! Operator commands run from a short-lived process must not join the
//! cluster: a node that says `hello` and then exits would stall every later
//! pause. An [`Operator`] instead replays the current epoch (everything from
//! the last `reset`) into a passive [`TaskState`] to learn what the cluster
//! believes, and appends operator messages directly.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::coordinator::append;
use crate::error::{ClusterError, Result};
use crate::machine::{ClusterState, TaskState};
use crate::message::{NodeInfo, Payload};
use crate::msglog::LogStore;
use crate::status::ClusterStatus;

const READ_BATCH: i64 = 500;

/// Passive observer that can also issue operator commands.
pub struct Operator {
    id: Uuid,
    log: Arc<dyn LogStore>,
    view: TaskState,
    position: i64,
    poll_interval: Duration,
    acks: Option<(Uuid, HashSet<Uuid>)>,
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator")
            .field("id", &self.id)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl Operator {
    /// Replay the current epoch. `old_db`/`new_db` identify the database
    /// pair the operator expects the cluster to be switching.
    pub async fn attach(
        log: Arc<dyn LogStore>,
        old_db: Uuid,
        new_db: Uuid,
        poll_interval: Duration,
    ) -> Result<Self> {
        let position = log.position_before_last(Payload::Reset.kind()).await?;
        let local = NodeInfo::new(false, old_db, new_db);
        let mut operator = Self {
            id: local.id,
            log,
            view: TaskState::new(local),
            position,
            poll_interval,
            acks: None,
        };
        operator.refresh().await?;
        Ok(operator)
    }

    /// Catch up with the log and return the cluster view.
    pub async fn refresh(&mut self) -> Result<ClusterStatus> {
        loop {
            let (last, messages) = self.log.read_after(self.position, READ_BATCH).await?;
            let caught_up = last - self.position < READ_BATCH;
            self.position = last;
            for msg in &messages {
                if let (Payload::Ack, Some(ack), Some((ping, acked))) =
                    (&msg.body, msg.ack_id, self.acks.as_mut())
                {
                    if ack == *ping {
                        acked.insert(msg.node_id);
                    }
                }
                // observers never act
                let _ = self.view.process(msg);
            }
            if caught_up {
                break;
            }
        }
        debug!(position = self.position, state = %self.view.state(), "Operator view refreshed");
        Ok(self.view.status())
    }

    pub async fn reset(&mut self) -> Result<()> {
        append(self.log.as_ref(), self.id, None, Payload::Reset).await?;
        Ok(())
    }

    pub async fn cancel(&mut self) -> Result<()> {
        append(
            self.log.as_ref(),
            self.id,
            None,
            Payload::Cancel(Some("cancelled by operator".into())),
        )
        .await?;
        Ok(())
    }

    /// Begin the switchover; fails unless the cluster is idle.
    pub async fn execute(&mut self) -> Result<()> {
        let status = self.refresh().await?;
        if status.state != ClusterState::Idle {
            return Err(ClusterError::NotIdle(status.state));
        }
        append(self.log.as_ref(), self.id, status.last_msg_id, Payload::Execute).await?;
        Ok(())
    }

    /// Ping every node of the current epoch; returns how many answered.
    pub async fn ping(&mut self, timeout: Duration) -> Result<usize> {
        let status = self.refresh().await?;
        let expected: HashSet<Uuid> = status.nodes.iter().map(|n| n.id).collect();

        let ping = append(self.log.as_ref(), self.id, None, Payload::Ping).await?;
        self.acks = Some((ping, HashSet::new()));

        let deadline = Instant::now() + timeout;
        let result = loop {
            self.refresh().await?;
            let acked = self.acks.as_ref().map(|(_, a)| a.clone()).unwrap_or_default();
            let missing = expected.difference(&acked).count();
            if missing == 0 {
                break Ok(expected.len());
            }
            if Instant::now() >= deadline {
                break Err(ClusterError::MissingAcks {
                    missing,
                    total: expected.len(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        };
        self.acks = None;
        result
    }

    /// Poll until the cluster view satisfies `done`.
    pub async fn wait_for(
        &mut self,
        done: impl Fn(&ClusterStatus) -> bool,
        timeout: Duration,
    ) -> Result<ClusterStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.refresh().await?;
            if done(&status) {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(ClusterError::Timeout);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

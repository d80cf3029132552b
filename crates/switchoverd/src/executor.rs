//! Replicator-backed task executor
//!
//! Runs the leader's side of a switchover: the sync task copies and catches
//! up until the change backlog is small, the exec task drains the rest and
//! commits the flip.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use switchover_cluster::{Executor, TaskContext, TaskResult};
use switchover_db::ConnectionConfig;
use switchover_sync::{LogicalReplicator, ProgressFn, ReplicatorConfig, SyncStats};

/// How many catch-up passes to run before pausing the application.
///
/// Stops early once a pass applied no more than `threshold` changes.
pub(crate) fn should_pause(stats: &SyncStats, threshold: usize, pass: usize, max_passes: usize) -> bool {
    stats.changes <= threshold || pass >= max_passes
}

/// [`Executor`] over one [`LogicalReplicator`] session.
pub struct ReplicatorExecutor {
    config: ReplicatorConfig,
    main: ConnectionConfig,
    next: ConnectionConfig,
    session: Mutex<Option<LogicalReplicator>>,
}

impl std::fmt::Debug for ReplicatorExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatorExecutor")
            .field("config", &self.config)
            .field("main", &self.main)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

impl ReplicatorExecutor {
    pub fn new(config: ReplicatorConfig, main: ConnectionConfig, next: ConnectionConfig) -> Self {
        Self {
            config,
            main,
            next,
            session: Mutex::new(None),
        }
    }

    fn progress(ctx: &TaskContext) -> ProgressFn {
        let ctx = ctx.clone();
        Arc::new(move |status: &str| ctx.status(status))
    }
}

#[async_trait]
impl Executor for ReplicatorExecutor {
    async fn reset(&self, ctx: &TaskContext) -> TaskResult {
        let mut session = self.session.lock().await;
        if session.is_none() {
            ctx.status("connecting replicator");
            let repl = LogicalReplicator::connect(self.config.clone(), &self.main, &self.next).await?;
            *session = Some(repl);
        }
        let Some(repl) = session.as_mut() else {
            return Err("replicator session unavailable".into());
        };
        repl.set_progress(Some(Self::progress(ctx)));
        repl.reset().await?;
        ctx.status("reset complete");
        Ok(())
    }

    async fn sync(&self, ctx: &TaskContext) -> TaskResult {
        let mut session = self.session.lock().await;
        let Some(repl) = session.as_mut() else {
            return Err("replicator was not reset in this epoch".into());
        };
        repl.set_progress(Some(Self::progress(ctx)));
        let cancel = ctx.cancel_token();

        repl.reset().await?;
        repl.start(cancel).await?;
        let rows = repl.full_initial_sync(cancel).await?;
        ctx.status(format!("initial sync copied {rows} rows"));

        let max_passes = self.config.max_sync_passes.max(1);
        for pass in 1..=max_passes {
            let stats = repl.logical_sync(cancel).await?;
            ctx.status(format!("sync pass {pass}: {stats}"));
            if should_pause(&stats, self.config.pause_threshold, pass, max_passes) {
                info!(pass, changes = stats.changes, "Backlog small enough to pause");
                break;
            }
        }
        Ok(())
    }

    async fn exec(&self, ctx: &TaskContext) -> TaskResult {
        let mut session = self.session.lock().await;
        let Some(repl) = session.as_mut() else {
            return Err("replicator was not reset in this epoch".into());
        };
        repl.set_progress(Some(Self::progress(ctx)));
        let cancel = ctx.cancel_token();

        for pass in 1..=self.config.exec_passes {
            let stats = repl.logical_sync(cancel).await?;
            ctx.status(format!("exec pass {pass}: {stats}"));
        }

        let stats = repl.final_sync(cancel).await?;
        ctx.status(format!("final sync: {stats}"));
        info!(%stats, "Switchover committed");

        // releases the replication session lock
        *session = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(changes: usize) -> SyncStats {
        SyncStats {
            changes,
            ..Default::default()
        }
    }

    #[test]
    fn test_pause_when_backlog_small() {
        assert!(should_pause(&stats(100), 100, 1, 10));
        assert!(!should_pause(&stats(101), 100, 1, 10));
    }

    #[test]
    fn test_pause_after_max_passes() {
        assert!(should_pause(&stats(5_000), 100, 10, 10));
        assert!(!should_pause(&stats(5_000), 100, 9, 10));
    }

    #[tokio::test]
    async fn test_sync_without_reset_fails() {
        let executor = ReplicatorExecutor::new(
            ReplicatorConfig::default(),
            ConnectionConfig::new("postgres://localhost/main"),
            ConnectionConfig::new("postgres://localhost/next"),
        );
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = TaskContext::new(
            uuid::Uuid::new_v4(),
            tokio_util::sync::CancellationToken::new(),
            tx,
        );

        let err = executor.sync(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("not reset"));
    }
}

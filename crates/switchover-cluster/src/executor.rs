//! Task executor seam
//!
//! The coordinator decides *when* the leader resets, syncs and executes; an
//! [`Executor`] decides *how*. The daemon plugs the logical replicator in
//! here, tests plug in scripted fakes.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Error returned by a task; reported to the cluster as a plain string.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a task.
pub type TaskResult = std::result::Result<(), TaskError>;

/// Handle given to a running task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    trigger: Uuid,
    cancel: CancellationToken,
    progress: mpsc::UnboundedSender<(Uuid, String)>,
}

impl TaskContext {
    pub fn new(
        trigger: Uuid,
        cancel: CancellationToken,
        progress: mpsc::UnboundedSender<(Uuid, String)>,
    ) -> Self {
        Self {
            trigger,
            cancel,
            progress,
        }
    }

    /// Message that started the task.
    pub fn trigger(&self) -> Uuid {
        self.trigger
    }

    /// Fires when the cluster cancels or resets.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report progress. Throttled by the coordinator and dropped once the
    /// task is stale.
    pub fn status(&self, status: impl Into<String>) {
        // coordinator gone means shutdown; nothing left to report to
        let _ = self.progress.send((self.trigger, status.into()));
    }
}

/// Leader-side switchover work.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Put the destination back to a clean slate.
    async fn reset(&self, ctx: &TaskContext) -> TaskResult;

    /// Copy everything and catch up until pausing is cheap.
    async fn sync(&self, ctx: &TaskContext) -> TaskResult;

    /// Final catch-up and the flip, with every node paused.
    async fn exec(&self, ctx: &TaskContext) -> TaskResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_carries_trigger() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let trigger = Uuid::new_v4();
        let ctx = TaskContext::new(trigger, CancellationToken::new(), tx);

        ctx.status("copying users");

        assert_eq!(rx.try_recv().unwrap(), (trigger, "copying users".to_string()));
    }

    #[test]
    fn test_status_after_shutdown_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let ctx = TaskContext::new(Uuid::new_v4(), CancellationToken::new(), tx);
        ctx.status("late");
    }
}

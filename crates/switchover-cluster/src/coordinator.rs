//! Cluster coordinator actor
//!
//! One coordinator runs per node. It owns the node's [`TaskState`] and is the
//! only thing that mutates it: log messages, operator commands, task progress
//! and the status tick are all funneled through a single `select!` loop, so
//! state transitions happen strictly in log order.
//!
//! ```text
//!  message log ──reader──►┐
//!  operator handle ──────►│  Coordinator  ──append──► message log
//!  task progress ────────►│  (TaskState)  ──spawn───► task (executor / pauser)
//!  status tick ──────────►┘       │
//!                                 └─watch──► ClusterStatus
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let (handle, coordinator) = Coordinator::start(
//!     CoordinatorConfig::default(),
//!     NodeInfo::new(true, main_info.id, next_info.id),
//!     log,
//!     executor,
//!     pool.clone(),
//!     shutdown.clone(),
//! )
//! .await?;
//!
//! handle.reset().await?;
//! handle.wait_for_state(ClusterState::Idle, Duration::from_secs(30)).await?;
//! handle.execute().await?;
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use switchover_db::PauseResumer;

use crate::config::CoordinatorConfig;
use crate::error::{ClusterError, Result};
use crate::executor::{Executor, TaskContext, TaskError, TaskResult};
use crate::machine::{Action, ClusterState, TaskKind, TaskState};
use crate::message::{Message, NodeInfo, Payload};
use crate::msglog::{subscribe, LogStore};
use crate::observability::ClusterMetrics;
use crate::status::ClusterStatus;

const COMMAND_BUFFER: usize = 64;

/// Append `body` from `node_id`; returns the new message id.
pub(crate) async fn append(
    log: &dyn LogStore,
    node_id: Uuid,
    ack: Option<Uuid>,
    body: Payload,
) -> Result<Uuid> {
    let msg = Message::new(node_id, ack, body);
    log.append(&msg).await?;
    ClusterMetrics::increment_appended(msg.kind());
    Ok(msg.id)
}

/// Wait until `status` satisfies `done`.
pub(crate) async fn watch_until(
    mut status: watch::Receiver<ClusterStatus>,
    done: impl Fn(&ClusterStatus) -> bool,
) -> Result<ClusterStatus> {
    loop {
        {
            let current = status.borrow_and_update();
            if done(&current) {
                return Ok(current.clone());
            }
        }
        status
            .changed()
            .await
            .map_err(|_| ClusterError::ChannelClosed)?;
    }
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    /// Reply once message `id` has been processed
    Watch { id: Uuid, reply: oneshot::Sender<()> },
    /// Reply once every known node acknowledged `ping`
    WatchAcks { ping: Uuid, reply: oneshot::Sender<()> },
    /// Stop tracking `ping`; reply with (missing, total)
    ForgetPing {
        ping: Uuid,
        reply: oneshot::Sender<(usize, usize)>,
    },
}

/// Operator interface to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    node_id: Uuid,
    log: Arc<dyn LogStore>,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ClusterStatus>,
    config: CoordinatorConfig,
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl CoordinatorHandle {
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Latest snapshot of this node's view.
    pub fn status(&self) -> ClusterStatus {
        self.status.borrow().clone()
    }

    /// Start a new epoch: every node re-announces itself and a leader is
    /// elected.
    pub async fn reset(&self) -> Result<()> {
        self.send_and_wait(Payload::Reset, None).await
    }

    /// Abort whatever the cluster is doing.
    pub async fn cancel(&self) -> Result<()> {
        self.send_and_wait(Payload::Cancel(None), None).await
    }

    /// Begin the switchover. Only valid while the cluster is idle.
    pub async fn execute(&self) -> Result<()> {
        let status = self.status();
        if status.state != ClusterState::Idle {
            return Err(ClusterError::NotIdle(status.state));
        }
        self.send_and_wait(Payload::Execute, status.last_msg_id).await
    }

    /// Check that every known node is processing the log.
    pub async fn ping(&self) -> Result<()> {
        let msg = Message::new(self.node_id, None, Payload::Ping);
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::WatchAcks {
                ping: msg.id,
                reply: tx,
            })
            .await?;
        self.log.append(&msg).await?;
        ClusterMetrics::increment_appended(msg.kind());

        match tokio::time::timeout(self.config.ping_timeout(), rx).await {
            Ok(acked) => Ok(acked?),
            Err(_) => {
                let (tx, rx) = oneshot::channel();
                self.commands
                    .send(Command::ForgetPing {
                        ping: msg.id,
                        reply: tx,
                    })
                    .await?;
                let (missing, total) = rx.await?;
                Err(ClusterError::MissingAcks { missing, total })
            }
        }
    }

    /// Wait until this node reaches `state`.
    pub async fn wait_for_state(&self, state: ClusterState, timeout: Duration) -> Result<ClusterStatus> {
        self.wait_for(move |s| s.state == state, timeout).await
    }

    /// Wait until this node's view satisfies `done`.
    pub async fn wait_for(
        &self,
        done: impl Fn(&ClusterStatus) -> bool,
        timeout: Duration,
    ) -> Result<ClusterStatus> {
        tokio::time::timeout(timeout, watch_until(self.status.clone(), done)).await?
    }

    async fn send_and_wait(&self, body: Payload, ack: Option<Uuid>) -> Result<()> {
        let msg = Message::new(self.node_id, ack, body);
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Watch {
                id: msg.id,
                reply: tx,
            })
            .await?;
        self.log.append(&msg).await?;
        ClusterMetrics::increment_appended(msg.kind());
        tokio::time::timeout(self.config.command_timeout(), rx).await??;
        Ok(())
    }
}

// ============================================================================
// Coordinator
// ============================================================================

struct RunningTask {
    kind: TaskKind,
    cancel: CancellationToken,
}

struct PendingPing {
    acked: HashSet<Uuid>,
    reply: oneshot::Sender<()>,
}

/// The per-node coordinator loop.
pub struct Coordinator {
    config: CoordinatorConfig,
    state: TaskState,
    log: Arc<dyn LogStore>,
    executor: Arc<dyn Executor>,
    pauser: Arc<dyn PauseResumer>,
    commands: mpsc::Receiver<Command>,
    messages: mpsc::Receiver<Message>,
    progress_tx: mpsc::UnboundedSender<(Uuid, String)>,
    progress_rx: mpsc::UnboundedReceiver<(Uuid, String)>,
    status_tx: watch::Sender<ClusterStatus>,
    waiters: HashMap<Uuid, oneshot::Sender<()>>,
    pings: HashMap<Uuid, PendingPing>,
    task: Option<RunningTask>,
    shutdown: CancellationToken,
}

impl Coordinator {
    /// Join the cluster and start processing the log.
    ///
    /// Reads from `config.resume_from` when set, otherwise from the current
    /// tail. The node announces itself with `hello` and stays `Unknown`
    /// until the next reset.
    pub async fn start(
        config: CoordinatorConfig,
        local: NodeInfo,
        log: Arc<dyn LogStore>,
        executor: Arc<dyn Executor>,
        pauser: Arc<dyn PauseResumer>,
        shutdown: CancellationToken,
    ) -> Result<(CoordinatorHandle, JoinHandle<()>)> {
        config.validate()?;

        let position = match config.resume_from {
            Some(position) => position,
            None => log.last_id().await?,
        };
        let (messages, reader) = subscribe(
            Arc::clone(&log),
            position,
            config.log_poll(),
            shutdown.child_token(),
        );

        let node_id = local.id;
        let state = TaskState::new(local);
        let (status_tx, status_rx) = watch::channel(state.status());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let handle = CoordinatorHandle {
            node_id,
            log: Arc::clone(&log),
            commands: command_tx,
            status: status_rx,
            config: config.clone(),
        };

        let coordinator = Self {
            config,
            state,
            log,
            executor,
            pauser,
            commands: command_rx,
            messages,
            progress_tx,
            progress_rx,
            status_tx,
            waiters: HashMap::new(),
            pings: HashMap::new(),
            task: None,
            shutdown,
        };

        info!(node_id = %node_id, position, "Starting coordinator");
        let join = tokio::spawn(coordinator.run(reader));
        Ok((handle, join))
    }

    async fn run(mut self, reader: JoinHandle<()>) {
        let hello = self.state.hello();
        self.perform(hello).await;

        let mut status_tick = tokio::time::interval(self.config.status_throttle());
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!(node_id = %self.state.local().id, "Coordinator shutting down");
                    break;
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command);
                }
                msg = self.messages.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => {
                        warn!("Message log reader stopped");
                        break;
                    }
                },
                Some((trigger, status)) = self.progress_rx.recv() => {
                    self.state.set_progress(trigger, status);
                }
                _ = status_tick.tick() => {
                    if let Some(update) = self.state.take_status_update() {
                        self.perform(update).await;
                    }
                }
            }
        }

        self.cancel_task();
        reader.abort();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Watch { id, reply } => {
                self.waiters.insert(id, reply);
            }
            Command::WatchAcks { ping, reply } => {
                self.pings.insert(
                    ping,
                    PendingPing {
                        acked: HashSet::new(),
                        reply,
                    },
                );
            }
            Command::ForgetPing { ping, reply } => {
                let expected = self.expected_acks();
                let acked = self
                    .pings
                    .remove(&ping)
                    .map(|p| p.acked)
                    .unwrap_or_default();
                let missing = expected.difference(&acked).count();
                let _ = reply.send((missing, expected.len()));
            }
        }
    }

    async fn handle_message(&mut self, msg: Message) {
        debug!(
            msg_id = %msg.id,
            node_id = %msg.node_id,
            kind = msg.kind(),
            "Processing message"
        );

        if let (Payload::Ack, Some(ping)) = (&msg.body, msg.ack_id) {
            if let Some(pending) = self.pings.get_mut(&ping) {
                pending.acked.insert(msg.node_id);
            }
        }

        for action in self.state.process(&msg) {
            self.perform(action).await;
        }
        self.status_tx.send_replace(self.state.status());

        if let Some(waiter) = self.waiters.remove(&msg.id) {
            let _ = waiter.send(());
        }
        self.complete_pings();
    }

    async fn perform(&mut self, action: Action) {
        match action {
            Action::Send { body, ack } => {
                let kind = body.kind();
                if let Err(e) = append(self.log.as_ref(), self.state.local().id, ack, body).await {
                    error!(kind, "Failed to append message: {}", e);
                }
            }
            Action::StartTask { kind, trigger } => self.start_task(kind, trigger),
            Action::CancelTask => self.cancel_task(),
            Action::Resume => {
                info!("Resuming database activity");
                if let Err(e) = self.pauser.resume().await {
                    warn!("Resume failed: {}", e);
                }
            }
        }
    }

    fn start_task(&mut self, kind: TaskKind, trigger: Uuid) {
        self.cancel_task();

        let cancel = self.shutdown.child_token();
        let ctx = TaskContext::new(trigger, cancel.clone(), self.progress_tx.clone());
        let runner = TaskRunner {
            kind,
            node_id: self.state.local().id,
            log: Arc::clone(&self.log),
            executor: Arc::clone(&self.executor),
            pauser: Arc::clone(&self.pauser),
            reset_delay: self.config.reset_delay(),
            pause_timeout: self.config.pause_timeout(),
        };
        tokio::spawn(runner.run(ctx));
        self.task = Some(RunningTask { kind, cancel });
    }

    fn cancel_task(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.cancel.is_cancelled() {
                debug!(task = task.kind.name(), "Cancelling task");
                task.cancel.cancel();
            }
        }
    }

    fn expected_acks(&self) -> HashSet<Uuid> {
        let mut expected: HashSet<Uuid> = self.state.nodes().map(|n| n.id).collect();
        expected.insert(self.state.local().id);
        expected
    }

    fn complete_pings(&mut self) {
        if self.pings.is_empty() {
            return;
        }
        let expected = self.expected_acks();
        let complete: Vec<Uuid> = self
            .pings
            .iter()
            .filter(|(_, p)| expected.is_subset(&p.acked))
            .map(|(id, _)| *id)
            .collect();
        for id in complete {
            if let Some(pending) = self.pings.remove(&id) {
                let _ = pending.reply.send(());
            }
        }
    }
}

// ============================================================================
// Tasks
// ============================================================================

struct TaskRunner {
    kind: TaskKind,
    node_id: Uuid,
    log: Arc<dyn LogStore>,
    executor: Arc<dyn Executor>,
    pauser: Arc<dyn PauseResumer>,
    reset_delay: Duration,
    pause_timeout: Duration,
}

impl TaskRunner {
    async fn run(self, ctx: TaskContext) {
        let name = self.kind.name();
        let trigger = ctx.trigger();
        info!(task = name, trigger = %trigger, "Task started");
        self.send(trigger, Payload::TaskStart { name: name.into() })
            .await;

        let started = Instant::now();
        let result = self.execute(&ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        // a cancelled task leaves no trace; the canceller already moved on
        if ctx.is_cancelled() {
            info!(task = name, elapsed_ms, "Task cancelled");
            return;
        }
        ClusterMetrics::increment_tasks(name, result.is_ok());

        match result {
            Ok(()) => {
                info!(task = name, elapsed_ms, "Task finished");
                self.send(
                    trigger,
                    Payload::TaskEnd {
                        name: name.into(),
                        error: None,
                    },
                )
                .await;
                self.send(trigger, self.kind.follow_up()).await;
            }
            Err(e) => {
                error!(task = name, elapsed_ms, "Task failed: {}", e);
                self.send(
                    trigger,
                    Payload::TaskEnd {
                        name: name.into(),
                        error: Some(e.to_string()),
                    },
                )
                .await;
                self.send(trigger, Payload::Error(format!("{name}: {e}")))
                    .await;
            }
        }
    }

    async fn execute(&self, ctx: &TaskContext) -> TaskResult {
        match self.kind {
            TaskKind::Reset => {
                self.executor.reset(ctx).await?;
                tokio::select! {
                    _ = ctx.cancel_token().cancelled() => {}
                    _ = tokio::time::sleep(self.reset_delay) => {}
                }
                Ok(())
            }
            TaskKind::Sync => self.executor.sync(ctx).await,
            TaskKind::Pause => {
                info!("Pausing database activity");
                tokio::select! {
                    _ = ctx.cancel_token().cancelled() => Ok(()),
                    res = tokio::time::timeout(self.pause_timeout, self.pauser.pause()) => match res {
                        Ok(paused) => paused.map_err(|e| Box::new(e) as TaskError),
                        Err(_) => Err(TaskError::from(format!(
                            "pause timed out after {}ms",
                            self.pause_timeout.as_millis()
                        ))),
                    },
                }
            }
            TaskKind::Exec => self.executor.exec(ctx).await,
        }
    }

    async fn send(&self, trigger: Uuid, body: Payload) {
        let kind = body.kind();
        if let Err(e) = append(self.log.as_ref(), self.node_id, Some(trigger), body).await {
            error!(kind, "Failed to append task message: {}", e);
        }
    }
}

//! Coordinator state machine
//!
//! [`TaskState::process`] is the whole decision logic of a node: it consumes
//! one log message and returns the side effects to perform. It never does I/O,
//! so every node replaying the same log prefix derives the same state.
//!
//! ```text
//!             reset              reset-end           execute
//!  Unknown ─────────► Resetting ──────────► Idle ─────────────► Syncing
//!     ▲                  (hello…)                                  │ pause
//!     │ cancel / error /                                           ▼
//!     │ unexpected msg      Done ◄──────── Executing ◄──────── Pausing
//!     └───────────────────          done               paused (all nodes)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::message::{Message, NodeInfo, Payload};
use crate::status::ClusterStatus;

/// Reason attached to the `cancel` a node broadcasts on divergence.
pub const UNEXPECTED_MESSAGE: &str = "unexpected or invalid message";

/// Cluster-wide switchover state as derived from the message log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    #[default]
    Unknown,
    Resetting,
    Idle,
    Syncing,
    Pausing,
    Executing,
    Done,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::Unknown => "unknown",
            ClusterState::Resetting => "resetting",
            ClusterState::Idle => "idle",
            ClusterState::Syncing => "syncing",
            ClusterState::Pausing => "pausing",
            ClusterState::Executing => "executing",
            ClusterState::Done => "done",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Long-running work a node runs on behalf of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Leader only: reset the replicator, then wait for late hellos
    Reset,
    /// Leader only: initial sync plus catch-up passes
    Sync,
    /// Every node: pause local database activity
    Pause,
    /// Leader only: last catch-up passes and the final sync
    Exec,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Reset => "reset",
            TaskKind::Sync => "sync",
            TaskKind::Pause => "pause",
            TaskKind::Exec => "exec",
        }
    }

    /// Message appended when the task succeeds.
    pub fn follow_up(&self) -> Payload {
        match self {
            TaskKind::Reset => Payload::ResetEnd,
            TaskKind::Sync => Payload::Pause,
            TaskKind::Pause => Payload::Paused,
            TaskKind::Exec => Payload::Done,
        }
    }
}

/// Side effect requested by [`TaskState::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Append a message from the local node
    Send { body: Payload, ack: Option<Uuid> },
    /// Run a task; its follow-up acknowledges `trigger`
    StartTask { kind: TaskKind, trigger: Uuid },
    /// Cancel the running task, if any
    CancelTask,
    /// Undo a local pause
    Resume,
}

impl Action {
    fn send(body: Payload, ack: Option<Uuid>) -> Self {
        Action::Send { body, ack }
    }
}

/// Per-node view of the cluster.
#[derive(Debug, Clone)]
pub struct TaskState {
    local: NodeInfo,
    state: ClusterState,
    leader: Option<Uuid>,
    last_msg_id: Option<Uuid>,
    nodes: BTreeMap<Uuid, NodeInfo>,
    paused: BTreeSet<Uuid>,
    last_status: String,
    last_error: String,
    pending_status: String,
    sent_status: String,
    local_paused: bool,
}

impl TaskState {
    pub fn new(local: NodeInfo) -> Self {
        Self {
            local,
            state: ClusterState::Unknown,
            leader: None,
            last_msg_id: None,
            nodes: BTreeMap::new(),
            paused: BTreeSet::new(),
            last_status: String::new(),
            last_error: String::new(),
            pending_status: String::new(),
            sent_status: String::new(),
            local_paused: false,
        }
    }

    /// Announcement a node sends when it starts; acknowledges nothing.
    pub fn hello(&self) -> Action {
        Action::send(Payload::Hello(self.local.clone()), None)
    }

    pub fn local(&self) -> &NodeInfo {
        &self.local
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn leader(&self) -> Option<Uuid> {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.leader == Some(self.local.id)
    }

    /// Message the next state-advancing message must acknowledge.
    pub fn last_msg_id(&self) -> Option<Uuid> {
        self.last_msg_id
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn is_locally_paused(&self) -> bool {
        self.local_paused
    }

    /// Snapshot for operators.
    pub fn status(&self) -> ClusterStatus {
        ClusterStatus {
            node_id: self.local.id,
            state: self.state,
            leader: self.leader,
            last_msg_id: self.last_msg_id,
            last_status: self.last_status.clone(),
            last_error: self.last_error.clone(),
            nodes: self.nodes.values().cloned().collect(),
            paused: self.paused.iter().copied().collect(),
        }
    }

    /// Record task progress. Dropped when the task's trigger is no longer
    /// the expected message.
    pub fn set_progress(&mut self, trigger: Uuid, status: impl Into<String>) -> bool {
        if self.last_msg_id != Some(trigger) {
            return false;
        }
        self.pending_status = status.into();
        true
    }

    /// Pending progress to broadcast, at most once per distinct value.
    pub fn take_status_update(&mut self) -> Option<Action> {
        if self.pending_status.is_empty() || self.pending_status == self.sent_status {
            return None;
        }
        self.sent_status = self.pending_status.clone();
        Some(Action::send(
            Payload::Status(self.pending_status.clone()),
            self.last_msg_id,
        ))
    }

    /// Apply one log message.
    pub fn process(&mut self, msg: &Message) -> Vec<Action> {
        let matches_last = msg.ack_id == self.last_msg_id;

        match (&msg.body, self.state) {
            (Payload::Reset, _) => self.on_reset(msg),

            (Payload::Hello(node), ClusterState::Resetting) if matches_last => {
                self.on_hello(msg, node)
            }

            (Payload::ResetEnd, ClusterState::Resetting) if matches_last => {
                self.advance(msg, ClusterState::Idle);
                Vec::new()
            }

            (Payload::Execute, ClusterState::Idle) if matches_last => {
                self.advance(msg, ClusterState::Syncing);
                self.leader_task(TaskKind::Sync, msg.id)
            }

            (Payload::Pause, ClusterState::Syncing) if matches_last => {
                self.advance(msg, ClusterState::Pausing);
                self.local_paused = true;
                vec![Action::StartTask {
                    kind: TaskKind::Pause,
                    trigger: msg.id,
                }]
            }

            (Payload::Paused, ClusterState::Pausing) if matches_last => {
                self.paused.insert(msg.node_id);
                if !self.all_nodes_paused() {
                    return Vec::new();
                }
                self.advance(msg, ClusterState::Executing);
                self.leader_task(TaskKind::Exec, msg.id)
            }

            (Payload::Done, ClusterState::Executing) if matches_last => {
                self.state = ClusterState::Done;
                info!(node_id = %self.local.id, "Switchover complete");
                self.resume()
            }

            (Payload::Ping, _) => vec![Action::send(Payload::Ack, Some(msg.id))],

            (Payload::Ack, _) => Vec::new(),

            (Payload::TaskStart { name }, _) => {
                self.set_node_status(msg.node_id, name.clone());
                Vec::new()
            }

            (Payload::TaskEnd { name, error }, _) => {
                let status = match error {
                    Some(e) => format!("{name} failed: {e}"),
                    None => format!("{name} finished"),
                };
                self.set_node_status(msg.node_id, status);
                Vec::new()
            }

            (Payload::Status(status), _) => {
                if matches_last {
                    self.last_status = status.clone();
                }
                Vec::new()
            }

            (Payload::Error(error), _) => {
                if !matches_last {
                    return Vec::new();
                }
                warn!(node_id = %msg.node_id, "Cluster task failed: {}", error);
                self.last_error = error.clone();
                self.fall_to_unknown()
            }

            (Payload::Cancel(reason), _) => {
                info!(
                    node_id = %msg.node_id,
                    reason = reason.as_deref().unwrap_or(""),
                    "Switchover cancelled"
                );
                self.fall_to_unknown()
            }

            _ => self.diverge(msg, UNEXPECTED_MESSAGE),
        }
    }

    fn on_reset(&mut self, msg: &Message) -> Vec<Action> {
        let mut actions = vec![Action::CancelTask];
        actions.extend(self.resume());

        self.state = ClusterState::Resetting;
        self.leader = None;
        self.last_status.clear();
        self.last_error.clear();
        self.pending_status.clear();
        self.sent_status.clear();
        self.last_msg_id = Some(msg.id);
        self.nodes.clear();
        self.paused.clear();

        debug!(node_id = %self.local.id, msg_id = %msg.id, "Cluster reset");
        actions.push(Action::send(
            Payload::Hello(self.local.clone()),
            Some(msg.id),
        ));
        actions
    }

    fn on_hello(&mut self, msg: &Message, node: &NodeInfo) -> Vec<Action> {
        if node.old_db != self.local.old_db || node.new_db != self.local.new_db {
            return self.diverge(msg, "node database mismatch");
        }

        let mut node = node.clone();
        if let Some(existing) = self.nodes.get(&msg.node_id) {
            node.status = existing.status.clone();
        }
        self.nodes.insert(msg.node_id, node.clone());

        if self.leader.is_some() || !node.can_exec {
            return Vec::new();
        }
        self.leader = Some(node.id);
        info!(leader = %node.id, "Leader elected");

        if !self.is_leader() {
            return Vec::new();
        }
        // reset-end acknowledges the reset itself
        match self.last_msg_id {
            Some(trigger) => vec![Action::StartTask {
                kind: TaskKind::Reset,
                trigger,
            }],
            None => Vec::new(),
        }
    }

    fn advance(&mut self, msg: &Message, state: ClusterState) {
        debug!(from = %self.state, to = %state, msg_id = %msg.id, "Cluster state change");
        self.state = state;
        self.last_msg_id = Some(msg.id);
    }

    fn leader_task(&self, kind: TaskKind, trigger: Uuid) -> Vec<Action> {
        if self.is_leader() {
            vec![Action::StartTask { kind, trigger }]
        } else {
            Vec::new()
        }
    }

    fn all_nodes_paused(&self) -> bool {
        self.nodes.keys().all(|id| self.paused.contains(id))
    }

    fn set_node_status(&mut self, node_id: Uuid, status: String) {
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.status = status;
        }
    }

    fn resume(&mut self) -> Vec<Action> {
        if std::mem::take(&mut self.local_paused) {
            vec![Action::Resume]
        } else {
            Vec::new()
        }
    }

    fn fall_to_unknown(&mut self) -> Vec<Action> {
        let mut actions = vec![Action::CancelTask];
        actions.extend(self.resume());
        self.state = ClusterState::Unknown;
        actions
    }

    fn diverge(&mut self, msg: &Message, reason: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != ClusterState::Unknown {
            warn!(
                state = %self.state,
                msg_id = %msg.id,
                kind = msg.kind(),
                "Cluster divergence: {}",
                reason
            );
            crate::observability::ClusterMetrics::increment_divergences();
            actions.push(Action::send(
                Payload::Cancel(Some(reason.to_string())),
                Some(msg.id),
            ));
        }
        actions.extend(self.fall_to_unknown());
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Harness {
        old_db: Uuid,
        new_db: Uuid,
        log: Vec<Message>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                old_db: Uuid::new_v4(),
                new_db: Uuid::new_v4(),
                log: Vec::new(),
            }
        }

        fn node(&self, can_exec: bool) -> TaskState {
            TaskState::new(NodeInfo::new(can_exec, self.old_db, self.new_db))
        }

        fn append(&mut self, node: Uuid, ack: Option<Uuid>, body: Payload) -> Message {
            let msg = Message::new(node, ack, body);
            self.log.push(msg.clone());
            msg
        }
    }

    fn sends(actions: &[Action]) -> Vec<(&Payload, Option<Uuid>)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { body, ack } => Some((body, *ack)),
                _ => None,
            })
            .collect()
    }

    /// Feed `msg` to every node, appending whatever they send, until the
    /// log is drained. Started tasks are recorded but not run.
    fn replay(h: &mut Harness, nodes: &mut [TaskState], from: usize) -> Vec<(Uuid, TaskKind, Uuid)> {
        let mut tasks = Vec::new();
        let mut i = from;
        while i < h.log.len() {
            let msg = h.log[i].clone();
            for node in nodes.iter_mut() {
                let id = node.local().id;
                for action in node.process(&msg) {
                    match action {
                        Action::Send { body, ack } => {
                            h.append(id, ack, body);
                        }
                        Action::StartTask { kind, trigger } => tasks.push((id, kind, trigger)),
                        _ => {}
                    }
                }
            }
            i += 1;
        }
        tasks
    }

    #[test]
    fn test_cluster_state_display() {
        assert_eq!(ClusterState::Pausing.to_string(), "pausing");
        assert_eq!(
            serde_json::to_value(ClusterState::Executing).unwrap(),
            serde_json::json!("executing")
        );
        assert_eq!(ClusterState::default(), ClusterState::Unknown);
    }

    #[test]
    fn test_task_follow_ups() {
        assert_eq!(TaskKind::Reset.follow_up(), Payload::ResetEnd);
        assert_eq!(TaskKind::Sync.follow_up(), Payload::Pause);
        assert_eq!(TaskKind::Pause.follow_up(), Payload::Paused);
        assert_eq!(TaskKind::Exec.follow_up(), Payload::Done);
    }

    #[test]
    fn test_reset_announces_and_clears() {
        let h = Harness::new();
        let mut node = h.node(true);
        let reset = Message::new(Uuid::new_v4(), None, Payload::Reset);

        let actions = node.process(&reset);

        assert_eq!(node.state(), ClusterState::Resetting);
        assert_eq!(node.last_msg_id(), Some(reset.id));
        assert_eq!(actions[0], Action::CancelTask);
        let sent = sends(&actions);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].0, Payload::Hello(_)));
        assert_eq!(sent[0].1, Some(reset.id));
    }

    #[test]
    fn test_first_capable_hello_becomes_leader() {
        let mut h = Harness::new();
        let mut nodes = vec![h.node(false), h.node(true), h.node(true)];
        let operator = Uuid::new_v4();
        let reset = h.append(operator, None, Payload::Reset);

        let tasks = replay(&mut h, &mut nodes, 0);

        // hellos land in node order; node 0 cannot exec
        let leader = nodes[1].local().id;
        for node in &nodes {
            assert_eq!(node.leader(), Some(leader));
            assert_eq!(node.nodes().count(), 3);
        }
        assert_eq!(tasks, vec![(leader, TaskKind::Reset, reset.id)]);
    }

    #[test]
    fn test_full_switchover_flow() {
        let mut h = Harness::new();
        let mut nodes = vec![h.node(true), h.node(false)];
        let leader = nodes[0].local().id;
        let operator = Uuid::new_v4();

        let reset = h.append(operator, None, Payload::Reset);
        replay(&mut h, &mut nodes, 0);

        let mark = h.log.len();
        h.append(leader, Some(reset.id), Payload::ResetEnd);
        replay(&mut h, &mut nodes, mark);
        assert!(nodes.iter().all(|n| n.state() == ClusterState::Idle));

        let mark = h.log.len();
        let last = nodes[0].last_msg_id();
        let execute = h.append(operator, last, Payload::Execute);
        let tasks = replay(&mut h, &mut nodes, mark);
        assert!(nodes.iter().all(|n| n.state() == ClusterState::Syncing));
        assert_eq!(tasks, vec![(leader, TaskKind::Sync, execute.id)]);

        let mark = h.log.len();
        let pause = h.append(leader, Some(execute.id), Payload::Pause);
        let tasks = replay(&mut h, &mut nodes, mark);
        assert!(nodes.iter().all(|n| n.state() == ClusterState::Pausing));
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|(_, k, t)| *k == TaskKind::Pause && *t == pause.id));

        let mark = h.log.len();
        h.append(leader, Some(pause.id), Payload::Paused);
        replay(&mut h, &mut nodes, mark);
        assert!(nodes.iter().all(|n| n.state() == ClusterState::Pausing));

        let mark = h.log.len();
        let paused = h.append(nodes[1].local().id, Some(pause.id), Payload::Paused);
        let tasks = replay(&mut h, &mut nodes, mark);
        assert!(nodes.iter().all(|n| n.state() == ClusterState::Executing));
        assert_eq!(tasks, vec![(leader, TaskKind::Exec, paused.id)]);

        let done = Message::new(leader, Some(paused.id), Payload::Done);
        for node in nodes.iter_mut() {
            let actions = node.process(&done);
            assert_eq!(actions, vec![Action::Resume]);
            assert_eq!(node.state(), ClusterState::Done);
            assert!(!node.is_locally_paused());
        }
    }

    #[test]
    fn test_unexpected_message_cancels() {
        let h = Harness::new();
        let mut node = h.node(true);
        let reset = Message::new(Uuid::new_v4(), None, Payload::Reset);
        node.process(&reset);

        // execute is only valid while idle
        let execute = Message::new(Uuid::new_v4(), Some(reset.id), Payload::Execute);
        let actions = node.process(&execute);

        assert_eq!(node.state(), ClusterState::Unknown);
        let sent = sends(&actions);
        assert_eq!(
            sent,
            vec![(&Payload::Cancel(Some(UNEXPECTED_MESSAGE.into())), Some(execute.id))]
        );
    }

    #[test]
    fn test_unknown_node_stays_quiet() {
        let h = Harness::new();
        let mut node = h.node(true);
        let stray = Message::new(Uuid::new_v4(), None, Payload::Done);

        let actions = node.process(&stray);

        assert_eq!(node.state(), ClusterState::Unknown);
        assert!(sends(&actions).is_empty());
    }

    #[test]
    fn test_database_mismatch_diverges() {
        let h = Harness::new();
        let mut node = h.node(true);
        let reset = Message::new(Uuid::new_v4(), None, Payload::Reset);
        node.process(&reset);

        let other = NodeInfo::new(true, h.old_db, Uuid::new_v4());
        let hello = Message::new(other.id, Some(reset.id), Payload::Hello(other));
        let actions = node.process(&hello);

        assert_eq!(node.state(), ClusterState::Unknown);
        assert!(matches!(sends(&actions)[0].0, Payload::Cancel(Some(_))));
    }

    #[test]
    fn test_error_with_stale_ack_ignored() {
        let h = Harness::new();
        let mut node = h.node(true);
        let reset = Message::new(Uuid::new_v4(), None, Payload::Reset);
        node.process(&reset);

        let stale = Message::new(Uuid::new_v4(), Some(Uuid::new_v4()), Payload::Error("old".into()));
        assert!(node.process(&stale).is_empty());
        assert_eq!(node.state(), ClusterState::Resetting);

        let current = Message::new(Uuid::new_v4(), Some(reset.id), Payload::Error("boom".into()));
        node.process(&current);
        assert_eq!(node.state(), ClusterState::Unknown);
        assert_eq!(node.status().last_error, "boom");
    }

    #[test]
    fn test_ping_is_acked_without_state_change() {
        let h = Harness::new();
        let mut node = h.node(true);
        let ping = Message::new(Uuid::new_v4(), None, Payload::Ping);

        let actions = node.process(&ping);

        assert_eq!(actions, vec![Action::send(Payload::Ack, Some(ping.id))]);
        assert_eq!(node.state(), ClusterState::Unknown);
    }

    #[test]
    fn test_cancel_resumes_paused_node() {
        let h = Harness::new();
        let mut node = h.node(true);
        node.state = ClusterState::Syncing;
        node.last_msg_id = Some(Uuid::new_v4());
        let pause = Message::new(Uuid::new_v4(), node.last_msg_id, Payload::Pause);
        node.process(&pause);
        assert!(node.is_locally_paused());

        let actions = node.process(&Message::new(Uuid::new_v4(), None, Payload::Cancel(None)));

        assert_eq!(actions, vec![Action::CancelTask, Action::Resume]);
        assert_eq!(node.state(), ClusterState::Unknown);
    }

    #[test]
    fn test_task_messages_update_node_status() {
        let mut h = Harness::new();
        let mut nodes = vec![h.node(true)];
        h.append(Uuid::new_v4(), None, Payload::Reset);
        replay(&mut h, &mut nodes, 0);
        let id = nodes[0].local().id;

        let start = Message::new(id, None, Payload::TaskStart { name: "reset".into() });
        assert!(nodes[0].process(&start).is_empty());
        assert_eq!(nodes[0].status().nodes[0].status, "reset");
        assert_eq!(nodes[0].state(), ClusterState::Resetting);
    }

    #[test]
    fn test_status_throttling() {
        let h = Harness::new();
        let mut node = h.node(true);
        let reset = Message::new(Uuid::new_v4(), None, Payload::Reset);
        node.process(&reset);

        assert!(node.take_status_update().is_none());
        assert!(!node.set_progress(Uuid::new_v4(), "stale"));
        assert!(node.set_progress(reset.id, "copying"));

        assert_eq!(
            node.take_status_update(),
            Some(Action::send(Payload::Status("copying".into()), Some(reset.id)))
        );
        // unchanged value is not sent twice
        assert!(node.take_status_update().is_none());
        node.set_progress(reset.id, "copying");
        assert!(node.take_status_update().is_none());
    }

    // ==================== Agreement ====================

    fn observable(node: &TaskState) -> ClusterStatus {
        ClusterStatus {
            node_id: Uuid::nil(),
            ..node.status()
        }
    }

    /// Messages an operator or a misbehaving node could append at any time.
    fn arb_step() -> impl Strategy<Value = (u8, bool)> {
        (0u8..8, any::<bool>())
    }

    proptest! {
        #[test]
        fn prop_replicas_agree(steps in proptest::collection::vec(arb_step(), 1..40)) {
            let mut h = Harness::new();
            let mut nodes = vec![h.node(true), h.node(false), h.node(true)];
            let operator = Uuid::new_v4();
            let mut mark = 0;

            for (kind, use_last) in steps {
                let ack = if use_last { nodes[0].last_msg_id() } else { None };
                let leader = nodes[0].leader().unwrap_or(operator);
                let body = match kind {
                    0 => Payload::Reset,
                    1 => Payload::ResetEnd,
                    2 => Payload::Execute,
                    3 => Payload::Pause,
                    4 => Payload::Paused,
                    5 => Payload::Done,
                    6 => Payload::Ping,
                    _ => Payload::Error("boom".into()),
                };
                h.append(leader, ack, body);
                replay(&mut h, &mut nodes, mark);
                mark = h.log.len();

                let first = observable(&nodes[0]);
                for node in &nodes[1..] {
                    prop_assert_eq!(&observable(node), &first);
                }
            }
        }

        #[test]
        fn prop_duplicate_forces_unknown(dup_index in 0usize..3) {
            let mut h = Harness::new();
            let mut nodes = vec![h.node(true), h.node(true)];
            let leader = nodes[0].local().id;
            let operator = Uuid::new_v4();

            let reset = h.append(operator, None, Payload::Reset);
            replay(&mut h, &mut nodes, 0);
            let mark = h.log.len();
            let end = h.append(leader, Some(reset.id), Payload::ResetEnd);
            let execute = Message::new(operator, Some(end.id), Payload::Execute);
            let pause = Message::new(leader, Some(execute.id), Payload::Pause);
            let script = [end, execute, pause];

            h.log.push(script[1].clone());
            h.log.push(script[2].clone());
            // replay one already-applied message a second time
            h.log.push(script[dup_index].clone());
            replay(&mut h, &mut nodes, mark);

            for node in &nodes {
                prop_assert_eq!(node.state(), ClusterState::Unknown);
            }
        }
    }
}

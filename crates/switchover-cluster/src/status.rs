//! Operator-facing cluster snapshot

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::machine::ClusterState;
use crate::message::NodeInfo;

/// What one node currently believes about the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// Node that produced the snapshot
    pub node_id: Uuid,
    pub state: ClusterState,
    pub leader: Option<Uuid>,
    pub last_msg_id: Option<Uuid>,
    /// Latest progress reported by the running task
    pub last_status: String,
    /// Error that stopped the last switchover attempt
    pub last_error: String,
    /// Nodes that announced themselves since the last reset
    pub nodes: Vec<NodeInfo>,
    /// Nodes that finished pausing
    pub paused: Vec<Uuid>,
}

impl ClusterStatus {
    /// Snapshot of a node that has not processed anything yet.
    pub fn empty(node_id: Uuid) -> Self {
        Self {
            node_id,
            state: ClusterState::Unknown,
            leader: None,
            last_msg_id: None,
            last_status: String::new(),
            last_error: String::new(),
            nodes: Vec::new(),
            paused: Vec::new(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader == Some(self.node_id)
    }
}

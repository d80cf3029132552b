//! Cluster messages
//!
//! Every message carries the sender's node id and, for replies, the id of
//! the message it acknowledges. Payloads are a tagged union so dispatch is
//! an exhaustive match:
//!
//! ```json
//! {"id":"…","node_id":"…","ack_id":"…","time":"…","type":"hello","data":{"id":"…","can_exec":true,…}}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A node taking part in a switchover, as announced in `hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Random id chosen at process start
    pub id: Uuid,
    /// Whether the node may run the replicator
    pub can_exec: bool,
    /// Identity of the main database as seen by the node
    pub old_db: Uuid,
    /// Identity of the next database as seen by the node
    pub new_db: Uuid,
    /// Last task activity reported by the node
    #[serde(default)]
    pub status: String,
}

impl NodeInfo {
    /// Create a node announcement with a fresh id.
    pub fn new(can_exec: bool, old_db: Uuid, new_db: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            can_exec,
            old_db,
            new_db,
            status: String::new(),
        }
    }
}

/// Message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Payload {
    Hello(NodeInfo),
    Ping,
    Ack,
    Reset,
    ResetEnd,
    Execute,
    TaskStart {
        name: String,
    },
    TaskEnd {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Status(String),
    Error(String),
    Done,
    Cancel(Option<String>),
    Pause,
    Paused,
}

impl Payload {
    /// Wire name of the payload type
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Hello(_) => "hello",
            Payload::Ping => "ping",
            Payload::Ack => "ack",
            Payload::Reset => "reset",
            Payload::ResetEnd => "reset-end",
            Payload::Execute => "execute",
            Payload::TaskStart { .. } => "task-start",
            Payload::TaskEnd { .. } => "task-end",
            Payload::Status(_) => "status",
            Payload::Error(_) => "error",
            Payload::Done => "done",
            Payload::Cancel(_) => "cancel",
            Payload::Pause => "pause",
            Payload::Paused => "paused",
        }
    }
}

/// One entry of the message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub node_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<Uuid>,
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub body: Payload,
}

impl Message {
    /// New message from `node_id`, acknowledging `ack_id`.
    pub fn new(node_id: Uuid, ack_id: Option<Uuid>, body: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id,
            ack_id,
            time: Utc::now(),
            body,
        }
    }

    /// Wire name of the payload type
    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }
}

//! Lookup and announce tasks.
//!
//! Tasks are pure state machines: they decide *what* to send, the node loop
//! performs the I/O and feeds call outcomes back in. That keeps every
//! mutation on the owning loop and spares the design the per-event callback
//! lambdas of older DHTs.

pub mod announce;
pub mod lookup;
pub mod manager;
pub mod node_lookup;
pub mod peer_lookup;
pub mod ping_refresh;
pub mod value_lookup;

pub use manager::TaskManager;

use crate::messages::Request;
use crate::node_info::NodeInfo;
use crate::peer_info::PeerInfo;
use crate::value::Value;

pub type TaskId = u64;

/// User-facing operation a task (chain) reports into.
pub type OpId = u64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskState {
    Queued,
    Running,
    Finished,
    Canceled,
}

/// A request a task wants sent on its behalf.
#[derive(Debug)]
pub struct OutgoingRequest {
    pub task: TaskId,
    pub target: NodeInfo,
    pub request: Request,
}

/// What a node lookup does once its closest set is final.
#[derive(Debug)]
pub enum Followup {
    StoreValue(Value),
    AnnouncePeer(PeerInfo),
}

pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub kind: TaskKind,
}

pub enum TaskKind {
    NodeLookup(node_lookup::NodeLookupTask),
    ValueLookup(value_lookup::ValueLookupTask),
    PeerLookup(peer_lookup::PeerLookupTask),
    ValueAnnounce(announce::ValueAnnounceTask),
    PeerAnnounce(announce::PeerAnnounceTask),
    PingRefresh(ping_refresh::PingRefreshTask),
}

impl TaskKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            TaskKind::NodeLookup(_) => "node-lookup",
            TaskKind::ValueLookup(_) => "value-lookup",
            TaskKind::PeerLookup(_) => "peer-lookup",
            TaskKind::ValueAnnounce(_) => "value-announce",
            TaskKind::PeerAnnounce(_) => "peer-announce",
            TaskKind::PingRefresh(_) => "ping-refresh",
        }
    }
}

//! One DHT instance: a routing table, its tasks and the bootstrap state for
//! a single IP family. All I/O lives in the node loop; this type decides
//! what the table should look like and what needs sending next.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::constants;
use crate::id::Id;
use crate::kbucket::KBucketEntry;
use crate::node_info::{Family, NodeInfo};
use crate::routing_table::{MaintenanceActions, RoutingTable};
use crate::rpccall::RpcCall;
use crate::task::TaskManager;

/// What `received` wants the loop to do next.
#[derive(Debug, Default)]
pub struct ReceivedActions {
    /// Send a verification ping to this newly seen node.
    pub verify: Option<NodeInfo>,
    /// Ping these entries: an id change was detected in their bucket.
    pub check_bucket: Vec<NodeInfo>,
}

pub struct Dht {
    family: Family,
    pub routing_table: RoutingTable,
    pub task_man: TaskManager,

    bootstrap_nodes: Vec<NodeInfo>,
    known_nodes: HashMap<SocketAddr, Id>,
    last_bootstrap: u64,
    bootstrap_calls: usize,

    persist_path: Option<PathBuf>,
    last_persist: u64,
}

impl Dht {
    pub fn new(family: Family, local_id: Id) -> Self {
        Dht {
            family,
            routing_table: RoutingTable::new(local_id),
            task_man: TaskManager::new(),
            bootstrap_nodes: Vec::new(),
            known_nodes: HashMap::new(),
            last_bootstrap: 0,
            bootstrap_calls: 0,
            persist_path: None,
            last_persist: 0,
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn set_persist_path(&mut self, path: PathBuf, now: u64) {
        self.routing_table.load(&path, now);
        self.persist_path = Some(path);
    }

    pub fn bootstrap_ids(&self) -> Vec<Id> {
        self.bootstrap_nodes.iter().map(|n| *n.id()).collect()
    }

    /// Register a seed node. Returns the nodes to contact when a bootstrap
    /// round should start right away.
    pub fn add_bootstrap(&mut self, node: NodeInfo) -> bool {
        if node.family() != self.family {
            return false;
        }
        if self
            .bootstrap_nodes
            .iter()
            .any(|n| n.id() == node.id() || n.addr() == node.addr())
        {
            return false;
        }
        self.bootstrap_nodes.push(node);
        true
    }

    /// Nodes to send bootstrap FIND_NODEs to, or empty when a round is
    /// already running or recently finished.
    pub fn start_bootstrap(&mut self, now: u64, force: bool) -> Vec<NodeInfo> {
        if self.bootstrap_nodes.is_empty() || self.bootstrap_calls > 0 {
            return Vec::new();
        }
        if !force
            && now.saturating_sub(self.last_bootstrap) < constants::BOOTSTRAP_MIN_INTERVAL
        {
            return Vec::new();
        }
        info!(family = %self.family, seeds = self.bootstrap_nodes.len(), "bootstrapping");
        self.last_bootstrap = now;
        self.bootstrap_calls = self.bootstrap_nodes.len();
        self.bootstrap_nodes.clone()
    }

    /// A bootstrap call reached a terminal state. True when the round is
    /// over and the home-bucket fill lookup should start.
    pub fn bootstrap_call_done(&mut self) -> bool {
        if self.bootstrap_calls == 0 {
            return false;
        }
        self.bootstrap_calls -= 1;
        self.bootstrap_calls == 0
    }

    /// Whether the periodic update should re-bootstrap.
    pub fn needs_bootstrap(&self, now: u64) -> bool {
        self.routing_table.num_entries() < constants::BOOTSTRAP_IF_LESS_THAN_X_PEERS
            && now.saturating_sub(self.last_bootstrap) >= constants::BOOTSTRAP_MIN_INTERVAL
    }

    /// Feed a verified sighting of `sender` into the routing table,
    /// following the anti-spoofing rules: stable addresses only, id changes
    /// evict, new nodes get verified with a ping before they may count as
    /// reachable.
    pub fn received(
        &mut self,
        sender: &Id,
        from: &SocketAddr,
        version: u32,
        call: Option<&RpcCall>,
        now: u64,
    ) -> ReceivedActions {
        let mut actions = ReceivedActions::default();

        // only nodes with stable ports belong in the table
        if let Some(call) = call {
            if !call.matches_id(sender) || !call.matches_addr(from) {
                return actions;
            }
        }

        if let Some(old) = self.routing_table.entry(sender) {
            if old.addr() != from {
                // ports changed under the node (broken NAT?); let the old
                // entry age out instead of following the move
                return actions;
            }
        }

        if let Some(known_id) = self.known_nodes.get(from) {
            if known_id != sender {
                let known_id = *known_id;
                if self.routing_table.entry(&known_id).is_some() {
                    // the address re-keyed: either an id change or spoofing,
                    // and neither belongs in the table
                    warn!(addr = %from, old = %known_id, new = %sender, "id change detected, evicting");
                    self.routing_table.remove(&known_id);
                    actions.check_bucket = self
                        .routing_table
                        .bucket_of(&known_id)
                        .entries()
                        .iter()
                        .map(|e| e.node().clone())
                        .collect();
                    self.known_nodes.insert(*from, *sender);
                    return actions;
                }
                self.known_nodes.remove(from);
            }
        }
        self.known_nodes.insert(*from, *sender);

        let is_new = self.routing_table.entry(sender).is_none();
        let mut entry = KBucketEntry::new(
            NodeInfo::with_version(*sender, *from, version),
            now,
        );

        if call.is_some() {
            entry.signal_response(now);
        } else if is_new {
            // unsolicited first contact: verify before trusting
            actions.verify = Some(entry.node().clone());
        }

        self.routing_table.put(entry);
        actions
    }

    pub fn on_timeout(&mut self, id: &Id) {
        self.routing_table.on_timeout(id);
    }

    pub fn on_send(&mut self, id: &Id, now: u64) {
        self.routing_table.on_send(id, now);
    }

    /// Periodic tick work that belongs to the table itself.
    pub fn maintenance(&mut self, now: u64) -> MaintenanceActions {
        let bootstrap_ids = self.bootstrap_ids();
        self.routing_table.maintenance(now, &bootstrap_ids)
    }

    /// Persist the routing table if the interval elapsed.
    pub fn persist(&mut self, now: u64, force: bool) {
        let Some(path) = &self.persist_path else {
            return;
        };
        if !force
            && now.saturating_sub(self.last_persist) < constants::ROUTING_TABLE_PERSIST_INTERVAL
        {
            return;
        }
        self.last_persist = now;
        if let Err(e) = self.routing_table.save(path) {
            warn!(path = %path.display(), error = %e, "failed to save routing table");
        } else {
            debug!(family = %self.family, entries = self.routing_table.num_entries(), "routing table saved");
        }
    }
}

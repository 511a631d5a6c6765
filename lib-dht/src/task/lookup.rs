//! Shared iterative-lookup machinery.
//!
//! Maintains the two sets every Kademlia lookup walks: candidates not yet
//! queried, ordered by XOR distance to the target, and the closest set of
//! nodes that actually answered. Ties on distance break by first-seen order.

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::constants;
use crate::id::Id;
use crate::lookup_option::LookupOption;
use crate::node_info::{Family, NodeInfo};

/// Unpinged candidates are capped at 3K; the furthest are shed first.
const MAX_UNQUERIED_CANDIDATES: usize = constants::MAX_ENTRIES_PER_BUCKET * 3;

struct Candidate {
    node: NodeInfo,
    dist: Id,
    seq: u64,
    queried: bool,
}

/// A node that answered, with the write token it returned (zero if none).
#[derive(Clone, Debug)]
pub struct ClosestEntry {
    pub node: NodeInfo,
    pub token: i32,
}

pub struct LookupState {
    pub target: Id,
    pub family: Family,
    pub option: LookupOption,
    pub want_token: bool,

    candidates: Vec<Candidate>,
    known_ids: HashSet<Id>,
    known_addrs: HashSet<SocketAddr>,
    next_seq: u64,

    closest: Vec<(Id, ClosestEntry)>,
    in_flight: usize,
    done: bool,
}

impl LookupState {
    pub fn new(target: Id, family: Family, option: LookupOption) -> Self {
        LookupState {
            target,
            family,
            option,
            want_token: false,
            candidates: Vec::new(),
            known_ids: HashSet::new(),
            known_addrs: HashSet::new(),
            next_seq: 0,
            closest: Vec::new(),
            in_flight: 0,
            done: false,
        }
    }

    /// Feed in nodes learned from a response (or the routing table seed).
    pub fn add_candidates(&mut self, local_id: &Id, nodes: &[NodeInfo]) {
        for node in nodes {
            if node.id() == local_id
                || node.family() != self.family
                || self.known_ids.contains(node.id())
                || self.known_addrs.contains(node.addr())
            {
                continue;
            }
            self.known_ids.insert(*node.id());
            self.known_addrs.insert(*node.addr());

            let candidate = Candidate {
                dist: self.target.distance(node.id()),
                node: node.clone(),
                seq: self.next_seq,
                queried: false,
            };
            self.next_seq += 1;

            let pos = self
                .candidates
                .partition_point(|c| (c.dist, c.seq) <= (candidate.dist, candidate.seq));
            self.candidates.insert(pos, candidate);
        }

        // shed the furthest unqueried beyond the cap
        let mut unqueried = self.candidates.iter().filter(|c| !c.queried).count();
        while unqueried > MAX_UNQUERIED_CANDIDATES {
            if let Some(pos) = self.candidates.iter().rposition(|c| !c.queried) {
                self.candidates.remove(pos);
                unqueried -= 1;
            } else {
                break;
            }
        }
    }

    /// Claim the nearest unqueried candidate, if concurrency allows.
    pub fn next_candidate(&mut self) -> Option<NodeInfo> {
        if self.done || self.in_flight >= constants::MAX_CONCURRENT_TASK_REQUESTS {
            return None;
        }
        let candidate = self.candidates.iter_mut().find(|c| !c.queried)?;
        candidate.queried = true;
        self.in_flight += 1;
        Some(candidate.node.clone())
    }

    /// Record a responder into the closest set.
    pub fn add_responder(&mut self, node: &NodeInfo, token: i32) {
        let dist = self.target.distance(node.id());
        if self.closest.iter().any(|(_, e)| e.node.id() == node.id()) {
            return;
        }
        let entry = ClosestEntry {
            node: node.clone(),
            token,
        };
        let pos = self.closest.partition_point(|(d, _)| *d <= dist);
        self.closest.insert(pos, (dist, entry));
        self.closest.truncate(constants::MAX_ENTRIES_PER_BUCKET);
    }

    /// A call this lookup issued reached a slot-freeing state.
    pub fn call_finished(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Force the stop condition (first-hit options).
    pub fn mark_done(&mut self) {
        self.done = true;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn has_unqueried(&self) -> bool {
        self.candidates.iter().any(|c| !c.queried)
    }

    /// Whether the closest set is stable: K responders and every remaining
    /// candidate is further away than the worst of them.
    fn closest_stable(&self) -> bool {
        if self.closest.len() < constants::MAX_ENTRIES_PER_BUCKET {
            return false;
        }
        let worst = &self.closest[self.closest.len() - 1].0;
        !self
            .candidates
            .iter()
            .any(|c| !c.queried && c.dist < *worst)
    }

    /// The lookup can finish: stop condition hit, candidates exhausted, or
    /// (conservatively) the closest set has stabilized.
    pub fn is_complete(&self) -> bool {
        if self.done {
            // outstanding calls get cancelled by the loop
            return true;
        }
        if self.in_flight == 0 && !self.has_unqueried() {
            return true;
        }
        self.option == LookupOption::Conservative && self.in_flight == 0 && self.closest_stable()
    }

    pub fn closest_set(&self) -> Vec<ClosestEntry> {
        self.closest.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn closest_nodes(&self) -> Vec<NodeInfo> {
        self.closest.iter().map(|(_, e)| e.node.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn node(i: u8, port: u16) -> NodeInfo {
        let mut id = Id::zero();
        id.set_bit(250, i & 1 != 0);
        id.set_bit(251, i & 2 != 0);
        id.set_bit(252, i & 4 != 0);
        id.set_bit(253, i & 8 != 0);
        NodeInfo::new(id, std::net::SocketAddr::new(IpAddr::from([203, 0, 113, i]), port))
    }

    #[test]
    fn candidates_come_out_nearest_first() {
        let target = Id::zero();
        let local = Id::random();
        let mut st = LookupState::new(target, Family::V4, LookupOption::Conservative);

        st.add_candidates(&local, &[node(7, 1), node(1, 2), node(3, 3)]);

        let first = st.next_candidate().unwrap();
        let second = st.next_candidate().unwrap();
        assert!(target.distance(first.id()) < target.distance(second.id()));
    }

    #[test]
    fn concurrency_is_bounded() {
        let local = Id::random();
        let mut st = LookupState::new(Id::zero(), Family::V4, LookupOption::Conservative);
        let nodes: Vec<NodeInfo> = (1..10).map(|i| node(i, 100 + i as u16)).collect();
        st.add_candidates(&local, &nodes);

        for _ in 0..constants::MAX_CONCURRENT_TASK_REQUESTS {
            assert!(st.next_candidate().is_some());
        }
        assert!(st.next_candidate().is_none());

        st.call_finished();
        assert!(st.next_candidate().is_some());
    }

    #[test]
    fn duplicate_ids_and_addresses_ignored() {
        let local = Id::random();
        let mut st = LookupState::new(Id::zero(), Family::V4, LookupOption::Conservative);
        let a = node(1, 100);
        st.add_candidates(&local, &[a.clone(), a.clone()]);
        assert!(st.next_candidate().is_some());
        assert!(st.next_candidate().is_none());
    }

    #[test]
    fn conservative_completion_requires_stability() {
        let local = Id::random();
        let mut st = LookupState::new(Id::zero(), Family::V4, LookupOption::Conservative);
        let nodes: Vec<NodeInfo> = (1..=12).map(|i| node(i, 100 + i as u16)).collect();
        st.add_candidates(&local, &nodes);

        // drain all candidates, everyone answers
        while let Some(n) = st.next_candidate() {
            st.call_finished();
            st.add_responder(&n, 0);
        }
        assert!(st.is_complete());
        let closest = st.closest_nodes();
        assert_eq!(closest.len(), constants::MAX_ENTRIES_PER_BUCKET);
        // closest set is sorted nearest-first
        for pair in closest.windows(2) {
            assert!(
                st.target.distance(pair[0].id()) <= st.target.distance(pair[1].id())
            );
        }
    }
}

//! Peer lookup: gather announcements published under a peer id.

use crate::id::Id;
use crate::lookup_option::LookupOption;
use crate::messages::{LookupRequest, Request, Response};
use crate::node_info::{Family, NodeInfo};
use crate::peer_info::PeerInfo;

use super::lookup::LookupState;
use super::OpId;

pub struct PeerLookupTask {
    pub lookup: LookupState,
    pub op: Option<OpId>,
    /// Stop once this many peers are found; zero collects until stable.
    pub expected: usize,
    found: Vec<PeerInfo>,
}

impl PeerLookupTask {
    pub fn new(target: Id, family: Family, option: LookupOption, expected: usize) -> Self {
        PeerLookupTask {
            lookup: LookupState::new(target, family, option),
            op: None,
            expected,
            found: Vec::new(),
        }
    }

    pub fn with_op(mut self, op: OpId) -> Self {
        self.op = Some(op);
        self
    }

    pub fn step(&mut self) -> Vec<(NodeInfo, Request)> {
        let mut out = Vec::new();
        while let Some(target) = self.lookup.next_candidate() {
            let request = Request::FindPeer(LookupRequest::new(
                self.lookup.target,
                self.lookup.family == Family::V4,
                self.lookup.family == Family::V6,
            ));
            out.push((target, request));
        }
        out
    }

    fn accept_peers(&mut self, peers: &[PeerInfo]) {
        for peer in peers {
            if peer.id() != &self.lookup.target || !peer.is_valid() {
                continue;
            }
            if self
                .found
                .iter()
                .any(|p| p.node_id() == peer.node_id() && p.origin() == peer.origin())
            {
                continue;
            }
            self.found.push(peer.clone());
        }
        if !self.found.is_empty() {
            let enough = self.expected > 0 && self.found.len() >= self.expected;
            if enough || self.lookup.option.stop_on_first_hit() {
                self.lookup.mark_done();
            }
        }
    }

    pub fn on_response(&mut self, local_id: &Id, responder: &NodeInfo, response: &Response) {
        self.lookup.call_finished();
        if let Some(lr) = response.lookup() {
            match self.lookup.family {
                Family::V4 => self.lookup.add_candidates(local_id, &lr.nodes4),
                Family::V6 => self.lookup.add_candidates(local_id, &lr.nodes6),
            }
            self.lookup.add_responder(responder, lr.token);
        }
        if let Response::FindPeer { peers4, peers6, .. } = response {
            self.accept_peers(peers4);
            self.accept_peers(peers6);
        }
    }

    pub fn on_call_lost(&mut self) {
        self.lookup.call_finished();
    }

    pub fn is_complete(&self) -> bool {
        self.lookup.is_complete()
    }

    pub fn take_found(&mut self) -> Vec<PeerInfo> {
        std::mem::take(&mut self.found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::LookupResponse;
    use std::net::IpAddr;

    fn node(i: u8) -> NodeInfo {
        NodeInfo::new(
            Id::random(),
            std::net::SocketAddr::new(IpAddr::from([203, 0, 113, i]), 39000 + i as u16),
        )
    }

    #[test]
    fn expected_count_stops_the_walk() {
        let local = Id::random();
        let keypair = lib_crypto::signature::KeyPair::random();
        let peer = PeerInfo::create_with(&keypair, &Id::random(), &Id::random(), 8080, None).unwrap();
        let peer_id = *peer.id();

        let mut task = PeerLookupTask::new(peer_id, Family::V4, LookupOption::Conservative, 1);
        let responder = node(1);
        task.lookup.add_candidates(&local, &[responder.clone(), node(2)]);
        let _ = task.step();

        let response = Response::FindPeer {
            lookup: LookupResponse::default(),
            peers4: vec![peer.clone()],
            peers6: Vec::new(),
        };
        task.on_response(&local, &responder, &response);
        assert!(task.is_complete());
        assert_eq!(task.take_found(), vec![peer]);
    }

    #[test]
    fn invalid_peers_are_dropped() {
        let local = Id::random();
        let peer_id = Id::random();
        let bogus = PeerInfo::of(peer_id, Id::random(), None, 8080, None, vec![0u8; 64]);

        let mut task = PeerLookupTask::new(peer_id, Family::V4, LookupOption::Conservative, 0);
        let responder = node(1);
        task.lookup.add_candidates(&local, &[responder.clone()]);
        let _ = task.step();

        let response = Response::FindPeer {
            lookup: LookupResponse::default(),
            peers4: vec![bogus],
            peers6: Vec::new(),
        };
        task.on_response(&local, &responder, &response);
        assert!(task.take_found().is_empty());
    }
}

//! Announce tasks: push a value or peer onto the closest set a node lookup
//! produced. Best effort by contract; the task finishes when every send has
//! reached a terminal state, however it ended.

use crate::constants;
use crate::messages::Request;
use crate::node_info::NodeInfo;
use crate::peer_info::PeerInfo;
use crate::value::Value;

use super::lookup::ClosestEntry;
use super::OpId;

struct AnnounceState {
    targets: Vec<ClosestEntry>,
    next: usize,
    in_flight: usize,
    succeeded: usize,
    failed: usize,
}

impl AnnounceState {
    fn new(targets: Vec<ClosestEntry>) -> Self {
        AnnounceState {
            targets,
            next: 0,
            in_flight: 0,
            succeeded: 0,
            failed: 0,
        }
    }

    fn next_target(&mut self) -> Option<ClosestEntry> {
        if self.in_flight >= constants::MAX_CONCURRENT_TASK_REQUESTS
            || self.next >= self.targets.len()
        {
            return None;
        }
        let entry = self.targets[self.next].clone();
        self.next += 1;
        self.in_flight += 1;
        Some(entry)
    }

    fn on_ok(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.succeeded += 1;
    }

    fn on_lost(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.failed += 1;
    }

    fn is_complete(&self) -> bool {
        self.in_flight == 0 && self.next >= self.targets.len()
    }
}

pub struct ValueAnnounceTask {
    state: AnnounceState,
    pub value: Value,
    pub op: Option<OpId>,
}

impl ValueAnnounceTask {
    pub fn new(targets: Vec<ClosestEntry>, value: Value) -> Self {
        ValueAnnounceTask {
            state: AnnounceState::new(targets),
            value,
            op: None,
        }
    }

    pub fn with_op(mut self, op: OpId) -> Self {
        self.op = Some(op);
        self
    }

    pub fn step(&mut self) -> Vec<(NodeInfo, Request)> {
        let mut out = Vec::new();
        while let Some(entry) = self.state.next_target() {
            let request = Request::StoreValue {
                token: entry.token,
                value: self.value.clone(),
                expected_seq: -1,
            };
            out.push((entry.node, request));
        }
        out
    }

    pub fn on_response(&mut self) {
        self.state.on_ok();
    }

    pub fn on_call_lost(&mut self) {
        self.state.on_lost();
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    pub fn succeeded(&self) -> usize {
        self.state.succeeded
    }
}

pub struct PeerAnnounceTask {
    state: AnnounceState,
    pub peer: PeerInfo,
    pub op: Option<OpId>,
}

impl PeerAnnounceTask {
    pub fn new(targets: Vec<ClosestEntry>, peer: PeerInfo) -> Self {
        PeerAnnounceTask {
            state: AnnounceState::new(targets),
            peer,
            op: None,
        }
    }

    pub fn with_op(mut self, op: OpId) -> Self {
        self.op = Some(op);
        self
    }

    pub fn step(&mut self) -> Vec<(NodeInfo, Request)> {
        let mut out = Vec::new();
        while let Some(entry) = self.state.next_target() {
            let request = Request::AnnouncePeer {
                token: entry.token,
                peer: self.peer.clone(),
            };
            out.push((entry.node, request));
        }
        out
    }

    pub fn on_response(&mut self) {
        self.state.on_ok();
    }

    pub fn on_call_lost(&mut self) {
        self.state.on_lost();
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    pub fn succeeded(&self) -> usize {
        self.state.succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id;
    use std::net::IpAddr;

    fn targets(n: u8) -> Vec<ClosestEntry> {
        (0..n)
            .map(|i| ClosestEntry {
                node: NodeInfo::new(
                    Id::random(),
                    std::net::SocketAddr::new(IpAddr::from([203, 0, 113, i]), 39000 + i as u16),
                ),
                token: 100 + i as i32,
            })
            .collect()
    }

    #[test]
    fn every_target_gets_its_own_token() {
        let value = Value::create(b"announced").unwrap();
        let mut task = ValueAnnounceTask::new(targets(8), value);

        let mut seen_tokens = Vec::new();
        while !task.is_complete() {
            for (_, request) in task.step() {
                let Request::StoreValue { token, .. } = request else {
                    panic!("wrong request type");
                };
                seen_tokens.push(token);
                task.on_response();
            }
        }
        assert_eq!(seen_tokens.len(), 8);
        assert_eq!(task.succeeded(), 8);
        // tokens are per-responder, not shared
        seen_tokens.dedup();
        assert_eq!(seen_tokens.len(), 8);
    }

    #[test]
    fn completes_even_when_all_sends_fail() {
        let peer = PeerInfo::create(&Id::random(), 8080).unwrap();
        let mut task = PeerAnnounceTask::new(targets(4), peer);

        while !task.is_complete() {
            for _ in task.step() {
                task.on_call_lost();
            }
        }
        assert_eq!(task.succeeded(), 0);
    }
}

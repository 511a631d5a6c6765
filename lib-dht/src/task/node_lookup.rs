//! Node lookup: walk toward a target id and pin down the K closest
//! reachable nodes. With `want_token` set it doubles as the prelude of a
//! store/announce, collecting write tokens from every responder.

use crate::id::Id;
use crate::lookup_option::LookupOption;
use crate::messages::{LookupRequest, Request, Response};
use crate::node_info::{Family, NodeInfo};

use super::lookup::{ClosestEntry, LookupState};
use super::{Followup, OpId};

pub struct NodeLookupTask {
    pub lookup: LookupState,
    pub op: Option<OpId>,
    pub followup: Option<Followup>,
}

impl NodeLookupTask {
    pub fn new(target: Id, family: Family, option: LookupOption) -> Self {
        NodeLookupTask {
            lookup: LookupState::new(target, family, option),
            op: None,
            followup: None,
        }
    }

    pub fn with_op(mut self, op: OpId) -> Self {
        self.op = Some(op);
        self
    }

    pub fn with_followup(mut self, followup: Followup) -> Self {
        self.lookup.want_token = true;
        self.followup = Some(followup);
        self
    }

    fn request_for(&self, _target: &NodeInfo) -> Request {
        let mut lookup = LookupRequest::new(
            self.lookup.target,
            self.lookup.family == Family::V4,
            self.lookup.family == Family::V6,
        );
        lookup.want_token = self.lookup.want_token;
        Request::FindNode(lookup)
    }

    /// Claim candidates up to the concurrency bound.
    pub fn step(&mut self) -> Vec<(NodeInfo, Request)> {
        let mut out = Vec::new();
        while let Some(target) = self.lookup.next_candidate() {
            let request = self.request_for(&target);
            out.push((target, request));
        }
        out
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
    }

    pub fn on_call_lost(&mut self) {
        self.lookup.call_finished();
    }

    pub fn is_complete(&self) -> bool {
        self.lookup.is_complete()
    }

    pub fn closest_set(&self) -> Vec<ClosestEntry> {
        self.lookup.closest_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants;
    use std::net::IpAddr;

    fn node(i: u8) -> NodeInfo {
        NodeInfo::new(
            Id::random(),
            std::net::SocketAddr::new(IpAddr::from([203, 0, 113, i]), 39000 + i as u16),
        )
    }

    #[test]
    fn step_issues_find_node_requests() {
        let local = Id::random();
        let mut task = NodeLookupTask::new(Id::random(), Family::V4, LookupOption::Conservative);
        task.lookup
            .add_candidates(&local, &[node(1), node(2), node(3), node(4)]);

        let sends = task.step();
        assert_eq!(sends.len(), constants::MAX_CONCURRENT_TASK_REQUESTS);
        for (_, request) in &sends {
            assert!(matches!(request, Request::FindNode(_)));
        }
        // no double-claiming
        assert!(task.step().is_empty());
    }

    #[test]
    fn tokens_are_captured_for_announce_preludes() {
        let local = Id::random();
        let value = crate::value::Value::create(b"x").unwrap();
        let mut task = NodeLookupTask::new(Id::random(), Family::V4, LookupOption::Conservative)
            .with_followup(Followup::StoreValue(value));
        assert!(task.lookup.want_token);

        let responder = node(1);
        task.lookup.add_candidates(&local, &[responder.clone()]);
        let _ = task.step();
        task.on_response(
            &local,
            &responder,
            &Response::FindNode(crate::messages::LookupResponse {
                nodes4: Vec::new(),
                nodes6: Vec::new(),
                token: 4242,
            }),
        );
        let closest = task.closest_set();
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].token, 4242);
    }
}

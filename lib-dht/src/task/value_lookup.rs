//! Value lookup: like a node lookup, but any responder may short-circuit
//! with the value itself. Conservative lookups keep walking and return the
//! highest sequence number seen; optimistic ones stop at the first hit.

use crate::id::Id;
use crate::lookup_option::LookupOption;
use crate::messages::{LookupRequest, Request, Response};
use crate::node_info::{Family, NodeInfo};
use crate::value::Value;

use super::lookup::LookupState;
use super::OpId;

pub struct ValueLookupTask {
    pub lookup: LookupState,
    pub op: Option<OpId>,
    /// Sequence number we already hold; responders omit anything at or
    /// below it.
    pub known_seq: i32,
    found: Option<Value>,
}

impl ValueLookupTask {
    pub fn new(target: Id, family: Family, option: LookupOption) -> Self {
        ValueLookupTask {
            lookup: LookupState::new(target, family, option),
            op: None,
            known_seq: -1,
            found: None,
        }
    }

    pub fn with_op(mut self, op: OpId) -> Self {
        self.op = Some(op);
        self
    }

    pub fn step(&mut self) -> Vec<(NodeInfo, Request)> {
        let mut out = Vec::new();
        while let Some(target) = self.lookup.next_candidate() {
            let request = Request::FindValue {
                lookup: LookupRequest::new(
                    self.lookup.target,
                    self.lookup.family == Family::V4,
                    self.lookup.family == Family::V6,
                ),
                seq: self.known_seq,
            };
            out.push((target, request));
        }
        out
    }

    fn accept_value(&mut self, value: Value) {
        // the value must actually live under the looked-up id
        if value.id() != self.lookup.target || !value.is_valid() {
            return;
        }
        let better = match &self.found {
            Some(existing) => value.sequence_number() > existing.sequence_number(),
            None => true,
        };
        if better {
            self.found = Some(value);
            if self.lookup.option.stop_on_first_hit() {
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
        if let Response::FindValue {
            value: Some(value), ..
        } = response
        {
            self.accept_value(value.clone());
        }
    }

    pub fn on_call_lost(&mut self) {
        self.lookup.call_finished();
    }

    pub fn is_complete(&self) -> bool {
        self.lookup.is_complete()
    }

    pub fn take_found(&mut self) -> Option<Value> {
        self.found.take()
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

    fn respond_with(value: &Value) -> Response {
        Response::FindValue {
            lookup: LookupResponse::default(),
            value: Some(value.clone()),
        }
    }

    #[test]
    fn optimistic_lookup_stops_on_first_hit() {
        let local = Id::random();
        let value = Value::create(b"hit").unwrap();
        let mut task = ValueLookupTask::new(value.id(), Family::V4, LookupOption::Optimistic);

        let responder = node(1);
        task.lookup.add_candidates(&local, &[responder.clone(), node(2)]);
        let _ = task.step();

        task.on_response(&local, &responder, &respond_with(&value));
        assert!(task.is_complete());
        assert_eq!(task.take_found(), Some(value));
    }

    #[test]
    fn higher_sequence_wins_in_conservative_mode() {
        let local = Id::random();
        let v0 = Value::create_signed(b"v0").unwrap();
        let v1 = v0.update(b"v1").unwrap();
        let mut task = ValueLookupTask::new(v0.id(), Family::V4, LookupOption::Conservative);

        let (a, b) = (node(1), node(2));
        task.lookup.add_candidates(&local, &[a.clone(), b.clone()]);
        let _ = task.step();

        task.on_response(&local, &a, &respond_with(&v1));
        task.on_response(&local, &b, &respond_with(&v0));
        assert_eq!(task.take_found().unwrap().sequence_number(), 1);
    }

    #[test]
    fn mismatched_value_id_is_ignored() {
        let local = Id::random();
        let value = Value::create(b"legit").unwrap();
        let forged = Value::create(b"forged").unwrap();
        let mut task = ValueLookupTask::new(value.id(), Family::V4, LookupOption::Optimistic);

        let responder = node(1);
        task.lookup.add_candidates(&local, &[responder.clone()]);
        let _ = task.step();

        task.on_response(&local, &responder, &respond_with(&forged));
        assert!(task.take_found().is_none());
    }
}

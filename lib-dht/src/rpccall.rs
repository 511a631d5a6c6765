//! Outstanding RPC transactions.

use std::net::SocketAddr;

use crate::id::Id;
use crate::messages::{Message, Method};
use crate::node_info::NodeInfo;

/// Lifecycle of a call. `Stalled` is a soft state: the base deadline passed
/// without an answer, a shorter follow-up deadline is armed, and the lookup
/// may already move on to other candidates.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CallState {
    Unsent,
    Sent,
    Stalled,
    Responded,
    Timeout,
    Canceled,
    Err,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Responded | CallState::Timeout | CallState::Canceled | CallState::Err
        )
    }
}

pub struct RpcCall {
    txid: i32,
    target: NodeInfo,
    request: Message,
    state: CallState,
    sent_at: u64,
    responded_at: u64,
    /// Task that issued the call, if any; bootstrap pings have none.
    task: Option<u64>,
}

impl RpcCall {
    pub fn new(target: NodeInfo, request: Message) -> Self {
        RpcCall {
            txid: 0,
            target,
            request,
            state: CallState::Unsent,
            sent_at: 0,
            responded_at: 0,
            task: None,
        }
    }

    pub fn with_task(mut self, task: u64) -> Self {
        self.task = Some(task);
        self
    }

    pub fn txid(&self) -> i32 {
        self.txid
    }

    pub fn target(&self) -> &NodeInfo {
        &self.target
    }

    pub fn target_id(&self) -> &Id {
        self.target.id()
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn method(&self) -> Option<Method> {
        self.request.method()
    }

    pub fn task(&self) -> Option<u64> {
        self.task
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn sent_at(&self) -> u64 {
        self.sent_at
    }

    pub fn responded_at(&self) -> u64 {
        self.responded_at
    }

    pub(crate) fn assign_txid(&mut self, txid: i32) {
        self.txid = txid;
        self.request.txid = txid;
    }

    pub(crate) fn sent(&mut self, now: u64) {
        self.state = CallState::Sent;
        self.sent_at = now;
    }

    pub(crate) fn stalled(&mut self) {
        if self.state == CallState::Sent {
            self.state = CallState::Stalled;
        }
    }

    pub(crate) fn responded(&mut self, now: u64) {
        self.state = CallState::Responded;
        self.responded_at = now;
    }

    pub(crate) fn timed_out(&mut self) {
        self.state = CallState::Timeout;
    }

    pub(crate) fn failed(&mut self) {
        self.state = CallState::Err;
    }

    pub(crate) fn cancel(&mut self) {
        self.state = CallState::Canceled;
    }

    /// Response sender must be the node we called...
    pub fn matches_id(&self, sender: &Id) -> bool {
        self.target.id() == sender
    }

    /// ...answering from the address we called it on.
    pub fn matches_addr(&self, from: &SocketAddr) -> bool {
        self.target.addr() == from
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Request;

    #[test]
    fn state_progression() {
        let target = NodeInfo::new(Id::random(), "198.51.100.1:39001".parse().unwrap());
        let mut call = RpcCall::new(target, Message::request(Request::Ping));

        assert_eq!(call.state(), CallState::Unsent);
        call.assign_txid(7);
        assert_eq!(call.request().txid, 7);

        call.sent(100);
        assert!(!call.state().is_terminal());
        call.stalled();
        assert_eq!(call.state(), CallState::Stalled);
        call.responded(150);
        assert!(call.state().is_terminal());
        assert_eq!(call.responded_at() - call.sent_at(), 50);
    }
}

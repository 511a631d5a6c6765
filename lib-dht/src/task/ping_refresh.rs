//! Maintenance pings for stale bucket entries and replacement-cache probes.
//! Timeout accounting happens in the routing table when the calls expire;
//! the task itself only tracks completion.

use crate::constants;
use crate::messages::Request;
use crate::node_info::NodeInfo;

pub struct PingRefreshTask {
    targets: Vec<NodeInfo>,
    next: usize,
    in_flight: usize,
}

impl PingRefreshTask {
    pub fn new(targets: Vec<NodeInfo>) -> Self {
        PingRefreshTask {
            targets,
            next: 0,
            in_flight: 0,
        }
    }

    pub fn step(&mut self) -> Vec<(NodeInfo, Request)> {
        let mut out = Vec::new();
        while self.in_flight < constants::MAX_CONCURRENT_TASK_REQUESTS
            && self.next < self.targets.len()
        {
            let target = self.targets[self.next].clone();
            self.next += 1;
            self.in_flight += 1;
            out.push((target, Request::Ping));
        }
        out
    }

    pub fn on_call_done(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn is_complete(&self) -> bool {
        self.in_flight == 0 && self.next >= self.targets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id;
    use std::net::IpAddr;

    #[test]
    fn pings_every_target_with_bounded_concurrency() {
        let targets: Vec<NodeInfo> = (0..7u8)
            .map(|i| {
                NodeInfo::new(
                    Id::random(),
                    std::net::SocketAddr::new(IpAddr::from([203, 0, 113, i]), 39000 + i as u16),
                )
            })
            .collect();

        let mut task = PingRefreshTask::new(targets);
        let mut pinged = 0;
        while !task.is_complete() {
            let sends = task.step();
            assert!(sends.len() <= constants::MAX_CONCURRENT_TASK_REQUESTS);
            pinged += sends.len();
            for _ in sends {
                task.on_call_done();
            }
        }
        assert_eq!(pinged, 7);
    }
}

//! Task bookkeeping: a bounded set of running tasks plus a FIFO backlog.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::constants;
use crate::id::Id;
use crate::messages::Response;
use crate::node_info::NodeInfo;

use super::{OutgoingRequest, Task, TaskId, TaskKind, TaskState};

pub struct TaskManager {
    tasks: HashMap<TaskId, Task>,
    backlog: VecDeque<TaskId>,
    running: Vec<TaskId>,
    next_id: TaskId,
}

impl TaskManager {
    pub fn new() -> Self {
        TaskManager {
            tasks: HashMap::new(),
            backlog: VecDeque::new(),
            running: Vec::new(),
            next_id: 1,
        }
    }

    pub fn add(&mut self, name: impl Into<String>, kind: TaskKind) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        let name = name.into();
        debug!(task = id, kind = kind.type_name(), %name, "queued task");
        self.tasks.insert(
            id,
            Task {
                id,
                name,
                state: TaskState::Queued,
                kind,
            },
        );
        self.backlog.push_back(id);
        id
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Promote backlog into the running set and collect every request the
    /// running tasks want sent.
    pub fn poll(&mut self) -> Vec<OutgoingRequest> {
        while self.running.len() < constants::MAX_ACTIVE_TASKS {
            let Some(id) = self.backlog.pop_front() else {
                break;
            };
            if let Some(task) = self.tasks.get_mut(&id) {
                task.state = TaskState::Running;
                self.running.push(id);
            }
        }

        let mut out = Vec::new();
        for id in &self.running {
            let Some(task) = self.tasks.get_mut(id) else {
                continue;
            };
            let sends = match &mut task.kind {
                TaskKind::NodeLookup(t) => t.step(),
                TaskKind::ValueLookup(t) => t.step(),
                TaskKind::PeerLookup(t) => t.step(),
                TaskKind::ValueAnnounce(t) => t.step(),
                TaskKind::PeerAnnounce(t) => t.step(),
                TaskKind::PingRefresh(t) => t.step(),
            };
            out.extend(sends.into_iter().map(|(target, request)| OutgoingRequest {
                task: *id,
                target,
                request,
            }));
        }
        out
    }

    /// A call issued for `task` was answered.
    pub fn on_call_responded(
        &mut self,
        task: TaskId,
        local_id: &Id,
        responder: &NodeInfo,
        response: &Response,
    ) {
        let Some(entry) = self.tasks.get_mut(&task) else {
            return;
        };
        match &mut entry.kind {
            TaskKind::NodeLookup(t) => t.on_response(local_id, responder, response),
            TaskKind::ValueLookup(t) => t.on_response(local_id, responder, response),
            TaskKind::PeerLookup(t) => t.on_response(local_id, responder, response),
            TaskKind::ValueAnnounce(t) => t.on_response(),
            TaskKind::PeerAnnounce(t) => t.on_response(),
            TaskKind::PingRefresh(t) => t.on_call_done(),
        }
    }

    /// A call issued for `task` will never complete usefully (timeout,
    /// error, stall, send failure): free its concurrency slot.
    pub fn on_call_lost(&mut self, task: TaskId) {
        let Some(entry) = self.tasks.get_mut(&task) else {
            return;
        };
        match &mut entry.kind {
            TaskKind::NodeLookup(t) => t.on_call_lost(),
            TaskKind::ValueLookup(t) => t.on_call_lost(),
            TaskKind::PeerLookup(t) => t.on_call_lost(),
            TaskKind::ValueAnnounce(t) => t.on_call_lost(),
            TaskKind::PeerAnnounce(t) => t.on_call_lost(),
            TaskKind::PingRefresh(t) => t.on_call_done(),
        }
    }

    /// Pull out every running task whose state machine is complete.
    pub fn take_finished(&mut self) -> Vec<Task> {
        let mut finished = Vec::new();
        self.running.retain(|id| {
            let complete = match self.tasks.get(id) {
                Some(task) => match &task.kind {
                    TaskKind::NodeLookup(t) => t.is_complete(),
                    TaskKind::ValueLookup(t) => t.is_complete(),
                    TaskKind::PeerLookup(t) => t.is_complete(),
                    TaskKind::ValueAnnounce(t) => t.is_complete(),
                    TaskKind::PeerAnnounce(t) => t.is_complete(),
                    TaskKind::PingRefresh(t) => t.is_complete(),
                },
                None => return false,
            };
            if complete {
                if let Some(mut task) = self.tasks.remove(id) {
                    task.state = TaskState::Finished;
                    debug!(task = task.id, kind = task.kind.type_name(), name = %task.name, "task finished");
                    finished.push(task);
                }
            }
            !complete
        });
        finished
    }

    /// Cancel a task outright; its outstanding calls are the caller's to
    /// clean up.
    pub fn cancel(&mut self, id: TaskId) -> Option<Task> {
        self.backlog.retain(|t| *t != id);
        self.running.retain(|t| *t != id);
        let mut task = self.tasks.remove(&id)?;
        task.state = TaskState::Canceled;
        Some(task)
    }

    pub fn cancel_all(&mut self) -> Vec<Task> {
        let ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.cancel(id)).collect()
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup_option::LookupOption;
    use crate::node_info::Family;
    use crate::task::node_lookup::NodeLookupTask;
    use std::net::IpAddr;

    fn seeded_lookup(local: &Id, n: u8) -> NodeLookupTask {
        let mut task = NodeLookupTask::new(Id::random(), Family::V4, LookupOption::Conservative);
        let nodes: Vec<NodeInfo> = (0..n)
            .map(|i| {
                NodeInfo::new(
                    Id::random(),
                    std::net::SocketAddr::new(IpAddr::from([203, 0, 113, i]), 39000 + i as u16),
                )
            })
            .collect();
        task.lookup.add_candidates(local, &nodes);
        task
    }

    #[test]
    fn poll_promotes_and_steps() {
        let local = Id::random();
        let mut manager = TaskManager::new();
        let id = manager.add("lookup", TaskKind::NodeLookup(seeded_lookup(&local, 5)));

        let sends = manager.poll();
        assert!(!sends.is_empty());
        assert!(sends.iter().all(|s| s.task == id));
        assert_eq!(manager.running_count(), 1);
    }

    #[test]
    fn finished_tasks_are_collected_once() {
        let local = Id::random();
        let mut manager = TaskManager::new();
        let id = manager.add("lookup", TaskKind::NodeLookup(seeded_lookup(&local, 2)));

        let sends = manager.poll();
        for send in &sends {
            manager.on_call_lost(send.task);
        }
        // both candidates lost, nothing left: complete
        let finished = manager.take_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].id, id);
        assert!(manager.take_finished().is_empty());
        assert!(manager.is_empty());
    }

    #[test]
    fn backlog_respects_running_bound() {
        let local = Id::random();
        let mut manager = TaskManager::new();
        for _ in 0..constants::MAX_ACTIVE_TASKS + 4 {
            manager.add("lookup", TaskKind::NodeLookup(seeded_lookup(&local, 1)));
        }
        manager.poll();
        assert_eq!(manager.running_count(), constants::MAX_ACTIVE_TASKS);
    }
}

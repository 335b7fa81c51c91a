//! Leading phase: spread submitted tasks over followers in turn
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::time::Instant;

use peerd_api::{
    Blob, Message, MessageKind, PeerId, RequestId, ServerState, TaskOutcome, WorkRequest,
    WorkResult,
};
use tracing::{debug, info, trace, warn};

use super::election::answer_looking_peer;
use super::PeerShared;

/// A task waiting to be assigned, along with who wants its outcome
pub struct Submission {
    pub task: Vec<u8>,
    pub requester: Requester,
}

/// Where the outcome of a task has to go
pub enum Requester {
    /// In-process caller, waiting on a channel
    Local(flume::Sender<TaskOutcome>),
    /// Remote client, expecting a `CompletedWork` echoing its `request_id`
    Remote {
        addr: SocketAddr,
        request_id: RequestId,
    },
}

impl Requester {
    /// Hand over the outcome; each requester gets exactly one
    pub fn deliver(self, shared: &PeerShared, outcome: TaskOutcome) {
        match self {
            Requester::Local(tx) => {
                if tx.send(outcome).is_err() {
                    debug!("Local requester went away");
                }
            }
            Requester::Remote { addr, request_id } => {
                shared.send_result(addr, request_id, outcome)
            }
        }
    }
}

struct Assignment {
    follower: PeerId,
    task: Vec<u8>,
    requester: Requester,
    assigned_at: Instant,
}

enum LeaderEvent {
    Message(Message),
    Submission(Submission),
    Disconnected,
}

pub struct RoundRobinLeader<'a> {
    shared: &'a PeerShared,
    incoming_rx: &'a flume::Receiver<Message>,
    submission_rx: &'a flume::Receiver<Submission>,

    /// Followers in ascending id order
    rotation: Vec<(PeerId, SocketAddr)>,
    /// Index into `rotation` of the next follower to try
    cursor: usize,
    /// Followers skipped by the rotation, until they answer again
    unreachable: BTreeSet<PeerId>,

    outstanding: BTreeMap<RequestId, Assignment>,

    backlog: Vec<Message>,
}

impl<'a> RoundRobinLeader<'a> {
    pub fn new(
        shared: &'a PeerShared,
        incoming_rx: &'a flume::Receiver<Message>,
        submission_rx: &'a flume::Receiver<Submission>,
    ) -> Self {
        let rotation = shared
            .peers()
            .iter()
            .filter(|(id, _)| **id != shared.id())
            .map(|(id, addr)| (*id, *addr))
            .collect();
        Self {
            shared,
            incoming_rx,
            submission_rx,
            rotation,
            cursor: 0,
            unreachable: BTreeSet::new(),
            outstanding: BTreeMap::new(),
            backlog: Vec::new(),
        }
    }

    /// Handle messages that arrived before this phase started
    pub fn with_backlog(mut self, backlog: Vec<Message>) -> Self {
        self.backlog = backlog;
        self
    }

    /// Serve until shutdown or until the peer leaves the leading state
    pub fn lead(mut self) {
        info!(
            id = %self.shared.id(),
            followers = self.rotation.len(),
            "Leading"
        );

        for msg in std::mem::take(&mut self.backlog) {
            self.handle_message(msg);
        }

        while !self.shared.is_node_shutting_down()
            && self.shared.state() == ServerState::Leading
        {
            let event = flume::Selector::new()
                .recv(self.incoming_rx, |res| {
                    res.map_or(LeaderEvent::Disconnected, LeaderEvent::Message)
                })
                .recv(self.submission_rx, |res| {
                    res.map_or(LeaderEvent::Disconnected, LeaderEvent::Submission)
                })
                .wait_timeout(self.shared.params().poll_interval);

            match event {
                Ok(LeaderEvent::Message(msg)) => self.handle_message(msg),
                Ok(LeaderEvent::Submission(Submission { task, requester })) => {
                    self.submit(task, requester)
                }
                Ok(LeaderEvent::Disconnected) => break,
                Err(_timeout) => {}
            }

            self.reassign_expired();
        }

        self.abandon_outstanding();
    }

    fn handle_message(&mut self, msg: Message) {
        if let Some(follower) = msg
            .sender_addr()
            .and_then(|addr| self.shared.peer_id_by_address(addr))
        {
            if self.unreachable.remove(&follower) {
                info!(%follower, "Follower is answering again");
            }
        }

        match msg.kind {
            MessageKind::Election => answer_looking_peer(self.shared, &msg),
            MessageKind::Work => {
                let Some(addr) = msg.sender_addr() else {
                    warn!(sender = %msg.sender, "Work from an unresolvable sender");
                    return;
                };
                match WorkRequest::from_bytes(msg.payload.as_slice()) {
                    Ok(req) => self.submit(
                        req.task.into_inner(),
                        Requester::Remote {
                            addr,
                            request_id: req.request_id,
                        },
                    ),
                    Err(e) => warn!(%addr, error = %e, "Invalid work request"),
                }
            }
            MessageKind::CompletedWork => match WorkResult::from_bytes(msg.payload.as_slice()) {
                Ok(result) => self.complete(result),
                Err(e) => warn!(sender = %msg.sender, error = %e, "Invalid work result"),
            },
        }
    }

    fn submit(&mut self, task: Vec<u8>, requester: Requester) {
        let task_id = self.shared.next_request_id();
        self.assign(task_id, task, requester);
    }

    fn next_follower(&mut self) -> Option<(PeerId, SocketAddr)> {
        for _ in 0..self.rotation.len() {
            let candidate = self.rotation[self.cursor];
            self.cursor = (self.cursor + 1) % self.rotation.len();
            if !self.unreachable.contains(&candidate.0) {
                return Some(candidate);
            }
        }
        None
    }

    fn assign(&mut self, task_id: RequestId, task: Vec<u8>, requester: Requester) {
        let Some((follower, addr)) = self.next_follower() else {
            warn!(%task_id, "No reachable followers, failing task");
            requester.deliver(self.shared, TaskOutcome::failure("no reachable followers"));
            return;
        };

        let req = WorkRequest {
            request_id: task_id,
            task: Blob::from(task.as_slice()),
        };
        if let Err(e) = self
            .shared
            .send_message(MessageKind::Work, req.to_bytes(), addr)
        {
            warn!(%task_id, error = %e, "Task can't be sent");
            requester.deliver(self.shared, TaskOutcome::failure(e.to_string()));
            return;
        }

        debug!(%task_id, %follower, "Task assigned");
        self.outstanding.insert(
            task_id,
            Assignment {
                follower,
                task,
                requester,
                assigned_at: Instant::now(),
            },
        );
    }

    fn complete(&mut self, result: WorkResult) {
        match self.outstanding.remove(&result.request_id) {
            Some(assignment) => {
                debug!(
                    task_id = %result.request_id,
                    follower = %assignment.follower,
                    success = result.outcome.is_success(),
                    "Task completed"
                );
                assignment.requester.deliver(self.shared, result.outcome);
            }
            None => {
                trace!(task_id = %result.request_id, "Result of unknown or already completed task");
            }
        }
    }

    fn reassign_expired(&mut self) {
        let Some(timeout) = self.shared.params().assignment_timeout else {
            return;
        };

        let expired: Vec<RequestId> = self
            .outstanding
            .iter()
            .filter(|(_, a)| timeout <= a.assigned_at.elapsed())
            .map(|(task_id, _)| *task_id)
            .collect();

        for task_id in expired {
            let Some(assignment) = self.outstanding.remove(&task_id) else {
                continue;
            };
            warn!(
                %task_id,
                follower = %assignment.follower,
                "Follower did not answer in time, reassigning"
            );
            self.unreachable.insert(assignment.follower);
            self.assign(task_id, assignment.task, assignment.requester);
        }
    }

    fn abandon_outstanding(&mut self) {
        let reason = if self.shared.is_node_shutting_down() {
            "leader is shutting down"
        } else {
            "leader stepped down"
        };

        let outstanding = std::mem::take(&mut self.outstanding);
        if !outstanding.is_empty() {
            info!(count = outstanding.len(), reason, "Abandoning outstanding tasks");
        }
        for (_, assignment) in outstanding {
            assignment
                .requester
                .deliver(self.shared, TaskOutcome::failure(reason));
        }
        for submission in self.submission_rx.try_iter() {
            submission
                .requester
                .deliver(self.shared, TaskOutcome::failure(reason));
        }
    }
}

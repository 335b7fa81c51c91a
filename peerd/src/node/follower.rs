use std::net::SocketAddr;

use peerd_api::{Message, MessageKind, ServerState, TaskOutcome, WorkRequest};
use tracing::{debug, info, trace, warn};

use super::election::answer_looking_peer;
use super::leader::Submission;
use super::{PeerShared, SubmitError};
use crate::executor::{execute_guarded, Executor};

/// Following phase: run whatever the leader assigns, one task at a time
pub struct Follower<'a> {
    shared: &'a PeerShared,
    incoming_rx: &'a flume::Receiver<Message>,
    submission_rx: &'a flume::Receiver<Submission>,
    executor: &'a dyn Executor,
    backlog: Vec<Message>,
}

impl<'a> Follower<'a> {
    pub fn new(
        shared: &'a PeerShared,
        incoming_rx: &'a flume::Receiver<Message>,
        submission_rx: &'a flume::Receiver<Submission>,
        executor: &'a dyn Executor,
    ) -> Self {
        Self {
            shared,
            incoming_rx,
            submission_rx,
            executor,
            backlog: Vec::new(),
        }
    }

    /// Handle messages that arrived before this phase started
    pub fn with_backlog(mut self, backlog: Vec<Message>) -> Self {
        self.backlog = backlog;
        self
    }

    /// Serve until shutdown or until the peer leaves the following state
    pub fn work(mut self) {
        for msg in std::mem::take(&mut self.backlog) {
            self.handle_message(msg);
        }

        while !self.shared.is_node_shutting_down()
            && self.shared.state() == ServerState::Following
        {
            self.reject_submissions();

            match self
                .incoming_rx
                .recv_timeout(self.shared.params().poll_interval)
            {
                Ok(msg) => self.handle_message(msg),
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        }
        self.reject_submissions();
    }

    /// Local submissions only make sense on the leader
    fn reject_submissions(&self) {
        for submission in self.submission_rx.try_iter() {
            let err = SubmitError::NotLeader {
                leader: self.shared.leader_address(),
            };
            submission
                .requester
                .deliver(self.shared, TaskOutcome::failure(err.to_string()));
        }
    }

    fn handle_message(&self, msg: Message) {
        match msg.kind {
            MessageKind::Election => answer_looking_peer(self.shared, &msg),
            MessageKind::Work => {
                let Some(sender) = msg.sender_addr() else {
                    warn!(sender = %msg.sender, "Work from an unresolvable sender");
                    return;
                };
                match WorkRequest::from_bytes(msg.payload.as_slice()) {
                    Ok(req) => self.handle_work(sender, req),
                    Err(e) => warn!(%sender, error = %e, "Invalid work request"),
                }
            }
            MessageKind::CompletedWork => {
                debug!(sender = %msg.sender, "Ignoring completed work while following");
            }
        }
    }

    /// Whether `sender` speaks for the leader we accepted
    ///
    /// A leader outside the address table has no known address, so
    /// any sender that isn't one of the other tabled peers is taken
    /// for it.
    fn is_from_leader(&self, sender: SocketAddr) -> bool {
        match self.shared.leader_address() {
            Some(leader) => leader == sender,
            None => {
                self.shared.current_leader().is_some()
                    && self.shared.peer_id_by_address(sender).is_none()
            }
        }
    }

    fn handle_work(&self, sender: SocketAddr, req: WorkRequest) {
        if !self.is_from_leader(sender) {
            let leader = self.shared.leader_address();
            debug!(%sender, ?leader, request_id = %req.request_id, "Work from a non-leader");
            let err = SubmitError::NotLeader { leader };
            self.shared
                .send_result(sender, req.request_id, TaskOutcome::failure(err.to_string()));
            return;
        }

        trace!(request_id = %req.request_id, "Executing task");
        let outcome = execute_guarded(self.executor, req.task.as_slice());
        info!(
            request_id = %req.request_id,
            success = outcome.is_success(),
            "Task executed"
        );
        self.shared.send_result(sender, req.request_id, outcome);
    }
}

//! Quorum-aware, bully-style leader election
//!
//! Every looking peer starts by proposing itself and keeps adopting
//! (and re-broadcasting) any vote that defeats its current proposal.
//! The transport can lose, duplicate and reorder notifications, so
//! nothing here depends on message order: proposals only ever move
//! up in the vote ordering, endorsements are tracked per peer id, and
//! lost notifications are covered by periodic re-broadcasts.
//!
//! A proposal is decided once a quorum of distinct peers (us
//! included) endorses it and it stays unchallenged for
//! `finalize_wait`. A peer that joins late adopts whatever a quorum
//! of already decided peers reports.
//!
//! Work traffic read while looking is kept for the phase that follows,
//! since a leader may start assigning before we finalize.
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use peerd_api::{ElectionNotification, Message, MessageKind, PeerId, ServerState, Vote};
use tracing::{debug, info, trace, warn};

use super::PeerShared;

/// Non-election messages kept while looking, at most
const MAX_DEFERRED: usize = 1024;

/// Latest vote we know a peer holds
#[derive(Debug, Clone, Copy)]
struct HeardVote {
    vote: Vote,
    state: ServerState,
}

impl HeardVote {
    fn is_decided(&self) -> bool {
        self.state != ServerState::Looking
    }
}

pub struct Election<'a> {
    shared: &'a PeerShared,
    incoming_rx: &'a flume::Receiver<Message>,
    proposal: Vote,
    heard: BTreeMap<PeerId, HeardVote>,
    /// Since when the current proposal is backed by a quorum
    quorum_since: Option<Instant>,
    idle_polls: u32,
    /// Work traffic for the phase after the election
    deferred: Vec<Message>,
}

impl<'a> Election<'a> {
    pub fn new(shared: &'a PeerShared, incoming_rx: &'a flume::Receiver<Message>) -> Self {
        Self {
            shared,
            incoming_rx,
            proposal: Vote::new(shared.id(), shared.epoch()),
            heard: BTreeMap::new(),
            quorum_since: None,
            idle_polls: 0,
            deferred: Vec::new(),
        }
    }

    /// Messages read while looking that belong to the next phase
    pub fn into_deferred(self) -> Vec<Message> {
        self.deferred
    }

    /// Run the election until a vote is decided
    ///
    /// On decision the peer's state and current leader are already
    /// updated when this returns. `None` means we were interrupted by
    /// a shutdown.
    pub fn look_for_leader(&mut self) -> Option<Vote> {
        let shared = self.shared;
        let params = shared.params();
        debug!(id = %self.shared.id(), proposal = %self.proposal, "Proposing");
        self.broadcast_proposal();
        self.update_quorum();

        loop {
            if self.shared.is_node_shutting_down() {
                return None;
            }

            if let Some(vote) = self.settled_vote() {
                return Some(self.decide(vote));
            }

            let wait = match self.quorum_since {
                Some(since) => {
                    let elapsed = since.elapsed();
                    if params.finalize_wait <= elapsed {
                        return Some(self.decide(self.proposal));
                    }
                    (params.finalize_wait - elapsed).min(params.poll_interval)
                }
                None => params.poll_interval,
            };

            match self.incoming_rx.recv_timeout(wait) {
                Ok(msg) => {
                    self.idle_polls = 0;
                    self.handle_message(msg);
                }
                Err(flume::RecvTimeoutError::Timeout) => {
                    self.idle_polls += 1;
                    if params.rebroadcast_after_idle_polls <= self.idle_polls {
                        trace!(id = %self.shared.id(), proposal = %self.proposal, "Re-broadcasting");
                        self.broadcast_proposal();
                        self.idle_polls = 0;
                    }
                }
                Err(flume::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn handle_message(&mut self, msg: Message) {
        if msg.kind != MessageKind::Election {
            if self.deferred.len() < MAX_DEFERRED {
                trace!(kind = ?msg.kind, sender = %msg.sender, "Deferring message while looking");
                self.deferred.push(msg);
            } else {
                warn!(kind = ?msg.kind, sender = %msg.sender, "Too many deferred messages, dropping");
            }
            return;
        }

        let n = match ElectionNotification::from_bytes(msg.payload.as_slice()) {
            Ok(n) => n,
            Err(e) => {
                warn!(sender = %msg.sender, error = %e, "Invalid election notification");
                return;
            }
        };

        if n.sender_id == self.shared.id() {
            return;
        }

        trace!(
            id = %self.shared.id(),
            from = %n.sender_id,
            vote = %n.vote,
            state = %n.sender_state,
            "Notification"
        );
        self.record(&n);

        if n.vote.defeats(&self.proposal) {
            self.adopt(n.vote);
        } else if n.sender_state == ServerState::Looking && self.proposal.defeats(&n.vote) {
            // let the sender know it is behind, without echoing its vote to anyone
            if let Some(target) = msg
                .sender_addr()
                .or_else(|| self.shared.peer_address(n.sender_id))
            {
                self.send_proposal(target);
            }
        }

        self.update_quorum();
    }

    fn record(&mut self, n: &ElectionNotification) {
        let new = HeardVote {
            vote: n.vote,
            state: n.sender_state,
        };
        match self.heard.entry(n.sender_id) {
            Entry::Vacant(e) => {
                e.insert(new);
            }
            Entry::Occupied(mut e) => {
                let heard = e.get_mut();
                // a looking peer only ever moves its vote up; anything lower is stale
                if heard.state == ServerState::Looking && new.state == ServerState::Looking {
                    heard.vote = heard.vote.max(new.vote);
                } else {
                    *heard = new;
                }
            }
        }
    }

    fn adopt(&mut self, vote: Vote) {
        debug!(id = %self.shared.id(), from = %self.proposal, to = %vote, "Adopting vote");
        self.proposal = vote;
        self.quorum_since = None;
        self.broadcast_proposal();
    }

    /// Number of distinct peers, us included, holding `vote`
    fn endorsements(&self, vote: Vote) -> usize {
        1 + self.heard.values().filter(|h| h.vote == vote).count()
    }

    fn update_quorum(&mut self) {
        if self.shared.quorum_size() <= self.endorsements(self.proposal) {
            if self.quorum_since.is_none() {
                debug!(id = %self.shared.id(), proposal = %self.proposal, "Proposal has a quorum");
                self.quorum_since = Some(Instant::now());
            }
        } else {
            self.quorum_since = None;
        }
    }

    /// A vote a quorum of already decided peers agrees on, if any
    fn settled_vote(&self) -> Option<Vote> {
        let mut counts: BTreeMap<Vote, usize> = BTreeMap::new();
        for heard in self.heard.values().filter(|h| h.is_decided()) {
            *counts.entry(heard.vote).or_default() += 1;
        }
        let quorum = self.shared.quorum_size();
        counts
            .into_iter()
            .rev()
            .find(|(_, count)| quorum <= count + 1)
            .map(|(vote, _)| vote)
    }

    fn decide(&self, vote: Vote) -> Vote {
        let state = if vote.leader == self.shared.id() {
            ServerState::Leading
        } else {
            ServerState::Following
        };
        info!(
            id = %self.shared.id(),
            leader = %vote,
            %state,
            endorsements = self.endorsements(vote),
            "Election decided"
        );
        self.shared.set_state(state);
        self.shared.set_current_leader(vote);
        vote
    }

    fn notification(&self) -> ElectionNotification {
        ElectionNotification {
            vote: self.proposal,
            sender_id: self.shared.id(),
            sender_state: ServerState::Looking,
        }
    }

    fn broadcast_proposal(&self) {
        if let Err(e) = self
            .shared
            .send_broadcast(MessageKind::Election, self.notification().to_bytes())
        {
            warn!(error = %e, "Could not broadcast proposal");
        }
    }

    fn send_proposal(&self, target: SocketAddr) {
        if let Err(e) =
            self.shared
                .send_message(MessageKind::Election, self.notification().to_bytes(), target)
        {
            warn!(%target, error = %e, "Could not send proposal");
        }
    }
}

/// Tell a peer that is still looking which leader we accepted
///
/// Used by leaders and followers, so late or restarted peers can join
/// an already settled cluster.
pub(crate) fn answer_looking_peer(shared: &PeerShared, msg: &Message) {
    let n = match ElectionNotification::from_bytes(msg.payload.as_slice()) {
        Ok(n) => n,
        Err(e) => {
            warn!(sender = %msg.sender, error = %e, "Invalid election notification");
            return;
        }
    };
    if n.sender_state != ServerState::Looking || n.sender_id == shared.id() {
        return;
    }
    let (Some(vote), Some(target)) = (shared.current_leader(), msg.sender_addr()) else {
        return;
    };

    trace!(id = %shared.id(), to = %n.sender_id, leader = %vote, "Answering looking peer");
    let reply = ElectionNotification {
        vote,
        sender_id: shared.id(),
        sender_state: shared.state(),
    };
    if let Err(e) = shared.send_message(MessageKind::Election, reply.to_bytes(), target) {
        warn!(%target, error = %e, "Could not answer looking peer");
    }
}

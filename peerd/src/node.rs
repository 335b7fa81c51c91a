mod election;
mod follower;
mod leader;
#[cfg(test)]
mod sim;
mod transport;

use crate::executor::Executor;
use crate::node::election::Election;
use crate::node::follower::Follower;
use crate::node::leader::{Requester, RoundRobinLeader, Submission};
use crate::node::transport::{UdpReceiver, UdpSender};
use crate::task::{AutoJoinHandle, PanicGuard};
use peerd_api::{
    Epoch, Message, MessageKind, PeerId, RequestId, ServerState, TaskOutcome, Vote, WorkResult,
    MAX_DATAGRAM_SIZE,
};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use typed_builder::TypedBuilder;

/// How often blocked workers wake up to check for shutdown
pub(crate) const SHUTDOWN_CHECK_PERIOD: Duration = Duration::from_millis(100);

/// Some parameters of runtime operation
#[derive(TypedBuilder, Debug, Clone)]
pub struct Parameters {
    /// Our own `PeerId`
    pub id: PeerId,

    /// Epoch our initial self-vote is proposed at
    #[builder(default = Parameters::DEFAULT_EPOCH)]
    pub epoch: Epoch,

    #[builder(default = Parameters::DEFAULT_BIND_ADDR)]
    pub bind: SocketAddr,

    /// Addresses of the other peers of the cluster
    ///
    /// Conventionally does not include our own id.
    #[builder(default)]
    pub peers: BTreeMap<PeerId, SocketAddr>,

    /// Bounded wait of a single receive attempt of any phase
    #[builder(default = Parameters::DEFAULT_POLL_INTERVAL)]
    pub poll_interval: Duration,

    /// Consecutive empty receive attempts after which the election
    /// re-broadcasts the current proposal
    #[builder(default = Parameters::DEFAULT_REBROADCAST_AFTER_IDLE_POLLS)]
    pub rebroadcast_after_idle_polls: u32,

    /// How long a proposal backed by a quorum must stay unchallenged
    /// before the election decides it
    #[builder(default = Parameters::DEFAULT_FINALIZE_WAIT)]
    pub finalize_wait: Duration,

    /// Reassign a task if its follower doesn't answer in time
    ///
    /// `None` disables reassignment.
    #[builder(default)]
    pub assignment_timeout: Option<Duration>,
}

impl Parameters {
    pub const DEFAULT_EPOCH: Epoch = Epoch(0);
    pub const DEFAULT_BIND_ADDR: SocketAddr =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
    pub const DEFAULT_REBROADCAST_AFTER_IDLE_POLLS: u32 = 2;
    pub const DEFAULT_FINALIZE_WAIT: Duration = Duration::from_millis(400);
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("message of {size} bytes does not fit in a datagram")]
    TooLarge { size: usize },
}

pub type SendResult<T> = std::result::Result<T, SendError>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubmitError {
    #[error("not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<SocketAddr> },
    #[error("node is shutting down")]
    ShuttingDown,
    #[error("timeout waiting for the result")]
    Timeout,
}

pub type SubmitResult<T> = std::result::Result<T, SubmitError>;

/// State of a peer shared between its workers
///
/// Identity and the address table are read-only. The server state and
/// the accepted leader vote are replaced as a whole, only at phase
/// boundaries, so readers never observe a partial update.
pub struct PeerShared {
    params: Parameters,

    /// Address we advertise as the sender of our messages
    local_addr: SocketAddr,

    is_node_shutting_down: Arc<AtomicBool>,

    /// [`ServerState`] as its `u8` representation
    state: AtomicU8,

    /// The vote accepted by the last completed election
    current_leader_tx: watch::Sender<Option<Vote>>,

    /// Task ids stay unique across leadership terms, so late results
    /// from an earlier term can't resolve a newer task
    next_request_id: AtomicU64,

    outgoing_tx: flume::Sender<Message>,
}

impl PeerShared {
    pub(crate) fn new(
        params: Parameters,
        local_addr: SocketAddr,
        outgoing_tx: flume::Sender<Message>,
        is_node_shutting_down: Arc<AtomicBool>,
    ) -> Self {
        let (current_leader_tx, _) = watch::channel(None);
        Self {
            params,
            local_addr,
            is_node_shutting_down,
            state: AtomicU8::new(ServerState::Looking.into()),
            current_leader_tx,
            next_request_id: AtomicU64::new(0),
            outgoing_tx,
        }
    }

    pub fn id(&self) -> PeerId {
        self.params.id
    }

    pub fn epoch(&self) -> Epoch {
        self.params.epoch
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn panic_guard(&self, name: &'static str) -> PanicGuard {
        PanicGuard::new(name, self.is_node_shutting_down.clone())
    }

    pub fn is_node_shutting_down(&self) -> bool {
        self.is_node_shutting_down.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        if !self.is_node_shutting_down.swap(true, Ordering::SeqCst) {
            info!(id = %self.id(), "Shutting down");
        }
    }

    pub fn state(&self) -> ServerState {
        ServerState::try_from(self.state.load(Ordering::SeqCst))
            .expect("only valid states are ever stored")
    }

    pub fn set_state(&self, new_state: ServerState) {
        let old = self.state.swap(new_state.into(), Ordering::SeqCst);
        debug!(id = %self.id(), from = old, to = %new_state, "State change");
    }

    pub fn current_leader(&self) -> Option<Vote> {
        *self.current_leader_tx.borrow()
    }

    pub fn set_current_leader(&self, vote: Vote) {
        info!(id = %self.id(), leader = %vote, "Leader set");
        self.current_leader_tx.send_replace(Some(vote));
    }

    pub fn subscribe_current_leader(&self) -> watch::Receiver<Option<Vote>> {
        self.current_leader_tx.subscribe()
    }

    pub fn next_request_id(&self) -> RequestId {
        RequestId(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn peer_address(&self, id: PeerId) -> Option<SocketAddr> {
        self.params.peers.get(&id).copied()
    }

    pub fn peer_id_by_address(&self, addr: SocketAddr) -> Option<PeerId> {
        self.params
            .peers
            .iter()
            .find(|(_, peer_addr)| **peer_addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn peers(&self) -> &BTreeMap<PeerId, SocketAddr> {
        &self.params.peers
    }

    /// Address of the current leader, if known and not us
    pub fn leader_address(&self) -> Option<SocketAddr> {
        self.current_leader()
            .and_then(|vote| self.peer_address(vote.leader))
    }

    /// Size of a majority of the whole cluster
    ///
    /// The address table normally doesn't contain our own id, so we
    /// count ourselves in. Compare vote counts with `>=`.
    pub fn quorum_size(&self) -> usize {
        let cluster_size = if self.params.peers.contains_key(&self.params.id) {
            self.params.peers.len()
        } else {
            self.params.peers.len() + 1
        };
        cluster_size / 2 + 1
    }

    /// Queue a unicast message
    ///
    /// Never blocks and gives no delivery guarantee.
    pub fn send_message(
        &self,
        kind: MessageKind,
        payload: Vec<u8>,
        target: SocketAddr,
    ) -> SendResult<()> {
        let size = Message::header_len(self.local_addr, target) + payload.len();
        if MAX_DATAGRAM_SIZE < size {
            return Err(SendError::TooLarge { size });
        }

        let msg = Message::new(kind, self.local_addr, target, payload);
        if self.outgoing_tx.send(msg).is_err() {
            trace!(%target, "Outgoing queue closed, dropping message");
        }
        Ok(())
    }

    /// Queue the `CompletedWork` for a request
    ///
    /// An outcome too large for a datagram is replaced with a failure,
    /// so the requester still gets exactly one answer.
    pub fn send_result(&self, target: SocketAddr, request_id: RequestId, outcome: TaskOutcome) {
        let result = WorkResult {
            request_id,
            outcome,
        };
        let Err(e) = self.send_message(MessageKind::CompletedWork, result.to_bytes(), target)
        else {
            return;
        };

        warn!(%target, %request_id, error = %e, "Result does not fit, reporting failure");
        let result = WorkResult {
            request_id,
            outcome: TaskOutcome::failure(format!("task output too large: {e}")),
        };
        if let Err(e) = self.send_message(MessageKind::CompletedWork, result.to_bytes(), target) {
            warn!(%target, %request_id, error = %e, "Could not report failure");
        }
    }

    /// Queue one copy of a message for every peer in the address table
    pub fn send_broadcast(&self, kind: MessageKind, payload: Vec<u8>) -> SendResult<()> {
        for target in self.params.peers.values() {
            self.send_message(kind, payload.clone(), *target)?;
        }
        Ok(())
    }
}

pub struct NodeCtrl {
    is_node_shutting_down: Arc<AtomicBool>,
    shared: Arc<PeerShared>,
    submission_tx: flume::Sender<Submission>,
}

impl NodeCtrl {
    pub fn id(&self) -> PeerId {
        self.shared.id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr()
    }

    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    pub fn current_leader(&self) -> Option<Vote> {
        self.shared.current_leader()
    }

    pub fn subscribe_current_leader(&self) -> watch::Receiver<Option<Vote>> {
        self.shared.subscribe_current_leader()
    }

    pub fn quorum_size(&self) -> usize {
        self.shared.quorum_size()
    }

    /// Send the peer back to leader election
    ///
    /// The running leading/following phase notices and returns.
    pub fn start_election(&self) {
        info!(id = %self.id(), "Election requested");
        self.shared.set_state(ServerState::Looking);
    }

    /// Submit a task to this peer, which must be leading
    ///
    /// The returned channel yields exactly one outcome.
    pub fn submit(&self, task: Vec<u8>) -> SubmitResult<flume::Receiver<TaskOutcome>> {
        if self.shared.is_node_shutting_down() {
            return Err(SubmitError::ShuttingDown);
        }
        if self.shared.state() != ServerState::Leading {
            return Err(SubmitError::NotLeader {
                leader: self.shared.leader_address(),
            });
        }

        let (tx, rx) = flume::bounded(1);
        self.submission_tx
            .send(Submission {
                task,
                requester: Requester::Local(tx),
            })
            .map_err(|_| SubmitError::ShuttingDown)?;
        Ok(rx)
    }

    /// Like [`Self::submit`], but waits for the outcome
    pub fn submit_wait(&self, task: Vec<u8>, timeout: Duration) -> SubmitResult<TaskOutcome> {
        match self.submit(task)?.recv_timeout(timeout) {
            Ok(outcome) => Ok(outcome),
            Err(flume::RecvTimeoutError::Timeout) => Err(SubmitError::Timeout),
            Err(flume::RecvTimeoutError::Disconnected) => Err(SubmitError::ShuttingDown),
        }
    }

    pub fn stop(&self) {
        self.shared.shutdown();
    }

    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        debug!("Installing signal handler");
        for sig in TERM_SIGNALS {
            trace!(sig, "Installing signal handler");
            flag::register(*sig, Arc::clone(&self.is_node_shutting_down))?;
        }
        Ok(())
    }
}

/// Runs the phases of a peer one after another, on its own thread
pub struct PeerServer {
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl PeerServer {
    pub(crate) fn new(
        shared: Arc<PeerShared>,
        incoming_rx: flume::Receiver<Message>,
        submission_rx: flume::Receiver<Submission>,
        executor: Arc<dyn Executor>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            join_handle: AutoJoinHandle::spawn("peer-server", move || {
                let _guard = scopeguard::guard((), |_| {
                    info!("PeerServer is done");
                });
                let panic_guard = shared.panic_guard("peer-server");
                run_peer_server(&shared, &incoming_rx, &submission_rx, executor.as_ref());
                panic_guard.done();
            })?,
        })
    }
}

/// The main loop: dispatch on the current state until shutdown
pub(crate) fn run_peer_server(
    shared: &PeerShared,
    incoming_rx: &flume::Receiver<Message>,
    submission_rx: &flume::Receiver<Submission>,
    executor: &dyn Executor,
) {
    // messages the election read on behalf of the next phase
    let mut backlog = Vec::new();
    while !shared.is_node_shutting_down() {
        match shared.state() {
            ServerState::Looking => {
                info!(id = %shared.id(), "Starting leader election");
                let mut election = Election::new(shared, incoming_rx);
                if election.look_for_leader().is_none() {
                    debug!(id = %shared.id(), "Election interrupted");
                }
                backlog.extend(election.into_deferred());
            }
            ServerState::Leading => {
                info!(id = %shared.id(), "Starting round-robin leader");
                RoundRobinLeader::new(shared, incoming_rx, submission_rx)
                    .with_backlog(std::mem::take(&mut backlog))
                    .lead();
            }
            ServerState::Following => {
                info!(
                    id = %shared.id(),
                    leader = ?shared.current_leader(),
                    "Starting to follow"
                );
                Follower::new(shared, incoming_rx, submission_rx, executor)
                    .with_backlog(std::mem::take(&mut backlog))
                    .work();
            }
        }
    }
}

pub struct Node {
    is_node_shutting_down: Arc<AtomicBool>,
    stop_on_drop: bool,
    shared: Arc<PeerShared>,
    submission_tx: flume::Sender<Submission>,
    #[allow(unused)]
    peer_server: PeerServer,
    /// Thread reading datagrams into the incoming queue
    #[allow(unused)]
    udp_receiver: UdpReceiver,
    /// Thread draining the outgoing queue onto the network
    #[allow(unused)]
    udp_sender: UdpSender,
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.stop_on_drop {
            self.shared.shutdown();
        }
    }
}

impl Node {
    pub fn new(params: Parameters, executor: impl Executor) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(params.bind)?;
        Self::from_socket(params, socket, executor)
    }

    /// Start a node on an already bound socket
    pub fn from_socket(
        params: Parameters,
        socket: UdpSocket,
        executor: impl Executor,
    ) -> anyhow::Result<Self> {
        let local_addr = socket.local_addr()?;
        info!(
            id = %params.id,
            epoch = %params.epoch,
            %local_addr,
            peers = params.peers.len(),
            "Starting peerd"
        );
        // the bound address is what we advertise as the sender of every message
        anyhow::ensure!(
            !local_addr.ip().is_unspecified(),
            "can't advertise unspecified address {local_addr}, bind to a concrete one"
        );

        socket.set_read_timeout(Some(SHUTDOWN_CHECK_PERIOD))?;
        let send_socket = socket.try_clone()?;

        let is_node_shutting_down = Arc::new(AtomicBool::new(false));
        let (outgoing_tx, outgoing_rx) = flume::unbounded();
        let (incoming_tx, incoming_rx) = flume::unbounded();
        let (submission_tx, submission_rx) = flume::unbounded();

        let shared = Arc::new(PeerShared::new(
            params,
            local_addr,
            outgoing_tx,
            is_node_shutting_down.clone(),
        ));

        // workers already spawned only exit once the flag is set
        let stop_workers = |e: std::io::Error| {
            shared.shutdown();
            e
        };
        let udp_sender =
            UdpSender::new(shared.clone(), send_socket, outgoing_rx).map_err(stop_workers)?;
        let udp_receiver =
            UdpReceiver::new(shared.clone(), socket, incoming_tx).map_err(stop_workers)?;
        let peer_server = PeerServer::new(
            shared.clone(),
            incoming_rx,
            submission_rx,
            Arc::new(executor),
        )
        .map_err(stop_workers)?;

        Ok(Node {
            is_node_shutting_down,
            stop_on_drop: true,
            shared,
            submission_tx,
            peer_server,
            udp_receiver,
            udp_sender,
        })
    }

    pub fn get_ctrl(&self) -> NodeCtrl {
        NodeCtrl {
            is_node_shutting_down: Arc::clone(&self.is_node_shutting_down),
            shared: Arc::clone(&self.shared),
            submission_tx: self.submission_tx.clone(),
        }
    }

    /// Block until the node is stopped (e.g. by a signal)
    pub fn wait(mut self) {
        self.stop_on_drop = false;
        drop(self);
        info!("Node finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_with(id: u64, peer_ids: &[u64]) -> (PeerShared, flume::Receiver<Message>) {
        let peers = peer_ids
            .iter()
            .map(|&p| {
                let port = 9000 + u16::try_from(p).unwrap();
                (PeerId(p), SocketAddr::from(([127, 0, 0, 1], port)))
            })
            .collect();
        let (tx, rx) = flume::unbounded();
        let shared = PeerShared::new(
            Parameters::builder().id(PeerId(id)).peers(peers).build(),
            "127.0.0.1:9999".parse().unwrap(),
            tx,
            Arc::new(AtomicBool::new(false)),
        );
        (shared, rx)
    }

    #[test]
    fn quorum_size_counts_self() {
        // five peer cluster, table without self
        assert_eq!(shared_with(1, &[2, 3, 4, 5]).0.quorum_size(), 3);
        // four peer cluster
        assert_eq!(shared_with(1, &[2, 3, 4]).0.quorum_size(), 3);
        // just us
        assert_eq!(shared_with(1, &[]).0.quorum_size(), 1);
        // table that does list self
        assert_eq!(shared_with(1, &[1, 2, 3, 4, 5]).0.quorum_size(), 3);
        assert_eq!(shared_with(1, &[2, 3, 4, 5, 6]).0.quorum_size(), 4);
    }

    #[test]
    fn initial_state_is_looking() {
        let (shared, _rx) = shared_with(1, &[2]);
        assert_eq!(shared.state(), ServerState::Looking);
        assert_eq!(shared.current_leader(), None);

        shared.set_state(ServerState::Following);
        shared.set_current_leader(Vote::new(PeerId(2), Epoch(0)));
        assert_eq!(shared.state(), ServerState::Following);
        assert_eq!(shared.leader_address(), Some("127.0.0.1:9002".parse().unwrap()));
    }

    #[test]
    fn broadcast_reaches_every_peer() {
        let (shared, rx) = shared_with(1, &[2, 3, 4]);
        shared
            .send_broadcast(MessageKind::Election, vec![1, 2, 3])
            .unwrap();

        let receivers: Vec<_> = rx.try_iter().map(|m| m.receiver_addr().unwrap()).collect();
        assert_eq!(receivers, shared.peers().values().copied().collect::<Vec<_>>());
    }

    #[test]
    fn oversized_message_is_rejected() {
        let (shared, rx) = shared_with(1, &[2]);
        let target = shared.peer_address(PeerId(2)).unwrap();
        assert!(matches!(
            shared.send_message(MessageKind::Work, vec![0; MAX_DATAGRAM_SIZE], target),
            Err(SendError::TooLarge { .. })
        ));
        assert!(rx.is_empty());
    }

    #[test]
    fn oversized_result_is_replaced_with_failure() {
        let (shared, rx) = shared_with(1, &[2]);
        let target = shared.peer_address(PeerId(2)).unwrap();
        shared.send_result(
            target,
            RequestId(4),
            TaskOutcome::success(vec![0; MAX_DATAGRAM_SIZE]),
        );

        let msgs: Vec<_> = rx.try_iter().collect();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageKind::CompletedWork);
        assert_eq!(msgs[0].receiver_addr(), Some(target));
        let result = WorkResult::from_bytes(msgs[0].payload.as_slice()).unwrap();
        assert_eq!(result.request_id, RequestId(4));
        assert!(result
            .outcome
            .diagnostic()
            .unwrap()
            .starts_with("task output too large"));
    }

    #[test]
    fn unspecified_bind_address_is_rejected() {
        let socket = UdpSocket::bind("0.0.0.0:0").unwrap();
        let res = Node::from_socket(
            Parameters::builder().id(PeerId(1)).build(),
            socket,
            |_: &[u8]| TaskOutcome::success(Vec::new()),
        );
        assert!(res.is_err());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (shared, _rx) = shared_with(1, &[]);
        shared.shutdown();
        shared.shutdown();
        assert!(shared.is_node_shutting_down());
    }
}

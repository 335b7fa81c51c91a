//! In-process network of peers with lossy delivery
//!
//! Messages still go through the wire codec, so the election and the
//! work distribution are exercised exactly as over UDP, minus the
//! sockets. Loss is driven by a seeded rng, so failures reproduce.
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use peerd_api::{Message, PeerId, ServerState, TaskOutcome, Vote};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use super::leader::{Requester, Submission};
use super::{run_peer_server, Parameters, PeerShared};
use crate::executor::Executor;
use crate::task::AutoJoinHandle;

const WAIT: Duration = Duration::from_secs(20);

fn sim_addr(id: PeerId) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], 20_000 + u16::try_from(id.0).expect("small ids")))
}

struct SimPeer {
    shared: Arc<PeerShared>,
    submission_tx: flume::Sender<Submission>,
    #[allow(unused)]
    server: AutoJoinHandle,
}

struct SimNetwork {
    is_shutting_down: Arc<AtomicBool>,
    peers: BTreeMap<PeerId, SimPeer>,
    #[allow(unused)]
    router: AutoJoinHandle,
}

impl SimNetwork {
    /// Start peers `1..=size`, of which only `live` ones run
    fn start(size: u64, live: &[u64], loss: f64, seed: u64) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let is_shutting_down = Arc::new(AtomicBool::new(false));
        let (outgoing_tx, outgoing_rx) = flume::unbounded::<Message>();
        let table: BTreeMap<PeerId, SocketAddr> =
            (1..=size).map(|id| (PeerId(id), sim_addr(PeerId(id)))).collect();

        let mut routes = BTreeMap::new();
        let mut peers = BTreeMap::new();
        for &id in live {
            let id = PeerId(id);
            let params = Parameters::builder()
                .id(id)
                .peers(
                    table
                        .iter()
                        .filter(|(peer, _)| **peer != id)
                        .map(|(peer, addr)| (*peer, *addr))
                        .collect(),
                )
                .poll_interval(Duration::from_millis(10))
                .rebroadcast_after_idle_polls(1)
                .finalize_wait(Duration::from_millis(150))
                .build();
            let shared = Arc::new(PeerShared::new(
                params,
                sim_addr(id),
                outgoing_tx.clone(),
                is_shutting_down.clone(),
            ));
            let (incoming_tx, incoming_rx) = flume::unbounded();
            let (submission_tx, submission_rx) = flume::unbounded();
            routes.insert(sim_addr(id), incoming_tx);

            // every peer answers with its own id, so tests can see who ran a task
            let executor = move |_: &[u8]| TaskOutcome::success(id.0.to_string());
            let server = AutoJoinHandle::spawn("sim-peer", {
                let shared = shared.clone();
                move || run_peer_server(&shared, &incoming_rx, &submission_rx, &executor)
            })
            .expect("spawn");

            peers.insert(
                id,
                SimPeer {
                    shared,
                    submission_tx,
                    server,
                },
            );
        }

        let router = AutoJoinHandle::spawn("sim-router", {
            let is_shutting_down = is_shutting_down.clone();
            move || {
                let mut rng = StdRng::seed_from_u64(seed);
                while !is_shutting_down.load(Ordering::SeqCst) {
                    let Ok(msg) = outgoing_rx.recv_timeout(Duration::from_millis(10)) else {
                        continue;
                    };
                    if rng.gen_bool(loss) {
                        trace!(receiver = %msg.receiver, "Dropping");
                        continue;
                    }
                    let msg = Message::from_bytes(&msg.to_bytes()).expect("valid encoding");
                    if let Some(tx) = msg.receiver_addr().and_then(|addr| routes.get(&addr)) {
                        let _ = tx.send(msg);
                    }
                }
            }
        })
        .expect("spawn");

        Self {
            is_shutting_down,
            peers,
            router,
        }
    }

    /// Wait until every live peer has decided, and return their votes
    fn wait_for_decision(&self) -> BTreeMap<PeerId, (ServerState, Vote)> {
        let start = Instant::now();
        loop {
            let decided: BTreeMap<_, _> = self
                .peers
                .iter()
                .filter_map(|(id, peer)| {
                    let state = peer.shared.state();
                    let vote = peer.shared.current_leader()?;
                    (state != ServerState::Looking).then_some((*id, (state, vote)))
                })
                .collect();
            if decided.len() == self.peers.len() {
                return decided;
            }
            assert!(start.elapsed() < WAIT, "no decision, so far: {decided:?}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn submit(&self, leader: PeerId, task: &[u8]) -> flume::Receiver<TaskOutcome> {
        let (tx, rx) = flume::bounded(1);
        self.peers[&leader]
            .submission_tx
            .send(Submission {
                task: task.to_vec(),
                requester: Requester::Local(tx),
            })
            .expect("peer running");
        rx
    }
}

impl Drop for SimNetwork {
    fn drop(&mut self) {
        self.is_shutting_down.store(true, Ordering::SeqCst);
    }
}

fn assert_single_leader(decided: &BTreeMap<PeerId, (ServerState, Vote)>) -> Vote {
    let votes: Vec<Vote> = decided.values().map(|(_, vote)| *vote).collect();
    assert!(votes.windows(2).all(|w| w[0] == w[1]), "{decided:?}");

    let leading: Vec<PeerId> = decided
        .iter()
        .filter(|(_, (state, _))| *state == ServerState::Leading)
        .map(|(id, _)| *id)
        .collect();
    assert_eq!(leading, vec![votes[0].leader], "{decided:?}");
    votes[0]
}

#[test]
fn election_converges() {
    let net = SimNetwork::start(5, &[1, 2, 3, 4, 5], 0.0, 1);
    let vote = assert_single_leader(&net.wait_for_decision());
    assert_eq!(vote.leader, PeerId(5));
}

#[test]
fn election_converges_under_loss() {
    for seed in [7, 42, 1234] {
        let net = SimNetwork::start(5, &[1, 2, 3, 4, 5], 0.4, seed);
        assert_single_leader(&net.wait_for_decision());
    }
}

#[test]
fn election_tolerates_silent_minority() {
    let net = SimNetwork::start(5, &[1, 2, 3], 0.2, 3);
    let decided = net.wait_for_decision();
    let vote = assert_single_leader(&decided);
    // 4 and 5 never speak, and 3 never adopts anything lower than itself
    assert_eq!(vote.leader, PeerId(3));
    assert_eq!(net.peers[&PeerId(1)].shared.quorum_size(), 3);
}

#[test]
fn tasks_are_spread_evenly() {
    let net = SimNetwork::start(4, &[1, 2, 3, 4], 0.0, 5);
    let leader = assert_single_leader(&net.wait_for_decision()).leader;
    assert_eq!(leader, PeerId(4));

    let outcomes: Vec<_> = (0..10u8).map(|i| net.submit(leader, &[i])).collect();
    let mut ran_on: BTreeMap<String, usize> = BTreeMap::new();
    for rx in outcomes {
        let outcome = rx.recv_timeout(WAIT).expect("outcome");
        assert!(outcome.is_success());
        *ran_on
            .entry(String::from_utf8_lossy(outcome.data()).into_owned())
            .or_default() += 1;
    }

    assert_eq!(
        ran_on,
        BTreeMap::from([("1".into(), 4), ("2".into(), 3), ("3".into(), 3)])
    );
}

#[test]
fn restarted_election_rejoins_leader() {
    let net = SimNetwork::start(3, &[1, 2, 3], 0.0, 9);
    let vote = assert_single_leader(&net.wait_for_decision());

    let follower = &net.peers[&PeerId(1)].shared;
    follower.set_state(ServerState::Looking);
    let start = Instant::now();
    while follower.state() == ServerState::Looking {
        assert!(start.elapsed() < WAIT);
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(follower.state(), ServerState::Following);
    assert_eq!(follower.current_leader(), Some(vote));
}

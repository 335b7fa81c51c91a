#![allow(unused)]

use anyhow::Result;
use peerd::api::{PeerId, ServerState, Vote};
use peerd::{Node, NodeCtrl, Parameters, ShellExecutor};
use std::collections::BTreeMap;
use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(20);

/// Cluster of nodes on loopback, some of which may never be started
pub struct TestCluster {
    addrs: BTreeMap<PeerId, SocketAddr>,
    nodes: BTreeMap<PeerId, Node>,
}

impl TestCluster {
    pub fn new(size: u64) -> Result<Self> {
        let all: Vec<u64> = (1..=size).collect();
        Self::with_live(size, &all)
    }

    /// Cluster of `1..=size`, of which only `live` peers run
    pub fn with_live(size: u64, live: &[u64]) -> Result<Self> {
        // bind upfront, so every peer knows every address before anyone starts
        let mut sockets = BTreeMap::new();
        for id in 1..=size {
            sockets.insert(PeerId(id), UdpSocket::bind("127.0.0.1:0")?);
        }
        let mut addrs = BTreeMap::new();
        for (id, socket) in &sockets {
            addrs.insert(*id, socket.local_addr()?);
        }

        let mut nodes = BTreeMap::new();
        for (id, socket) in sockets {
            if !live.contains(&id.0) {
                continue;
            }
            let params = Parameters::builder()
                .id(id)
                .peers(
                    addrs
                        .iter()
                        .filter(|(peer, _)| **peer != id)
                        .map(|(peer, addr)| (*peer, *addr))
                        .collect(),
                )
                .poll_interval(Duration::from_millis(20))
                .rebroadcast_after_idle_polls(1)
                .finalize_wait(Duration::from_millis(200))
                .build();
            nodes.insert(
                id,
                Node::from_socket(params, socket, ShellExecutor::default())?,
            );
        }

        Ok(Self { addrs, nodes })
    }

    pub fn ctrl(&self, id: u64) -> NodeCtrl {
        self.nodes[&PeerId(id)].get_ctrl()
    }

    pub fn addr(&self, id: PeerId) -> SocketAddr {
        self.addrs[&id]
    }

    /// Wait until every running node has decided, and return the
    /// leader they all agree on
    pub fn wait_for_leader(&self) -> Vote {
        let start = Instant::now();
        loop {
            let decided: Vec<(ServerState, Vote)> = self
                .nodes
                .values()
                .filter_map(|node| {
                    let ctrl = node.get_ctrl();
                    let state = ctrl.state();
                    let vote = ctrl.current_leader()?;
                    (state != ServerState::Looking).then_some((state, vote))
                })
                .collect();

            if decided.len() == self.nodes.len() {
                let vote = decided[0].1;
                assert!(decided.iter().all(|(_, v)| *v == vote), "{decided:?}");
                assert_eq!(
                    decided
                        .iter()
                        .filter(|(state, _)| *state == ServerState::Leading)
                        .count(),
                    1,
                    "{decided:?}"
                );
                return vote;
            }
            assert!(start.elapsed() < WAIT, "no leader elected in time");
            thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in self.nodes.values() {
            node.get_ctrl().stop();
        }
    }
}

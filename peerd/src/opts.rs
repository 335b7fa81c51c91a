use clap::Parser;
use peerd::api::{Epoch, PeerId};
use peerd::ShellExecutor;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[clap(about = "Peer of a leader-elected task execution cluster")]
pub struct Opts {
    /// Our own peer id
    #[clap(long = "id", env = "PEERD_ID")]
    pub id: u64,

    /// Epoch of our initial self-vote
    #[clap(long = "epoch", env = "PEERD_EPOCH", default_value_t = 0)]
    pub epoch: u64,

    #[clap(long = "listen", env = "PEERD_LISTEN", default_value = "127.0.0.1:7700")]
    pub listen: SocketAddr,

    /// Another peer of the cluster, as `ID=HOST:PORT`; repeat for each
    #[clap(long = "peer", value_parser = parse_peer)]
    pub peers: Vec<(PeerId, SocketAddr)>,

    #[clap(long = "poll-interval-ms", env = "PEERD_POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,

    #[clap(long = "finalize-wait-ms", env = "PEERD_FINALIZE_WAIT_MS")]
    pub finalize_wait_ms: Option<u64>,

    /// Reassign tasks followers don't complete in time (disabled by default)
    #[clap(long = "assignment-timeout-ms", env = "PEERD_ASSIGNMENT_TIMEOUT_MS")]
    pub assignment_timeout_ms: Option<u64>,

    /// Shell used to run tasks with `-c`
    #[clap(
        long = "executor-shell",
        env = "PEERD_EXECUTOR_SHELL",
        default_value = ShellExecutor::DEFAULT_SHELL
    )]
    pub executor_shell: PathBuf,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }

    pub fn epoch(&self) -> Epoch {
        Epoch(self.epoch)
    }

    pub fn peer_table(&self) -> anyhow::Result<BTreeMap<PeerId, SocketAddr>> {
        let mut table = BTreeMap::new();
        for (id, addr) in &self.peers {
            if table.insert(*id, *addr).is_some() {
                anyhow::bail!("peer {id} given more than once");
            }
        }
        Ok(table)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }

    pub fn finalize_wait(&self) -> Option<Duration> {
        self.finalize_wait_ms.map(Duration::from_millis)
    }

    pub fn assignment_timeout(&self) -> Option<Duration> {
        self.assignment_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_peer(s: &str) -> Result<(PeerId, SocketAddr), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=HOST:PORT, got `{s}`"))?;
    let id = id
        .trim()
        .parse()
        .map_err(|e| format!("invalid peer id `{id}`: {e}"))?;
    let addr = addr
        .trim()
        .parse()
        .map_err(|e| format!("invalid peer address `{addr}`: {e}"))?;
    Ok((PeerId(id), addr))
}

#[test]
fn parse_peer_test() {
    assert_eq!(
        parse_peer("3=127.0.0.1:7703"),
        Ok((PeerId(3), "127.0.0.1:7703".parse().unwrap()))
    );
    assert_eq!(
        parse_peer(" 12 = [::1]:80"),
        Ok((PeerId(12), "[::1]:80".parse().unwrap()))
    );
    assert!(parse_peer("127.0.0.1:7703").is_err());
    assert!(parse_peer("x=127.0.0.1:7703").is_err());
    assert!(parse_peer("3=localhost").is_err());
}

#[test]
fn duplicate_peer_is_rejected() {
    let opts = Opts::parse_from([
        "peerd",
        "--id",
        "1",
        "--peer",
        "2=127.0.0.1:7702",
        "--peer",
        "2=127.0.0.1:7703",
    ]);
    assert!(opts.peer_table().is_err());
}

#[test]
fn all_options_parse() {
    let opts = Opts::parse_from([
        "peerd",
        "--id",
        "3",
        "--epoch",
        "2",
        "--listen",
        "127.0.0.1:7703",
        "--peer",
        "1=127.0.0.1:7701",
        "--poll-interval-ms",
        "50",
        "--assignment-timeout-ms",
        "1000",
        "--executor-shell",
        "/bin/bash",
    ]);
    assert_eq!(opts.id, 3);
    assert_eq!(opts.epoch(), Epoch(2));
    assert_eq!(opts.listen, "127.0.0.1:7703".parse().unwrap());
    assert_eq!(opts.peer_table().unwrap().len(), 1);
    assert_eq!(opts.poll_interval(), Some(Duration::from_millis(50)));
    assert_eq!(opts.finalize_wait(), None);
    assert_eq!(opts.assignment_timeout(), Some(Duration::from_secs(1)));
    assert_eq!(opts.executor_shell, PathBuf::from("/bin/bash"));
}

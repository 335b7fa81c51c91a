#![cfg(unix)]
mod common;

use common::*;
use peerd::api::{PeerId, ServerState};
use peerd::SubmitError;
use peerd_client::Client;

#[test]
fn five_peers_elect_the_highest_id() -> anyhow::Result<()> {
    let cluster = TestCluster::new(5)?;

    let vote = cluster.wait_for_leader();
    assert_eq!(vote.leader, PeerId(5));
    assert_eq!(cluster.ctrl(5).state(), ServerState::Leading);
    for id in 1..=4 {
        assert_eq!(cluster.ctrl(id).state(), ServerState::Following);
        assert_eq!(cluster.ctrl(id).quorum_size(), 3);
    }

    Ok(())
}

#[test]
fn silent_minority_does_not_block_election() -> anyhow::Result<()> {
    let cluster = TestCluster::with_live(5, &[1, 2, 3])?;

    let vote = cluster.wait_for_leader();
    assert_eq!(vote.leader, PeerId(3));

    Ok(())
}

#[test]
fn leader_runs_tasks_on_followers() -> anyhow::Result<()> {
    let cluster = TestCluster::new(3)?;
    let leader = cluster.ctrl(cluster.wait_for_leader().leader.0);

    let outcome = leader.submit_wait(b"echo hello".to_vec(), WAIT)?;
    assert!(outcome.is_success());
    assert_eq!(outcome.data(), b"hello\n");

    let outcome = leader.submit_wait(b"echo oops >&2; exit 3".to_vec(), WAIT)?;
    assert!(!outcome.is_success());
    assert!(outcome.diagnostic().unwrap().contains("oops"));

    Ok(())
}

#[test]
fn follower_refuses_submissions() -> anyhow::Result<()> {
    let cluster = TestCluster::new(3)?;
    let leader = cluster.wait_for_leader().leader;

    assert_eq!(
        cluster.ctrl(1).submit(b"true".to_vec()).err(),
        Some(SubmitError::NotLeader {
            leader: Some(cluster.addr(leader))
        })
    );

    Ok(())
}

#[test]
fn client_round_trip() -> anyhow::Result<()> {
    let cluster = TestCluster::new(4)?;
    let leader = cluster.wait_for_leader().leader;

    let mut client = Client::connect(cluster.addr(leader), WAIT)?;
    for i in 0..6 {
        let outcome = client.submit(format!("echo $(({i} * 7))").as_bytes())?;
        assert_eq!(outcome.data(), format!("{}\n", i * 7).as_bytes());
    }

    let outcome = client.submit(b"exit 1")?;
    assert!(!outcome.is_success());

    Ok(())
}

#[test]
fn reelection_keeps_the_leader() -> anyhow::Result<()> {
    let cluster = TestCluster::new(3)?;
    let vote = cluster.wait_for_leader();

    let ctrl = cluster.ctrl(1);
    let mut leader_rx = ctrl.subscribe_current_leader();
    ctrl.start_election();
    assert_eq!(cluster.wait_for_leader(), vote);
    assert_eq!(*leader_rx.borrow_and_update(), Some(vote));

    Ok(())
}

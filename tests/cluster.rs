//! End-to-end cluster scenarios (`spec.md` §8), driven over
//! `transport::memory::ChannelTransport` with `tokio`'s paused/auto-advancing
//! clock so elections and heartbeats resolve without real wall-clock delay --
//! the same technique `other_examples/82c8ecf5_1660623-toydb__src-raft-node-candidate.rs.rs`
//! uses for its own node tests.

use raftcore::actor::{self, Handle};
use raftcore::config::MembershipConfig;
use raftcore::log::MemoryLog;
use raftcore::message::{AppendEntries, ClientError, ClientReply, Event, ReplicaId, Rpc};
use raftcore::state_machine::EchoStateMachine;
use raftcore::transport::memory::ChannelTransport;
use raftcore::transport::InboxHandle;
use std::collections::HashMap;
use std::time::Duration;

/// Spawns a cluster of `ids.len()` replicas wired together over one shared
/// `ChannelTransport`, all starting from the given `Stable` configuration.
/// Also returns each replica's own `InboxHandle`, so a test can inject a
/// synthetic RPC as if it came from a peer (`spec.md` §8 scenarios that need
/// a specific, otherwise-hard-to-arrange message rather than one organically
/// produced by the running cluster).
fn spawn_cluster(ids: &[ReplicaId]) -> (HashMap<ReplicaId, Handle>, HashMap<ReplicaId, InboxHandle>) {
    let mut inbox_handles = HashMap::new();
    let mut inboxes = HashMap::new();
    for &id in ids {
        let (inbox_handle, inbox) = InboxHandle::new_pair();
        inbox_handles.insert(id, inbox_handle);
        inboxes.insert(id, inbox);
    }
    // ChannelTransport needs its own routing table; every replica still
    // needs its own InboxHandle below to hand to `actor::spawn`.
    let transport = ChannelTransport::new(inbox_handles.clone());
    let injectors = inbox_handles.clone();

    let mut handles = HashMap::new();
    for &id in ids {
        let inbox_handle = inbox_handles.remove(&id).unwrap();
        let inbox = inboxes.remove(&id).unwrap();
        let peers: Vec<ReplicaId> = ids.iter().copied().filter(|&p| p != id).collect();
        let config = MembershipConfig::Stable {
            old_servers: ids.to_vec(),
        };
        let handle = actor::spawn(
            id,
            peers,
            config,
            MemoryLog::new(),
            transport.clone(),
            EchoStateMachine::default(),
            inbox_handle,
            inbox,
        );
        handles.insert(id, handle);
    }
    (handles, injectors)
}

/// Polls every replica's `leader()` until a majority agrees on the same
/// non-`None` leader, advancing the paused clock in between.
async fn wait_for_leader(handles: &HashMap<ReplicaId, Handle>) -> ReplicaId {
    for _ in 0..200 {
        let mut counts: HashMap<ReplicaId, usize> = HashMap::new();
        for handle in handles.values() {
            if let Some(leader) = handle.leader().await {
                *counts.entry(leader).or_insert(0) += 1;
            }
        }
        let majority = handles.len() / 2 + 1;
        if let Some((&leader, _)) = counts.iter().find(|(_, &count)| count >= majority) {
            return leader;
        }
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
    }
    panic!("no leader elected within the polling budget");
}

#[tokio::test(start_paused = true)]
async fn single_node_cluster_elects_itself_leader() {
    let (handles, _injectors) = spawn_cluster(&[1]);
    let leader = wait_for_leader(&handles).await;
    assert_eq!(leader, 1);
}

/// `spec.md` §8 scenario 1: a single-node cluster must not just elect
/// itself, it must also be able to commit -- there is no peer to ever send
/// back an `AppendEntriesReply`, so the leader's own log growth has to drive
/// the commit check directly.
#[tokio::test(start_paused = true)]
async fn single_node_cluster_commits_a_client_op() {
    let (handles, _injectors) = spawn_cluster(&[1]);
    let leader_id = wait_for_leader(&handles).await;
    let result = handles[&leader_id].op(b"set z=9".to_vec()).await;
    assert_eq!(result, Ok(ClientReply::Op(b"set z=9".to_vec())));
}

#[tokio::test(start_paused = true)]
async fn three_node_cluster_elects_a_leader_and_replicates() {
    let (handles, _injectors) = spawn_cluster(&[1, 2, 3]);
    let leader_id = wait_for_leader(&handles).await;
    let leader = &handles[&leader_id];

    let result = leader.op(b"set x=1".to_vec()).await;
    assert_eq!(result, Ok(ClientReply::Op(b"set x=1".to_vec())));
}

#[tokio::test(start_paused = true)]
async fn followers_redirect_client_ops_to_the_leader() {
    let (handles, _injectors) = spawn_cluster(&[1, 2, 3]);
    let leader_id = wait_for_leader(&handles).await;
    let follower_id = *handles.keys().find(|&&id| id != leader_id).unwrap();
    let follower = &handles[&follower_id];

    let result = follower.op(b"set y=2".to_vec()).await;
    assert_eq!(result, Err(ClientError::Redirect(leader_id)));
}

/// `spec.md` §8 scenario 4: a stale leader receiving an `AppendEntries` from
/// a newer term steps down instead of answering as leader.
#[tokio::test(start_paused = true)]
async fn leader_steps_down_on_append_entries_from_a_newer_term() {
    let (handles, injectors) = spawn_cluster(&[1, 2, 3]);
    let leader_id = wait_for_leader(&handles).await;

    // A phantom peer at a far newer term delivers an AppendEntries directly
    // to the leader's own inbox -- the same event a real newer leader's
    // heartbeat would produce.
    injectors[&leader_id]
        .events
        .send(Event::Rpc(Rpc::AppendEntries(AppendEntries {
            term: 99,
            from: 99,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            commit_index: 0,
        })))
        .expect("the replica's event inbox is still open");

    // The event inbox is FIFO, so this call is queued strictly after the
    // injected AppendEntries and observes the replica already demoted.
    let result = handles[&leader_id].op(b"late".to_vec()).await;
    assert!(
        matches!(
            result,
            Err(ClientError::Redirect(_)) | Err(ClientError::ElectionInProgress)
        ),
        "expected the demoted replica to reject as a follower, got {result:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn cluster_elects_a_new_leader_after_the_old_one_stops() {
    let (handles, _injectors) = spawn_cluster(&[1, 2, 3]);
    let first_leader = wait_for_leader(&handles).await;
    handles[&first_leader].stop();

    for _ in 0..200 {
        let mut counts: HashMap<ReplicaId, usize> = HashMap::new();
        for (&id, handle) in handles.iter() {
            if id == first_leader {
                continue;
            }
            if let Some(leader) = handle.leader().await {
                if leader != first_leader {
                    *counts.entry(leader).or_insert(0) += 1;
                }
            }
        }
        if counts.values().any(|&count| count >= 1) {
            return;
        }
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
    }
    panic!("no new leader elected after the old leader stopped");
}

#[tokio::test(start_paused = true)]
async fn joint_consensus_reconfiguration_commits_new_membership() {
    let (handles, _injectors) = spawn_cluster(&[1, 2, 3]);
    let leader_id = wait_for_leader(&handles).await;
    let leader = &handles[&leader_id];

    let result = leader.set_config(vec![1, 2, 3, 4]).await;
    match result {
        Ok(ClientReply::Config(MembershipConfig::Stable { old_servers })) => {
            let mut servers = old_servers;
            servers.sort_unstable();
            assert_eq!(servers, vec![1, 2, 3, 4]);
        }
        other => panic!("expected a stable config reply, got {other:?}"),
    }
}

//! The async driver task: owns the `Log`/`Transport`/`StateMachine`
//! collaborators and performs all I/O around the pure `fsm::Replica`
//! (`spec.md` §9's `step`/`tick` split; `SPEC_FULL.md` §2).
//!
//! [`spawn`] starts one replica's driver loop and returns a [`Handle`], the
//! crate's public client API (`spec.md` §6): `op`, `set_config`, `leader`,
//! `stop`, each a thin `oneshot`-backed round trip through the replica's own
//! event inbox, the way the teacher's `raft::client` talks to its node over a
//! channel rather than touching `Role`/`Log` directly
//! (`examples/YumingxuanGuo-featherkv/src/raft/client.rs`).

use crate::config::MembershipConfig;
use crate::fsm::{Effects, Outbound, Replica};
use crate::log::Log;
use crate::message::{ClientError, ClientResult, Event, ReplicaId, Rpc, Vote};
use crate::state_machine::StateMachine;
use crate::transport::{Inbox, InboxHandle, Transport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// A handle to a running replica. Cheap to clone; every clone talks to the
/// same driver task through its event channel.
#[derive(Clone)]
pub struct Handle {
    events: mpsc::UnboundedSender<Event>,
    next_id: Arc<AtomicU64>,
}

impl Handle {
    /// Proposes an opaque command (`spec.md` §6 `op(cmd)`). Resolves once
    /// the entry commits, or with an error if this replica isn't leader, a
    /// reconfiguration is in progress, or `CLIENT_TIMEOUT` elapses first.
    pub async fn op(&self, cmd: Vec<u8>) -> ClientResult {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.events.send(Event::ClientOp(id, cmd, reply_tx)).is_err() {
            return Err(ClientError::Timeout);
        }
        reply_rx.await.unwrap_or(Err(ClientError::Timeout))
    }

    /// Proposes a membership change (`spec.md` §6 `set_config(servers)`).
    pub async fn set_config(&self, servers: Vec<ReplicaId>) -> ClientResult {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .events
            .send(Event::ClientSetConfig(id, servers, reply_tx))
            .is_err()
        {
            return Err(ClientError::Timeout);
        }
        reply_rx.await.unwrap_or(Err(ClientError::Timeout))
    }

    /// The last leader this replica has heard of, if any (`spec.md` §6
    /// `get_leader()`).
    pub async fn leader(&self) -> Option<ReplicaId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.events.send(Event::GetLeader(reply_tx)).is_err() {
            return None;
        }
        reply_rx.await.ok().flatten()
    }

    /// Asks the driver loop to exit. Fire-and-forget; does not wait for the
    /// task to actually finish.
    pub fn stop(&self) {
        let _ = self.events.send(Event::Stop);
    }
}

/// Builds the replica and spawns its driver loop.
///
/// `inbox_handle`/`inbox` are a matched [`InboxHandle`]/[`Inbox`] pair
/// (`InboxHandle::new_pair`); the caller wires `inbox_handle` into whatever
/// `Transport`(s) deliver traffic to this replica (and/or keeps a clone for
/// its own use) before calling `spawn`, since `Transport` construction
/// typically needs every replica's `InboxHandle` up front (see
/// `transport::memory::ChannelTransport::new`).
pub fn spawn<L, T, M>(
    me: ReplicaId,
    peers: Vec<ReplicaId>,
    config: MembershipConfig,
    log: L,
    transport: T,
    state_machine: M,
    inbox_handle: InboxHandle,
    inbox: Inbox,
) -> Handle
where
    L: Log + 'static,
    T: Transport,
    M: StateMachine + 'static,
{
    let replica = Replica::new(me, peers, config, log, state_machine);
    let handle = Handle {
        events: inbox_handle.events.clone(),
        next_id: Arc::new(AtomicU64::new(1)),
    };
    tokio::spawn(run(replica, Arc::new(transport), inbox, inbox_handle.events));
    handle
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from(deadline)).await,
        None => std::future::pending().await,
    }
}

async fn run<L, T, M>(
    mut replica: Replica<L, M>,
    transport: Arc<T>,
    mut inbox: Inbox,
    events_tx: mpsc::UnboundedSender<Event>,
) where
    L: Log,
    T: Transport,
    M: StateMachine,
{
    let mut pending_votes: HashMap<ReplicaId, oneshot::Sender<Vote>> = HashMap::new();

    loop {
        let timer_deadline = tokio::time::Instant::from(replica.timer_deadline());
        let client_next = replica.next_client_deadline();

        let halt = tokio::select! {
            _ = tokio::time::sleep_until(timer_deadline) => {
                let effects = replica.handle(Event::Timeout);
                apply_effects(&transport, &events_tx, &mut pending_votes, effects)
            }
            _ = sleep_until_opt(client_next.map(|(deadline, _)| deadline)), if client_next.is_some() => {
                let id = client_next.expect("guarded by is_some() above").1;
                let effects = replica.handle(Event::ClientTimeout(id));
                apply_effects(&transport, &events_tx, &mut pending_votes, effects)
            }
            Some(vote_request) = inbox.vote_requests.recv() => {
                pending_votes.insert(vote_request.args.from, vote_request.reply);
                let effects = replica.handle(Event::Rpc(Rpc::RequestVote(vote_request.args)));
                apply_effects(&transport, &events_tx, &mut pending_votes, effects)
            }
            Some(event) = inbox.events.recv() => {
                let effects = replica.handle(event);
                apply_effects(&transport, &events_tx, &mut pending_votes, effects)
            }
            else => true,
        };
        if halt {
            log::info!(
                "replica {} (term {}, {}) stopping",
                replica.me(),
                replica.term(),
                replica.role_name()
            );
            break;
        }
    }
}

/// Performs every [`Outbound`] effect and reports whether the FSM asked to
/// halt.
fn apply_effects<T: Transport>(
    transport: &Arc<T>,
    events_tx: &mpsc::UnboundedSender<Event>,
    pending_votes: &mut HashMap<ReplicaId, oneshot::Sender<Vote>>,
    effects: Effects,
) -> bool {
    for outbound in effects.outbound {
        match outbound {
            Outbound::RequestVote { to, msg } => {
                let transport = transport.clone();
                let events_tx = events_tx.clone();
                // "An auxiliary helper performs a bounded synchronous RPC in
                // a detached task and forwards the Vote back into the FSM
                // inbox; on timeout or error, no message is posted" --
                // spec.md §6.
                tokio::spawn(async move {
                    if let Ok(vote) = transport.request_vote(to, msg).await {
                        let _ = events_tx.send(Event::Rpc(Rpc::Vote(vote)));
                    }
                });
            }
            Outbound::Vote { to, msg } => {
                if let Some(reply) = pending_votes.remove(&to) {
                    let _ = reply.send(msg);
                } else {
                    log::warn!("no pending RequestVote from {to} to answer");
                }
            }
            Outbound::AppendEntries { to, msg } => transport.send_append_entries(to, msg),
            Outbound::AppendEntriesReply { to, msg } => {
                transport.send_append_entries_reply(to, msg)
            }
        }
    }
    effects.halt
}

//! The RPC transport facade (`spec.md` §1, §6).
//!
//! `Transport` is the only thing the driver (`crate::actor`) uses to move
//! bytes between replicas; the FSM itself (`crate::fsm`) never touches it.
//! Two implementations are provided: [`grpc::GrpcTransport`] (real sockets,
//! grounded in the teacher's own `tonic`/`RaftServiceClient` usage) and
//! [`memory::ChannelTransport`] (in-process, for deterministic tests,
//! grounded in `little-raft`'s `Cluster` trait and `toydb`'s
//! `mpsc::unbounded_channel`-driven test harness).
//!
//! `AppendEntries` and `AppendEntriesReply` are genuinely fire-and-forget
//! (`spec.md` §6: "send(peer, msg) -- asynchronous; no delivery or ordering
//! guarantee"). `RequestVote` is the one exception: `spec.md` §6 describes
//! "an auxiliary helper [that] performs a bounded synchronous RPC in a
//! detached task and forwards the Vote back into the FSM inbox; on timeout
//! or error, no message is posted" -- that's exactly `Transport::request_vote`
//! here, and the driver is the "detached task" that calls it and forwards the
//! result.
//!
//! The callee side of `request_vote` never calls back out through
//! `Transport` at all: because the FSM always answers a `RequestVote` with
//! exactly one `Vote` reply in the same `handle()` call that consumed it
//! (`spec.md` §4.2), the driver can simply intercept that one outbound `Vote`
//! effect and resolve it directly against the pending RPC's reply channel,
//! with no second network hop. [`VoteRequest`] carries that reply channel
//! from a transport's inbound RPC handler into the driver.

pub mod grpc;
pub mod memory;

use crate::message::{AppendEntries, AppendEntriesReply, Event, ReplicaId, RequestVote, Vote};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

/// A `RequestVote` arriving at a replica's transport, paired with the
/// channel its `Vote` reply must be delivered through.
pub struct VoteRequest {
    pub args: RequestVote,
    pub reply: oneshot::Sender<Vote>,
}

/// The channels a driver (`crate::actor`) reads inbound traffic from.
/// A transport implementation is expected to have been configured (out of
/// band, at cluster-construction time) with the sending halves matching
/// these for every local replica it serves.
pub struct Inbox {
    pub events: mpsc::UnboundedReceiver<Event>,
    pub vote_requests: mpsc::UnboundedReceiver<VoteRequest>,
}

/// The sending halves of a replica's [`Inbox`], handed to whichever
/// transport(s) deliver traffic to it.
#[derive(Clone)]
pub struct InboxHandle {
    pub events: mpsc::UnboundedSender<Event>,
    pub vote_requests: mpsc::UnboundedSender<VoteRequest>,
}

impl InboxHandle {
    pub fn new_pair() -> (InboxHandle, Inbox) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (votes_tx, votes_rx) = mpsc::unbounded_channel();
        (
            InboxHandle {
                events: events_tx,
                vote_requests: votes_tx,
            },
            Inbox {
                events: events_rx,
                vote_requests: votes_rx,
            },
        )
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fire-and-forget. May silently drop the message.
    fn send_append_entries(&self, to: ReplicaId, msg: AppendEntries);
    /// Fire-and-forget. May silently drop the message.
    fn send_append_entries_reply(&self, to: ReplicaId, msg: AppendEntriesReply);
    /// Bounded synchronous RPC (`spec.md` §6). Returns `Err` on timeout or
    /// any transport failure; the caller posts nothing to its inbox in that
    /// case, per spec.
    async fn request_vote(&self, to: ReplicaId, msg: RequestVote) -> std::io::Result<Vote>;
}

//! An in-process `Transport`, for deterministic cluster simulation in tests.
//!
//! Grounded in `little-raft`'s `Cluster` trait and `toydb`'s tests, both of
//! which drive a simulated cluster over in-memory channels rather than real
//! sockets (`other_examples/affb3597_suzaku-little-raft__little_raft-src-replica.rs.rs`,
//! `other_examples/82c8ecf5_1660623-toydb__src-raft-node-candidate.rs.rs`).

use super::{InboxHandle, Transport, VoteRequest};
use crate::message::{AppendEntries, AppendEntriesReply, Event, ReplicaId, Rpc, RequestVote, Vote};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// A shared routing table from replica id to its inbox. Every replica in a
/// simulated cluster holds a `ChannelTransport` built from the same `routes`.
#[derive(Clone)]
pub struct ChannelTransport {
    routes: Arc<HashMap<ReplicaId, InboxHandle>>,
    /// How long `request_vote` waits before giving up on an unresponsive or
    /// unknown peer, mirroring a real bounded RPC's timeout.
    request_vote_timeout: Duration,
}

impl ChannelTransport {
    pub fn new(routes: HashMap<ReplicaId, InboxHandle>) -> Self {
        Self {
            routes: Arc::new(routes),
            request_vote_timeout: Duration::from_millis(crate::ELECTION_TIMEOUT_MIN),
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn send_append_entries(&self, to: ReplicaId, msg: AppendEntries) {
        if let Some(inbox) = self.routes.get(&to) {
            // Fire-and-forget: a full or closed channel just drops the
            // message, matching "no delivery guarantee".
            let _ = inbox.events.send(Event::Rpc(Rpc::AppendEntries(msg)));
        }
    }

    fn send_append_entries_reply(&self, to: ReplicaId, msg: AppendEntriesReply) {
        if let Some(inbox) = self.routes.get(&to) {
            let _ = inbox
                .events
                .send(Event::Rpc(Rpc::AppendEntriesReply(msg)));
        }
    }

    async fn request_vote(&self, to: ReplicaId, msg: RequestVote) -> io::Result<Vote> {
        let inbox = self
            .routes
            .get(&to)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown peer"))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        inbox
            .vote_requests
            .send(VoteRequest {
                args: msg,
                reply: reply_tx,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer inbox closed"))?;
        tokio::time::timeout(self.request_vote_timeout, reply_rx)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request_vote timed out"))?
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped reply"))
    }
}

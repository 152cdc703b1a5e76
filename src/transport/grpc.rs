//! A `tonic`/`prost` backed `Transport` (`spec.md` §6), the way the teacher
//! crate talks to its `RaftServiceClient<Channel>` in
//! `examples/YumingxuanGuo-featherkv/src/raft/mod.rs` (`solicit_votes`,
//! `send_heartbeats`). The FSM's message types (`crate::message`) never
//! appear on the wire directly; this module is the only place that converts
//! to and from the generated protobuf types.

use super::{InboxHandle, Transport, VoteRequest};
use crate::config::MembershipConfig;
use crate::message::{
    AppendEntries, AppendEntriesReply, Entry, EntryKind, Event, ReplicaId, Rpc, RequestVote, Vote,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

pub mod proto {
    tonic::include_proto!("raftcore");
}

use proto::raft_rpc_client::RaftRpcClient;
use proto::raft_rpc_server::{RaftRpc, RaftRpcServer as GeneratedServer};

fn entry_to_proto(entry: &Entry) -> proto::Entry {
    let kind = match &entry.kind {
        EntryKind::Op(cmd) => proto::entry::Kind::Op(cmd.clone()),
        EntryKind::Config(cfg) => proto::entry::Kind::Config(config_to_proto(cfg)),
    };
    proto::Entry {
        term: entry.term,
        kind: Some(kind),
    }
}

fn entry_from_proto(entry: proto::Entry) -> Option<Entry> {
    let kind = match entry.kind? {
        proto::entry::Kind::Op(cmd) => EntryKind::Op(cmd),
        proto::entry::Kind::Config(cfg) => EntryKind::Config(config_from_proto(cfg)?),
    };
    Some(Entry {
        term: entry.term,
        kind,
    })
}

fn config_to_proto(config: &MembershipConfig) -> proto::MembershipConfig {
    use proto::membership_config::Value;
    let value = match config {
        MembershipConfig::Blank => Value::Blank(proto::membership_config::Blank {}),
        MembershipConfig::Stable { old_servers } => Value::Stable(proto::membership_config::Stable {
            old_servers: old_servers.clone(),
        }),
        MembershipConfig::Transitional {
            old_servers,
            new_servers,
        } => Value::Transitional(proto::membership_config::Transitional {
            old_servers: old_servers.clone(),
            new_servers: new_servers.clone(),
        }),
    };
    proto::MembershipConfig { value: Some(value) }
}

fn config_from_proto(config: proto::MembershipConfig) -> Option<MembershipConfig> {
    use proto::membership_config::Value;
    Some(match config.value? {
        Value::Blank(_) => MembershipConfig::Blank,
        Value::Stable(s) => MembershipConfig::Stable {
            old_servers: s.old_servers,
        },
        Value::Transitional(t) => MembershipConfig::Transitional {
            old_servers: t.old_servers,
            new_servers: t.new_servers,
        },
    })
}

fn io_err(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::Other, msg.into())
}

/// Client side: one `tonic` channel per peer, connected lazily and cached.
pub struct GrpcTransport {
    endpoints: HashMap<ReplicaId, String>,
    clients: Mutex<HashMap<ReplicaId, RaftRpcClient<Channel>>>,
    request_vote_timeout: Duration,
}

impl GrpcTransport {
    pub fn new(endpoints: HashMap<ReplicaId, String>) -> Self {
        Self {
            endpoints,
            clients: Mutex::new(HashMap::new()),
            request_vote_timeout: Duration::from_millis(crate::ELECTION_TIMEOUT_MIN),
        }
    }

    async fn client_for(&self, peer: ReplicaId) -> io::Result<RaftRpcClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&peer) {
            return Ok(client.clone());
        }
        let endpoint = self
            .endpoints
            .get(&peer)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown peer"))?;
        let client = RaftRpcClient::connect(endpoint.clone())
            .await
            .map_err(|err| io_err(err.to_string()))?;
        clients.insert(peer, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    fn send_append_entries(&self, to: ReplicaId, msg: AppendEntries) {
        let envelope = proto::Envelope {
            body: Some(proto::envelope::Body::AppendEntries(proto::AppendEntriesArgs {
                term: msg.term,
                from: msg.from,
                prev_log_index: msg.prev_log_index,
                prev_log_term: msg.prev_log_term,
                entries: msg.entries.iter().map(entry_to_proto).collect(),
                commit_index: msg.commit_index,
            })),
        };
        self.deliver(to, envelope);
    }

    fn send_append_entries_reply(&self, to: ReplicaId, msg: AppendEntriesReply) {
        let envelope = proto::Envelope {
            body: Some(proto::envelope::Body::AppendEntriesReply(
                proto::AppendEntriesReplyArgs {
                    term: msg.term,
                    from: msg.from,
                    success: msg.success,
                    index: msg.index,
                },
            )),
        };
        self.deliver(to, envelope);
    }

    async fn request_vote(&self, to: ReplicaId, msg: RequestVote) -> io::Result<Vote> {
        let mut client = self.client_for(to).await?;
        let request = proto::RequestVoteArgs {
            term: msg.term,
            from: msg.from,
            last_log_index: msg.last_log_index,
            last_log_term: msg.last_log_term,
        };
        let call = client.request_vote(Request::new(request));
        let response = tokio::time::timeout(self.request_vote_timeout, call)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request_vote timed out"))?
            .map_err(|status| io_err(status.to_string()))?
            .into_inner();
        Ok(Vote {
            term: response.term,
            from: response.from,
            success: response.success,
        })
    }
}

impl GrpcTransport {
    /// Fire-and-forget delivery: the caller does not wait for (or care
    /// about) the RPC's own result.
    fn deliver(&self, to: ReplicaId, envelope: proto::Envelope) {
        let endpoints = self.endpoints.clone();
        let target = match endpoints.get(&to) {
            Some(addr) => addr.clone(),
            None => return,
        };
        tokio::spawn(async move {
            if let Ok(mut client) = RaftRpcClient::connect(target).await {
                let _ = client.deliver(Request::new(envelope)).await;
            }
        });
    }
}

/// Server side: answers `RaftRpc` for exactly one local replica by pushing
/// onto its [`InboxHandle`].
pub struct RaftRpcService {
    inbox: InboxHandle,
}

impl RaftRpcService {
    pub fn new(inbox: InboxHandle) -> GeneratedServer<Self> {
        GeneratedServer::new(Self { inbox })
    }
}

#[tonic::async_trait]
impl RaftRpc for RaftRpcService {
    async fn request_vote(
        &self,
        request: Request<proto::RequestVoteArgs>,
    ) -> Result<Response<proto::VoteReply>, Status> {
        let args = request.into_inner();
        let request_vote = RequestVote {
            term: args.term,
            from: args.from,
            last_log_index: args.last_log_index,
            last_log_term: args.last_log_term,
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inbox
            .vote_requests
            .send(VoteRequest {
                args: request_vote,
                reply: reply_tx,
            })
            .map_err(|_| Status::unavailable("replica is shutting down"))?;
        let vote = reply_rx
            .await
            .map_err(|_| Status::unavailable("replica dropped the vote request"))?;
        Ok(Response::new(proto::VoteReply {
            term: vote.term,
            from: vote.from,
            success: vote.success,
        }))
    }

    async fn deliver(
        &self,
        request: Request<proto::Envelope>,
    ) -> Result<Response<proto::Empty>, Status> {
        let envelope = request.into_inner();
        let event = match envelope.body {
            Some(proto::envelope::Body::AppendEntries(args)) => {
                let entries = args
                    .entries
                    .into_iter()
                    .map(entry_from_proto)
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| Status::invalid_argument("unrecognized entry"))?;
                Event::Rpc(Rpc::AppendEntries(AppendEntries {
                    term: args.term,
                    from: args.from,
                    prev_log_index: args.prev_log_index,
                    prev_log_term: args.prev_log_term,
                    entries,
                    commit_index: args.commit_index,
                }))
            }
            Some(proto::envelope::Body::AppendEntriesReply(args)) => {
                Event::Rpc(Rpc::AppendEntriesReply(AppendEntriesReply {
                    term: args.term,
                    from: args.from,
                    success: args.success,
                    index: args.index,
                }))
            }
            None => return Err(Status::invalid_argument("empty envelope")),
        };
        self.inbox
            .events
            .send(event)
            .map_err(|_| Status::unavailable("replica is shutting down"))?;
        Ok(Response::new(proto::Empty {}))
    }
}

//! Wire-agnostic message and event types (`spec.md` §3, §4.1).
//!
//! These are plain Rust types with no knowledge of the wire format; a
//! transport implementation (`crate::transport`) is responsible for
//! converting to and from whatever it actually puts on the network, the way
//! `examples/jteplitz602-Rusty-Raft` keeps its `RequestVoteMessage` /
//! `AppendEntriesMessage` structs separate from the capnp builders used to
//! serialize them.

use crate::config::MembershipConfig;
use tokio::sync::oneshot;

/// Every replica in a cluster is addressed by a small integer id, following
/// the teacher's `me: u64` / `peers: Vec<u64>` convention.
pub type ReplicaId = u64;

/// A single log entry (`spec.md` §3).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Entry {
    pub term: u64,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum EntryKind {
    /// An opaque client command, handed to the state machine verbatim.
    Op(Vec<u8>),
    /// A new cluster configuration, adopted at append time (`spec.md` §4.3).
    Config(MembershipConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVote {
    pub term: u64,
    pub from: ReplicaId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vote {
    pub term: u64,
    pub from: ReplicaId,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntries {
    pub term: u64,
    pub from: ReplicaId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<Entry>,
    pub commit_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub from: ReplicaId,
    pub success: bool,
    /// Present only on success: the new match index (`spec.md` §3).
    pub index: Option<u64>,
}

/// A message as delivered by the transport facade, tagged by kind. Separate
/// from `Event` so a transport only ever has to build one of these four
/// variants, regardless of how many FSM event kinds consume them.
#[derive(Debug, Clone)]
pub enum Rpc {
    RequestVote(RequestVote),
    Vote(Vote),
    AppendEntries(AppendEntries),
    AppendEntriesReply(AppendEntriesReply),
}

/// Errors handed back to a client request (`spec.md` §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientError {
    ElectionInProgress,
    Redirect(ReplicaId),
    ConfigInProgress,
    Timeout,
}

/// Successful client-facing results.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientReply {
    Op(Vec<u8>),
    Config(MembershipConfig),
}

pub type ClientResult = std::result::Result<ClientReply, ClientError>;

/// The FSM's exhaustive event vocabulary (`spec.md` §4.1).
pub enum Event {
    /// The single election/heartbeat timer expired.
    Timeout,
    /// A per-client-request timer expired (`spec.md` §4.6). The driver emits
    /// this using the timer-wheel scan described in `SPEC_FULL.md` §5 rather
    /// than scheduling an individual sleep per request.
    ClientTimeout(u64),
    Stop,
    GetLeader(oneshot::Sender<Option<ReplicaId>>),
    Rpc(Rpc),
    ClientOp(u64, Vec<u8>, oneshot::Sender<ClientResult>),
    ClientSetConfig(u64, Vec<ReplicaId>, oneshot::Sender<ClientResult>),
}

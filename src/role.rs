//! Per-role bookkeeping as a tagged variant (`spec.md` §3, §9).
//!
//! Grounded on the teacher's own `Role` enum
//! (`examples/YumingxuanGuo-featherkv/src/raft/mod.rs`), which already
//! carries `Follower { leader_seen_ticks, .. }`, `Candidate { votes, .. }` and
//! `Leader { next_index, match_index, .. }` as enum payloads rather than a
//! separate mixed-semantics map keyed by role. We follow the same shape but
//! key the per-peer maps by `ReplicaId` (`spec.md` explicitly calls for
//! peer -> bool in Candidate and peer -> match-index in Leader).

use crate::message::ReplicaId;
use std::collections::HashMap;

pub enum Role {
    Follower,
    /// `responses`: peer -> vote granted/denied, as recorded so far this
    /// election.
    Candidate { responses: HashMap<ReplicaId, bool> },
    /// `responses`: peer -> highest acknowledged match index.
    /// `followers`: peer -> next_index to send.
    Leader {
        responses: HashMap<ReplicaId, u64>,
        followers: HashMap<ReplicaId, u64>,
    },
}

impl Role {
    pub fn is_follower(&self) -> bool {
        matches!(self, Role::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Role::Candidate { .. })
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate { .. } => "candidate",
            Role::Leader { .. } => "leader",
        }
    }
}

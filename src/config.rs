//! Cluster membership configuration (`spec.md` §3, §4.5).
//!
//! Not to be confused with `crate::settings::Settings`, which is this
//! process's own bootstrap configuration (listen address, peer addresses,
//! timeout overrides). `MembershipConfig` is replicated state: it lives in
//! the log and in `Replica::config`, the way the teacher's own
//! `server::Config { cluster: HashMap<u64, SocketAddr>, .. }` holds the set of
//! servers a replica knows about, generalized here into the tagged
//! Blank/Stable/Transitional shape `spec.md` calls for.

use crate::message::ReplicaId;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MembershipConfig {
    /// No servers assigned yet.
    Blank,
    /// Normal operation.
    Stable { old_servers: Vec<ReplicaId> },
    /// Joint consensus during a membership change.
    Transitional {
        old_servers: Vec<ReplicaId>,
        new_servers: Vec<ReplicaId>,
    },
}

impl MembershipConfig {
    /// The set(s) of voters a quorum must be computed over. `Stable` has one
    /// group; `Transitional` has two, and a quorum requires a majority of
    /// each (`spec.md` §4.5, Glossary "Joint consensus").
    fn voter_groups(&self) -> Vec<&[ReplicaId]> {
        match self {
            MembershipConfig::Blank => vec![],
            MembershipConfig::Stable { old_servers } => vec![old_servers.as_slice()],
            MembershipConfig::Transitional {
                old_servers,
                new_servers,
            } => vec![old_servers.as_slice(), new_servers.as_slice()],
        }
    }

    /// All voting peers across every group, deduplicated. Used to size a
    /// Leader's `followers`/`responses` maps (`spec.md` invariant 7).
    pub fn all_voters(&self) -> Vec<ReplicaId> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for group in self.voter_groups() {
            for &id in group {
                if seen.insert(id) {
                    out.push(id);
                }
            }
        }
        out
    }
}

/// `allow_config(current, new_servers)` (`spec.md` §4.5).
pub fn allow_config(current: &MembershipConfig, new_servers: &[ReplicaId]) -> bool {
    match current {
        MembershipConfig::Blank => true,
        MembershipConfig::Stable { old_servers } => old_servers.as_slice() != new_servers,
        MembershipConfig::Transitional { .. } => false,
    }
}

/// `reconfig(current, new_servers)` (`spec.md` §4.5).
pub fn reconfig(current: &MembershipConfig, new_servers: Vec<ReplicaId>) -> MembershipConfig {
    let old_servers = match current {
        MembershipConfig::Blank => vec![],
        MembershipConfig::Stable { old_servers } => old_servers.clone(),
        MembershipConfig::Transitional { old_servers, .. } => old_servers.clone(),
    };
    MembershipConfig::Transitional {
        old_servers,
        new_servers,
    }
}

/// `quorum(config, responses)`: true iff a majority of every voter group in
/// `config` is present in `granted` (`spec.md` §4.2, used by Candidate's
/// `Vote` handling).
pub fn is_quorum(config: &MembershipConfig, granted: &[ReplicaId]) -> bool {
    let granted: std::collections::HashSet<ReplicaId> = granted.iter().copied().collect();
    let groups = config.voter_groups();
    if groups.is_empty() {
        return false;
    }
    groups.into_iter().all(|group| {
        let have = group.iter().filter(|id| granted.contains(id)).count();
        have * 2 > group.len()
    })
}

/// `quorum_min(config, responses)`: the greatest index replicated on a
/// quorum of every voter group (`spec.md` §4.4). `acked` maps peer -> highest
/// acknowledged index; `self_index` is this replica's own last log index
/// (the leader always "acks" itself).
pub fn quorum_min(
    config: &MembershipConfig,
    acked: &HashMap<ReplicaId, u64>,
    self_id: ReplicaId,
    self_index: u64,
) -> u64 {
    let groups = config.voter_groups();
    if groups.is_empty() {
        return 0;
    }
    groups
        .into_iter()
        .map(|group| {
            let mut indices: Vec<u64> = group
                .iter()
                .map(|id| {
                    if *id == self_id {
                        self_index
                    } else {
                        acked.get(id).copied().unwrap_or(0)
                    }
                })
                .collect();
            indices.sort_unstable();
            // The greatest index present on a majority is the value at the
            // position `len - majority_size`, majority_size = len/2 + 1.
            let majority_size = indices.len() / 2 + 1;
            indices[indices.len() - majority_size]
        })
        .min()
        .unwrap_or(0)
}

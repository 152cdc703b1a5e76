//! This process's own bootstrap configuration: who am I, who are my peers,
//! and (optionally) overrides for the timing constants in `spec.md` §6.
//!
//! Not to be confused with `crate::config::MembershipConfig`, the
//! replicated cluster membership. Loaded the way the teacher loads its own
//! client configuration in
//! `examples/YumingxuanGuo-featherkv/src/bin/client_db.rs`
//! (`Config::new("config/client_db.yaml")`), layering defaults, an optional
//! file, and environment variables via the `config` crate.

use crate::error::Result;
use crate::message::ReplicaId;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// This replica's own id.
    pub id: ReplicaId,
    /// peer id -> `host:port` gRPC endpoint, for every *other* replica.
    pub peers: HashMap<ReplicaId, String>,
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_client_timeout_ms")]
    pub client_timeout_ms: u64,
}

fn default_election_timeout_min_ms() -> u64 {
    crate::ELECTION_TIMEOUT_MIN
}

fn default_election_timeout_max_ms() -> u64 {
    crate::ELECTION_TIMEOUT_MAX
}

fn default_heartbeat_timeout_ms() -> u64 {
    crate::HEARTBEAT_TIMEOUT
}

fn default_client_timeout_ms() -> u64 {
    crate::CLIENT_TIMEOUT
}

impl Settings {
    /// Loads settings from (in increasing priority order) built-in defaults,
    /// an optional TOML file at `path`, and `RAFT_*`-prefixed environment
    /// variables (e.g. `RAFT_HEARTBEAT_TIMEOUT_MS=50`).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("RAFT"));
        let settings = builder.build()?;
        Ok(settings.try_deserialize()?)
    }
}

//! A Raft consensus core: a pure FSM (`fsm::Replica`) plus an async driver
//! (`actor`) that owns all I/O, the split `spec.md` §9 asks for. See
//! `SPEC_FULL.md` for the full design and `DESIGN.md` for how each module is
//! grounded in the crates this was built from.

pub mod actor;
pub mod config;
pub mod error;
pub mod fsm;
pub mod log;
pub mod message;
pub mod role;
pub mod settings;
pub mod state_machine;
pub mod transport;

/// Minimum randomized election timeout, in milliseconds (`spec.md` §6).
pub const ELECTION_TIMEOUT_MIN: u64 = 150;
/// Maximum randomized election timeout, in milliseconds (`spec.md` §6).
pub const ELECTION_TIMEOUT_MAX: u64 = 300;
/// Leader heartbeat interval, in milliseconds (`spec.md` §6).
pub const HEARTBEAT_TIMEOUT: u64 = 75;
/// How long a client request waits for its entry to commit before giving up,
/// in milliseconds (`spec.md` §6).
pub const CLIENT_TIMEOUT: u64 = 2000;

pub use actor::Handle;

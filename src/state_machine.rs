//! The applied state machine facade (`spec.md` §6).
//!
//! Minimal single-capability trait, as `spec.md` §9 asks for ("Duck-typed
//! state machine -> small interface... accept it as a trait/interface
//! parameter"); shape grounded in `little-raft`'s `StateMachine` trait
//! (`other_examples/affb3597_suzaku-little-raft__little_raft-src-replica.rs.rs`).

/// Applies committed commands. Must be deterministic (`spec.md` §6) — given
/// the same sequence of `apply` calls on every replica, every replica ends up
/// in the same state.
pub trait StateMachine: Send {
    fn apply(&mut self, cmd: &[u8]) -> Vec<u8>;
}

/// Echoes the command back as the result. Used by tests and the demo binary;
/// real callers supply their own `StateMachine`.
#[derive(Default)]
pub struct EchoStateMachine {
    pub applied: Vec<Vec<u8>>,
}

impl StateMachine for EchoStateMachine {
    fn apply(&mut self, cmd: &[u8]) -> Vec<u8> {
        self.applied.push(cmd.to_vec());
        cmd.to_vec()
    }
}

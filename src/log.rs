//! The durable log facade (`spec.md` §6) and an in-process implementation.
//!
//! The FSM depends only on the `Log` trait; persistence strategy (files,
//! `sstable`, whatever) is entirely the implementer's concern, per `spec.md`
//! §1 — it's an external collaborator. `MemoryLog` is the crate's own
//! reference implementation, good enough for tests and for a single-process
//! simulated cluster; the operation list follows `spec.md` §6 verbatim, and
//! the commit/apply split in `Replica` (see `fsm.rs`) is grounded in
//! `toydb`'s `Log` facade (`get_last`, `get_committed`, `commit`, `apply`;
//! `other_examples/82c8ecf5_1660623-toydb__src-raft-node-candidate.rs.rs`).

use crate::message::Entry;

/// Durable log operations consumed by the FSM (`spec.md` §6).
pub trait Log: Send {
    /// 0 if empty.
    fn get_last_index(&self) -> u64;
    /// 0 if empty.
    fn get_last_term(&self) -> u64;
    fn get_entry(&self, index: u64) -> Option<Entry>;
    /// 0 if `index` is out of range or 0.
    fn get_term(&self, index: u64) -> u64;
    /// Appends `entries` atomically, returning the index of the last one.
    /// If `entries` is empty, returns `get_last_index()` unchanged.
    fn append(&mut self, entries: Vec<Entry>) -> u64;
    /// Deletes all entries with index `> prev_index`.
    fn truncate(&mut self, prev_index: u64);
    fn current_term(&self) -> u64;
    fn set_current_term(&mut self, term: u64);
    fn voted_for(&self) -> Option<crate::message::ReplicaId>;
    fn set_voted_for(&mut self, voted_for: Option<crate::message::ReplicaId>);
}

/// A `Vec`-backed `Log`. Index 0 is reserved (unused); entry at position `i`
/// in the backing vec has raft index `i + 1`, matching the 1-based indexing
/// `spec.md` uses throughout (`index = 1` is the special case in §4.3).
#[derive(Default)]
pub struct MemoryLog {
    entries: Vec<Entry>,
    current_term: u64,
    voted_for: Option<crate::message::ReplicaId>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Log for MemoryLog {
    fn get_last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    fn get_last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    fn get_entry(&self, index: u64) -> Option<Entry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize).cloned()
    }

    fn get_term(&self, index: u64) -> u64 {
        self.get_entry(index).map(|e| e.term).unwrap_or(0)
    }

    fn append(&mut self, mut entries: Vec<Entry>) -> u64 {
        self.entries.append(&mut entries);
        self.get_last_index()
    }

    fn truncate(&mut self, prev_index: u64) {
        self.entries.truncate(prev_index as usize);
    }

    fn current_term(&self) -> u64 {
        self.current_term
    }

    fn set_current_term(&mut self, term: u64) {
        self.current_term = term;
    }

    fn voted_for(&self) -> Option<crate::message::ReplicaId> {
        self.voted_for
    }

    fn set_voted_for(&mut self, voted_for: Option<crate::message::ReplicaId>) {
        self.voted_for = voted_for;
    }
}

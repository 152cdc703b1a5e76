//! The per-replica consensus core (`spec.md` §3, §4).
//!
//! `Replica::handle` is a pure function: given an [`Event`] it mutates
//! `self` and the durable log, and returns an [`Effects`] describing what
//! the driver (`crate::actor`) must do (send RPCs, answer client requests).
//! No I/O happens here, per the design note in `spec.md` §9 ("expose a
//! single `step(event) -> (new_state, outbox, timer_directive)` function and
//! keep all I/O outside it"); the one exception — sending on an already-owned
//! `oneshot::Sender` handed to us by a client request or `GetLeader` call —
//! is itself non-blocking local delivery, not real I/O, the same way
//! `client_reqs` entries carry their own reply handle in `spec.md` §3.
//!
//! Timer bookkeeping lives directly on `Replica` (`timer_start`,
//! `timer_duration`, per `spec.md` §3) rather than in `Effects`: every
//! handler either calls `reset_timer` or leaves those fields untouched
//! ("preserves the remaining time", `spec.md` §5), and the driver simply
//! re-reads `timer_deadline()` after each event.

use crate::config::{self, MembershipConfig};
use crate::log::Log;
use crate::message::{
    AppendEntries, AppendEntriesReply, ClientError, ClientReply, ClientResult, Entry, EntryKind,
    Event, ReplicaId, RequestVote, Rpc, Vote,
};
use crate::role::Role;
use crate::state_machine::StateMachine;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// An outbound RPC a handler wants sent. The driver owns the `Transport` and
/// performs the actual send.
#[derive(Debug)]
pub enum Outbound {
    RequestVote { to: ReplicaId, msg: RequestVote },
    Vote { to: ReplicaId, msg: Vote },
    AppendEntries { to: ReplicaId, msg: AppendEntries },
    AppendEntriesReply { to: ReplicaId, msg: AppendEntriesReply },
}

/// What `Replica::handle` produces for the driver to act on.
#[derive(Debug, Default)]
pub struct Effects {
    pub outbound: Vec<Outbound>,
    /// Set when the FSM has processed `Event::Stop`; the driver should exit
    /// its loop after performing any remaining `outbound` effects.
    pub halt: bool,
}

impl Effects {
    fn new() -> Self {
        Self::default()
    }
}

/// A client request awaiting commit (`spec.md` §3 "client_reqs"). Held in a
/// `VecDeque` ordered by deadline: since every request uses the same fixed
/// `CLIENT_TIMEOUT`, deadlines are created in non-decreasing order, so the
/// deque is already a timer wheel with no extra bookkeeping (`SPEC_FULL.md`
/// §5).
struct ClientReqEntry {
    id: u64,
    reply: oneshot::Sender<ClientResult>,
    log_index: u64,
    #[allow(dead_code)] // kept per spec.md §3's data model; not read directly, term is implied by log_index
    term: u64,
    deadline: Instant,
}

/// One replica's consensus state (`spec.md` §3).
pub struct Replica<L: Log, M: StateMachine> {
    me: ReplicaId,
    peers: Vec<ReplicaId>,
    term: u64,
    voted_for: Option<ReplicaId>,
    leader: Option<ReplicaId>,
    role: Role,
    commit_index: u64,
    client_reqs: std::collections::VecDeque<ClientReqEntry>,
    config: MembershipConfig,
    timer_start: Instant,
    timer_duration: Duration,
    log: L,
    state_machine: M,
}

fn granted_peers(responses: &HashMap<ReplicaId, bool>) -> Vec<ReplicaId> {
    responses
        .iter()
        .filter(|(_, granted)| **granted)
        .map(|(id, _)| *id)
        .collect()
}

impl<L: Log, M: StateMachine> Replica<L, M> {
    /// Starts a fresh (or recovering) replica. On restart, `log` already
    /// holds the persisted `current_term`/`voted_for`/entries (`spec.md`
    /// §7); we just mirror them into memory and begin as Follower with a
    /// freshly randomized election timeout.
    pub fn new(
        me: ReplicaId,
        peers: Vec<ReplicaId>,
        config: MembershipConfig,
        log: L,
        state_machine: M,
    ) -> Self {
        let term = log.current_term();
        let voted_for = log.voted_for();
        let mut replica = Replica {
            me,
            peers,
            term,
            voted_for,
            leader: None,
            role: Role::Follower,
            commit_index: 0,
            client_reqs: std::collections::VecDeque::new(),
            config,
            timer_start: Instant::now(),
            timer_duration: Duration::from_millis(0),
            log,
            state_machine,
        };
        replica.reset_timer(replica.random_election_timeout());
        replica
    }

    pub fn me(&self) -> ReplicaId {
        self.me
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn leader(&self) -> Option<ReplicaId> {
        self.leader
    }

    pub fn role_name(&self) -> &'static str {
        self.role.name()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    pub fn timer_deadline(&self) -> Instant {
        self.timer_start + self.timer_duration
    }

    /// Soonest deadline among outstanding client requests, and the id that
    /// will expire then -- the timer-wheel peek the driver polls to know
    /// when to synthesize `Event::ClientTimeout`.
    pub fn next_client_deadline(&self) -> Option<(Instant, u64)> {
        self.client_reqs.front().map(|req| (req.deadline, req.id))
    }

    fn reset_timer(&mut self, duration: Duration) {
        self.timer_start = Instant::now();
        self.timer_duration = duration;
    }

    fn random_election_timeout(&self) -> Duration {
        let millis = rand::thread_rng()
            .gen_range(crate::ELECTION_TIMEOUT_MIN..crate::ELECTION_TIMEOUT_MAX);
        Duration::from_millis(millis)
    }

    // ---- dispatch -------------------------------------------------------

    pub fn handle(&mut self, event: Event) -> Effects {
        match event {
            Event::Stop => {
                let mut effects = Effects::new();
                effects.halt = true;
                effects
            }
            Event::GetLeader(reply) => {
                let _ = reply.send(self.leader);
                Effects::new()
            }
            Event::ClientTimeout(id) => self.handle_client_timeout(id),
            Event::Timeout => match self.role {
                Role::Follower => self.follower_timeout(),
                Role::Candidate { .. } => self.candidate_timeout(),
                Role::Leader { .. } => self.leader_timeout(),
            },
            Event::Rpc(rpc) => match self.role {
                Role::Follower => self.follower_rpc(rpc),
                Role::Candidate { .. } => self.candidate_rpc(rpc),
                Role::Leader { .. } => self.leader_rpc(rpc),
            },
            Event::ClientOp(id, cmd, reply) => {
                if self.role.is_leader() {
                    self.leader_client_op(id, cmd, reply)
                } else {
                    self.reject_client(reply)
                }
            }
            Event::ClientSetConfig(id, new_servers, reply) => {
                if self.role.is_leader() {
                    self.leader_client_set_config(id, new_servers, reply)
                } else {
                    self.reject_client(reply)
                }
            }
        }
    }

    fn reject_client(&self, reply: oneshot::Sender<ClientResult>) -> Effects {
        let err = match self.leader {
            Some(leader) => ClientError::Redirect(leader),
            None => ClientError::ElectionInProgress,
        };
        let _ = reply.send(Err(err));
        Effects::new()
    }

    fn handle_client_timeout(&mut self, id: u64) -> Effects {
        if let Some(pos) = self.client_reqs.iter().position(|req| req.id == id) {
            // Cancellation may race a commit that already removed this
            // entry; "not found" is a no-op (spec.md §5).
            let req = self.client_reqs.remove(pos).unwrap();
            let _ = req.reply.send(Err(ClientError::Timeout));
        }
        Effects::new()
    }

    // ---- term catch-up & role transitions --------------------------------

    /// `spec.md` §4.1's term-catch-up rule: clears `voted_for`, drops to
    /// Follower, and arms a fresh election timeout. Mirrors the teacher's
    /// own `become_follower`.
    fn step_down(&mut self, new_term: u64) {
        debug_assert!(new_term >= self.term);
        self.term = new_term;
        self.log.set_current_term(new_term);
        self.voted_for = None;
        self.log.set_voted_for(None);
        self.leader = None;
        self.role = Role::Follower;
        self.reset_timer(self.random_election_timeout());
        log::info!("term {}: stepping down to follower", self.term);
    }

    fn start_election(&mut self) -> Effects {
        debug_assert!(self.role.is_follower() || self.role.is_candidate());
        self.term += 1;
        self.log.set_current_term(self.term);
        self.voted_for = Some(self.me);
        self.log.set_voted_for(Some(self.me));
        self.leader = None;
        let mut responses = HashMap::new();
        responses.insert(self.me, true);
        self.role = Role::Candidate { responses };
        self.reset_timer(self.random_election_timeout());
        log::info!("term {}: became candidate", self.term);

        let mut effects = Effects::new();
        let last_log_index = self.log.get_last_index();
        let last_log_term = self.log.get_last_term();
        for &peer in &self.peers {
            effects.outbound.push(Outbound::RequestVote {
                to: peer,
                msg: RequestVote {
                    term: self.term,
                    from: self.me,
                    last_log_index,
                    last_log_term,
                },
            });
        }
        // Single-node clusters (spec.md §8 scenario 1) win immediately: a
        // quorum of {me} is just {me}.
        if config::is_quorum(&self.config, &[self.me]) {
            self.finish_become_leader(&mut effects);
        }
        effects
    }

    fn finish_become_leader(&mut self, effects: &mut Effects) {
        debug_assert!(self.role.is_candidate());
        let last_index = self.log.get_last_index();
        let mut followers = HashMap::new();
        for voter in self.config.all_voters() {
            if voter != self.me {
                followers.insert(voter, last_index + 1);
            }
        }
        self.role = Role::Leader {
            responses: HashMap::new(),
            followers,
        };
        self.leader = Some(self.me);
        log::info!("term {}: became leader", self.term);

        // A single-voter config (spec.md §8 scenario 1) is a quorum of one:
        // nothing will ever call back in from an AppendEntriesReply, so any
        // already-appended current-term entry needs a check right here.
        self.try_advance_commit(effects);

        // "set heartbeat timer to zero (so the next loop sends immediate
        // heartbeats)" -- spec.md §4.1.
        self.reset_timer(Duration::from_millis(0));
    }

    // ---- Follower ---------------------------------------------------------

    fn follower_timeout(&mut self) -> Effects {
        self.start_election()
    }

    fn follower_rpc(&mut self, rpc: Rpc) -> Effects {
        match rpc {
            Rpc::Vote(_) | Rpc::AppendEntriesReply(_) => Effects::new(),
            Rpc::RequestVote(rv) => self.vote(rv),
            Rpc::AppendEntries(ae) => self.follower_append_entries(ae),
        }
    }

    fn follower_append_entries(&mut self, ae: AppendEntries) -> Effects {
        if ae.term < self.term {
            let mut effects = Effects::new();
            effects.outbound.push(Outbound::AppendEntriesReply {
                to: ae.from,
                msg: AppendEntriesReply {
                    term: self.term,
                    from: self.me,
                    success: false,
                    index: None,
                },
            });
            return effects;
        }
        if ae.term > self.term {
            self.step_down(ae.term);
        }
        self.reset_timer(self.random_election_timeout());
        self.consistency_check_and_append(ae)
    }

    /// `spec.md` §4.3's follower consistency check and append.
    fn consistency_check_and_append(&mut self, ae: AppendEntries) -> Effects {
        let passes = if ae.prev_log_index == 0 {
            true
        } else {
            self.log
                .get_entry(ae.prev_log_index)
                .map(|entry| entry.term == ae.prev_log_term)
                .unwrap_or(false)
        };
        let mut effects = Effects::new();
        if !passes {
            effects.outbound.push(Outbound::AppendEntriesReply {
                to: ae.from,
                msg: AppendEntriesReply {
                    term: self.term,
                    from: self.me,
                    success: false,
                    index: None,
                },
            });
            return effects;
        }

        self.log.truncate(ae.prev_log_index);
        let last_index = self.log.append(ae.entries.clone());
        if let Some(last_config) = ae.entries.iter().rev().find_map(|e| match &e.kind {
            EntryKind::Config(cfg) => Some(cfg.clone()),
            _ => None,
        }) {
            self.config = last_config;
        }
        let new_commit = ae.commit_index.min(last_index);
        if new_commit > self.commit_index {
            self.commit_entries(new_commit, &mut effects);
        }
        self.leader = Some(ae.from);
        effects.outbound.push(Outbound::AppendEntriesReply {
            to: ae.from,
            msg: AppendEntriesReply {
                term: self.term,
                from: self.me,
                success: true,
                index: Some(last_index),
            },
        });
        effects
    }

    // ---- voting (spec.md §4.2) ---------------------------------------------

    fn candidate_log_is_up_to_date(&self, candidate_last_term: u64, candidate_last_index: u64) -> bool {
        let our_last_term = self.log.get_last_term();
        let our_last_index = self.log.get_last_index();
        candidate_last_term > our_last_term
            || (candidate_last_term == our_last_term && candidate_last_index >= our_last_index)
    }

    fn vote(&mut self, rv: RequestVote) -> Effects {
        if rv.term > self.term {
            self.step_down(rv.term);
        }
        if rv.term < self.term {
            let mut effects = Effects::new();
            effects.outbound.push(Outbound::Vote {
                to: rv.from,
                msg: Vote {
                    term: self.term,
                    from: self.me,
                    success: false,
                },
            });
            return effects;
        }
        let may_grant = self.voted_for.is_none() || self.voted_for == Some(rv.from);
        let up_to_date = self.candidate_log_is_up_to_date(rv.last_log_term, rv.last_log_index);
        let mut effects = Effects::new();
        if may_grant && up_to_date {
            self.voted_for = Some(rv.from);
            self.log.set_voted_for(Some(rv.from));
            self.log.set_current_term(self.term);
            self.reset_timer(self.random_election_timeout());
            effects.outbound.push(Outbound::Vote {
                to: rv.from,
                msg: Vote {
                    term: self.term,
                    from: self.me,
                    success: true,
                },
            });
        } else {
            effects.outbound.push(Outbound::Vote {
                to: rv.from,
                msg: Vote {
                    term: self.term,
                    from: self.me,
                    success: false,
                },
            });
        }
        effects
    }

    // ---- Candidate ----------------------------------------------------------

    fn candidate_timeout(&mut self) -> Effects {
        // Not explicitly itemized in spec.md §4.1's Candidate bullets, but
        // required for liveness: an election that doesn't reach quorum
        // before its own timeout must restart with a fresh term, the same
        // way the teacher's Candidate role regenerates `election_timeout`
        // and the `toydb` reference candidate's `tick()` starts a new
        // election on expiry.
        self.start_election()
    }

    fn candidate_rpc(&mut self, rpc: Rpc) -> Effects {
        match rpc {
            Rpc::Vote(v) => self.candidate_handle_vote(v),
            Rpc::RequestVote(rv) => {
                if rv.term > self.term {
                    self.step_down(rv.term);
                    self.vote(rv)
                } else {
                    let mut effects = Effects::new();
                    effects.outbound.push(Outbound::Vote {
                        to: rv.from,
                        msg: Vote {
                            term: self.term,
                            from: self.me,
                            success: false,
                        },
                    });
                    effects
                }
            }
            Rpc::AppendEntries(ae) => {
                if ae.term >= self.term {
                    // spec.md §9 Open Question #1: drop the message after
                    // stepping down; we rely on the leader's heartbeat retry.
                    self.step_down(ae.term.max(self.term));
                    Effects::new()
                } else {
                    Effects::new()
                }
            }
            Rpc::AppendEntriesReply(_) => Effects::new(),
        }
    }

    fn candidate_handle_vote(&mut self, v: Vote) -> Effects {
        if !v.success && v.term > self.term {
            self.step_down(v.term);
            return Effects::new();
        }
        if v.term < self.term {
            return Effects::new();
        }
        let mut effects = Effects::new();
        let mut just_won = false;
        if let Role::Candidate { responses } = &mut self.role {
            responses.insert(v.from, v.success);
            if v.success && config::is_quorum(&self.config, &granted_peers(responses)) {
                just_won = true;
            }
        }
        if just_won {
            self.finish_become_leader(&mut effects);
        }
        effects
    }

    // ---- Leader ---------------------------------------------------------

    fn leader_timeout(&mut self) -> Effects {
        let mut effects = Effects::new();
        self.send_entry_to_all(&mut effects);
        self.reset_timer(Duration::from_millis(crate::HEARTBEAT_TIMEOUT));
        effects
    }

    fn leader_rpc(&mut self, rpc: Rpc) -> Effects {
        match rpc {
            Rpc::AppendEntriesReply(rep) => self.leader_handle_append_entries_reply(rep),
            Rpc::Vote(_) => Effects::new(),
            Rpc::RequestVote(rv) => {
                if rv.term > self.term {
                    self.step_down(rv.term);
                    self.vote(rv)
                } else {
                    let mut effects = Effects::new();
                    effects.outbound.push(Outbound::Vote {
                        to: rv.from,
                        msg: Vote {
                            term: self.term,
                            from: self.me,
                            success: false,
                        },
                    });
                    effects
                }
            }
            Rpc::AppendEntries(ae) => {
                if ae.term > self.term {
                    self.step_down(ae.term);
                    return Effects::new();
                }
                // `ae.term == self.term` can't happen under a correctly
                // operating cluster (spec.md §8 invariant 5: at most one
                // Leader per term); treat it the same as a stale message
                // rather than guessing at unspecified behavior.
                let mut effects = Effects::new();
                effects.outbound.push(Outbound::AppendEntriesReply {
                    to: ae.from,
                    msg: AppendEntriesReply {
                        term: self.term,
                        from: self.me,
                        success: false,
                        index: None,
                    },
                });
                effects
            }
        }
    }

    fn leader_handle_append_entries_reply(&mut self, rep: AppendEntriesReply) -> Effects {
        if rep.term > self.term {
            self.step_down(rep.term);
            return Effects::new();
        }
        if !rep.success {
            // spec.md §9 Open Question #2: only probe backwards on a
            // current-term reply; a stale-term failure tells us nothing
            // about the present log.
            if rep.term == self.term {
                if let Role::Leader { followers, .. } = &mut self.role {
                    if let Some(next) = followers.get_mut(&rep.from) {
                        *next = next.saturating_sub(1).max(1);
                    }
                }
                let mut effects = Effects::new();
                self.send_entry(rep.from, &mut effects);
                return effects;
            }
            return Effects::new();
        }
        if rep.term < self.term {
            return Effects::new();
        }
        let index = match rep.index {
            Some(index) => index,
            None => return Effects::new(),
        };
        let mut effects = Effects::new();
        let mut updated = false;
        if let Role::Leader {
            responses,
            followers,
        } = &mut self.role
        {
            let prior = responses.get(&rep.from).copied().unwrap_or(0);
            if index > prior {
                responses.insert(rep.from, index);
                updated = true;
            }
            if let Some(next) = followers.get_mut(&rep.from) {
                *next += 1;
            }
        }
        if updated {
            self.try_advance_commit(&mut effects);
        }
        self.send_entry(rep.from, &mut effects);
        effects
    }

    fn leader_client_op(&mut self, id: u64, cmd: Vec<u8>, reply: oneshot::Sender<ClientResult>) -> Effects {
        let index = self.log.append(vec![Entry {
            term: self.term,
            kind: EntryKind::Op(cmd),
        }]);
        self.register_client_req(id, reply, index);
        let mut effects = Effects::new();
        self.try_advance_commit(&mut effects);
        self.send_entry_to_all(&mut effects);
        effects
    }

    fn leader_client_set_config(
        &mut self,
        id: u64,
        new_servers: Vec<ReplicaId>,
        reply: oneshot::Sender<ClientResult>,
    ) -> Effects {
        if !config::allow_config(&self.config, &new_servers) {
            let _ = reply.send(Err(ClientError::ConfigInProgress));
            return Effects::new();
        }
        let transitional = config::reconfig(&self.config, new_servers);
        let index = self.log.append(vec![Entry {
            term: self.term,
            kind: EntryKind::Config(transitional.clone()),
        }]);
        // Configuration changes are visible as soon as they're appended, not
        // just once committed (spec.md §4.3 step 3), for the leader's own
        // append exactly as for a follower's.
        self.config = transitional;
        self.sync_followers_with_config();
        self.register_client_req(id, reply, index);
        let mut effects = Effects::new();
        self.try_advance_commit(&mut effects);
        self.send_entry_to_all(&mut effects);
        effects
    }

    fn register_client_req(&mut self, id: u64, reply: oneshot::Sender<ClientResult>, index: u64) {
        let deadline = Instant::now() + Duration::from_millis(crate::CLIENT_TIMEOUT);
        self.client_reqs.push_back(ClientReqEntry {
            id,
            reply,
            log_index: index,
            term: self.term,
            deadline,
        });
    }

    fn sync_followers_with_config(&mut self) {
        let last_index = self.log.get_last_index();
        let voters: std::collections::HashSet<ReplicaId> =
            self.config.all_voters().into_iter().collect();
        if let Role::Leader {
            followers,
            responses,
        } = &mut self.role
        {
            followers.retain(|id, _| voters.contains(id));
            responses.retain(|id, _| voters.contains(id));
            for voter in &voters {
                if *voter != self.me {
                    followers.entry(*voter).or_insert(last_index + 1);
                }
            }
        }
    }

    fn build_append_entries(&self, next_index: u64) -> AppendEntries {
        let index = next_index;
        let prev_log_index = index.saturating_sub(1);
        let prev_log_term = if index <= 1 {
            0
        } else {
            self.log.get_term(prev_log_index)
        };
        let entries = match self.log.get_entry(index) {
            Some(entry) => vec![entry],
            None => vec![],
        };
        AppendEntries {
            term: self.term,
            from: self.me,
            prev_log_index,
            prev_log_term,
            entries,
            commit_index: self.commit_index,
        }
    }

    fn send_entry(&mut self, peer: ReplicaId, effects: &mut Effects) {
        let next_index = match &self.role {
            Role::Leader { followers, .. } => followers.get(&peer).copied(),
            _ => None,
        };
        let next_index = match next_index {
            Some(next_index) => next_index,
            None => return,
        };
        let msg = self.build_append_entries(next_index);
        effects.outbound.push(Outbound::AppendEntries { to: peer, msg });
    }

    fn send_entry_to_all(&mut self, effects: &mut Effects) {
        let peers: Vec<ReplicaId> = match &self.role {
            Role::Leader { followers, .. } => followers.keys().copied().collect(),
            _ => vec![],
        };
        for peer in peers {
            self.send_entry(peer, effects);
        }
    }

    fn try_advance_commit(&mut self, effects: &mut Effects) {
        let m = match &self.role {
            Role::Leader { responses, .. } => {
                config::quorum_min(&self.config, responses, self.me, self.log.get_last_index())
            }
            _ => return,
        };
        if m > self.commit_index && self.log.get_term(m) == self.term {
            self.commit_entries(m, effects);
        }
    }

    /// `spec.md` §4.4: applies indexes `commit_index+1 ..= new_commit` in
    /// order, updating `commit_index` before running any nested effect
    /// (config stabilization) so a re-entrant `try_advance_commit` call from
    /// within it sees this index as already committed and doesn't replay it.
    fn commit_entries(&mut self, new_commit: u64, effects: &mut Effects) {
        let mut idx = self.commit_index + 1;
        while idx <= new_commit {
            let entry = match self.log.get_entry(idx) {
                Some(entry) => entry,
                None => break,
            };
            self.commit_index = idx;
            let reply_payload = match &entry.kind {
                EntryKind::Op(cmd) => Some(ClientReply::Op(self.state_machine.apply(cmd))),
                EntryKind::Config(MembershipConfig::Stable { old_servers }) => {
                    Some(ClientReply::Config(MembershipConfig::Stable {
                        old_servers: old_servers.clone(),
                    }))
                }
                EntryKind::Config(MembershipConfig::Transitional { new_servers, .. }) => {
                    if self.role.is_leader() {
                        self.stabilize_config(idx, new_servers.clone(), effects);
                    }
                    None
                }
                EntryKind::Config(MembershipConfig::Blank) => None,
            };
            if self.role.is_leader() {
                if let Some(pos) = self.client_reqs.iter().position(|req| req.log_index == idx) {
                    if let Some(payload) = reply_payload {
                        let req = self.client_reqs.remove(pos).unwrap();
                        let _ = req.reply.send(Ok(payload));
                    }
                }
            }
            idx += 1;
        }
    }

    /// Appends the follow-up `Stable` entry once a `Transitional` entry
    /// commits (spec.md §4.4), and reassigns any client request still
    /// waiting on the `Transitional` entry's index so it's answered with the
    /// new stable configuration instead ("The client reply for the original
    /// set_config is the new stable config value").
    fn stabilize_config(&mut self, transitional_index: u64, new_servers: Vec<ReplicaId>, effects: &mut Effects) {
        let stable = MembershipConfig::Stable {
            old_servers: new_servers,
        };
        let stable_index = self.log.append(vec![Entry {
            term: self.term,
            kind: EntryKind::Config(stable.clone()),
        }]);
        self.config = stable;
        self.sync_followers_with_config();
        if let Some(req) = self
            .client_reqs
            .iter_mut()
            .find(|req| req.log_index == transitional_index)
        {
            req.log_index = stable_index;
        }
        self.try_advance_commit(effects);
        self.send_entry_to_all(effects);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;
    use crate::message::ClientError;
    use crate::state_machine::EchoStateMachine;

    fn replica(me: ReplicaId, peers: Vec<ReplicaId>, voters: Vec<ReplicaId>) -> Replica<MemoryLog, EchoStateMachine> {
        Replica::new(
            me,
            peers,
            MembershipConfig::Stable { old_servers: voters },
            MemoryLog::new(),
            EchoStateMachine::default(),
        )
    }

    fn outbound_votes(effects: &Effects) -> Vec<&Vote> {
        effects
            .outbound
            .iter()
            .filter_map(|o| match o {
                Outbound::Vote { msg, .. } => Some(msg),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_node_cluster_becomes_leader_on_first_timeout() {
        let mut r = replica(1, vec![], vec![1]);
        let effects = r.handle(Event::Timeout);
        assert!(r.role.is_leader());
        assert_eq!(r.term(), 1);
        assert!(effects.outbound.is_empty());
    }

    #[test]
    fn follower_grants_vote_to_up_to_date_candidate() {
        let mut r = replica(1, vec![2], vec![1, 2]);
        let effects = r.handle(Event::Rpc(Rpc::RequestVote(RequestVote {
            term: 1,
            from: 2,
            last_log_index: 0,
            last_log_term: 0,
        })));
        let votes = outbound_votes(&effects);
        assert_eq!(votes.len(), 1);
        assert!(votes[0].success);
        assert_eq!(r.voted_for, Some(2));
    }

    #[test]
    fn follower_denies_second_vote_in_same_term() {
        let mut r = replica(1, vec![2, 3], vec![1, 2, 3]);
        r.handle(Event::Rpc(Rpc::RequestVote(RequestVote {
            term: 1,
            from: 2,
            last_log_index: 0,
            last_log_term: 0,
        })));
        let effects = r.handle(Event::Rpc(Rpc::RequestVote(RequestVote {
            term: 1,
            from: 3,
            last_log_index: 0,
            last_log_term: 0,
        })));
        let votes = outbound_votes(&effects);
        assert_eq!(votes.len(), 1);
        assert!(!votes[0].success);
    }

    #[test]
    fn follower_denies_candidate_with_stale_log() {
        let mut r = replica(1, vec![2], vec![1, 2]);
        r.log.append(vec![Entry {
            term: 5,
            kind: EntryKind::Op(vec![]),
        }]);
        let effects = r.handle(Event::Rpc(Rpc::RequestVote(RequestVote {
            term: 5,
            from: 2,
            last_log_index: 0,
            last_log_term: 0,
        })));
        let votes = outbound_votes(&effects);
        assert_eq!(votes.len(), 1);
        assert!(!votes[0].success);
    }

    #[test]
    fn candidate_steps_down_on_current_term_append_entries() {
        let mut r = replica(1, vec![2, 3], vec![1, 2, 3]);
        r.handle(Event::Timeout); // -> candidate, term 1
        assert!(r.role.is_candidate());
        r.handle(Event::Rpc(Rpc::AppendEntries(AppendEntries {
            term: 1,
            from: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            commit_index: 0,
        })));
        assert!(r.role.is_follower());
        assert_eq!(r.leader, None);
    }

    #[test]
    fn candidate_becomes_leader_after_majority_votes() {
        let mut r = replica(1, vec![2, 3], vec![1, 2, 3]);
        r.handle(Event::Timeout); // term 1, candidate, self-vote recorded
        let effects = r.handle(Event::Rpc(Rpc::Vote(Vote {
            term: 1,
            from: 2,
            success: true,
        })));
        assert!(r.role.is_leader());
        // becoming leader arms a zero-delay heartbeat, not an immediate send.
        assert!(effects.outbound.is_empty());
    }

    #[tokio::test]
    async fn leader_commits_client_op_after_quorum_ack() {
        let mut r = replica(1, vec![2, 3], vec![1, 2, 3]);
        r.handle(Event::Timeout);
        r.handle(Event::Rpc(Rpc::Vote(Vote {
            term: 1,
            from: 2,
            success: true,
        })));
        assert!(r.role.is_leader());
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        r.handle(Event::ClientOp(7, b"hello".to_vec(), reply_tx));
        // index 1, 2-of-3 quorum: one follower ack alone isn't enough yet.
        assert_eq!(r.commit_index(), 0);

        r.handle(Event::Rpc(Rpc::AppendEntriesReply(AppendEntriesReply {
            term: 1,
            from: 2,
            success: true,
            index: Some(1),
        })));
        assert_eq!(r.commit_index(), 1);
        let result = reply_rx.await.expect("leader replies to the caller");
        assert_eq!(result, Ok(ClientReply::Op(b"hello".to_vec())));
    }

    #[tokio::test]
    async fn single_node_leader_commits_client_op_without_any_reply() {
        let mut r = replica(1, vec![], vec![1]);
        r.handle(Event::Timeout);
        assert!(r.role.is_leader());
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        r.handle(Event::ClientOp(1, b"hello".to_vec(), reply_tx));
        // No peers exist to send an AppendEntriesReply; the leader's own
        // log growth alone must drive the commit check.
        assert_eq!(r.commit_index(), 1);
        let result = reply_rx.await.expect("leader replies to the caller");
        assert_eq!(result, Ok(ClientReply::Op(b"hello".to_vec())));
    }

    #[test]
    fn leader_rejects_set_config_while_reconfiguration_in_flight() {
        let mut r = replica(1, vec![2, 3], vec![1, 2, 3]);
        r.handle(Event::Timeout);
        r.handle(Event::Rpc(Rpc::Vote(Vote {
            term: 1,
            from: 2,
            success: true,
        })));
        let (tx1, _rx1) = tokio::sync::oneshot::channel();
        r.handle(Event::ClientSetConfig(1, vec![1, 2, 3, 4], tx1));
        let (tx2, rx2) = tokio::sync::oneshot::channel();
        r.handle(Event::ClientSetConfig(2, vec![1, 2], tx2));
        assert_eq!(rx2.try_recv(), Ok(Err(ClientError::ConfigInProgress)));
    }

    #[test]
    fn follower_redirects_client_ops_to_known_leader() {
        let mut r = replica(1, vec![2], vec![1, 2]);
        r.handle(Event::Rpc(Rpc::AppendEntries(AppendEntries {
            term: 1,
            from: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            commit_index: 0,
        })));
        assert_eq!(r.leader(), Some(2));
        let (tx, rx) = tokio::sync::oneshot::channel();
        r.handle(Event::ClientOp(1, vec![], tx));
        assert_eq!(rx.try_recv(), Ok(Err(ClientError::Redirect(2))));
    }

    #[test]
    fn client_timeout_answers_pending_request_once() {
        let mut r = replica(1, vec![2, 3], vec![1, 2, 3]);
        r.handle(Event::Timeout);
        r.handle(Event::Rpc(Rpc::Vote(Vote {
            term: 1,
            from: 2,
            success: true,
        })));
        let (tx, rx) = tokio::sync::oneshot::channel();
        r.handle(Event::ClientOp(42, vec![], tx));
        r.handle(Event::ClientTimeout(42));
        assert_eq!(rx.try_recv(), Ok(Err(ClientError::Timeout)));
        // a second timeout for the same (already-removed) id is a no-op.
        let effects = r.handle(Event::ClientTimeout(42));
        assert!(effects.outbound.is_empty());
    }

    #[test]
    fn leader_steps_down_on_append_entries_from_newer_term() {
        let mut r = replica(1, vec![2, 3], vec![1, 2, 3]);
        r.handle(Event::Timeout);
        r.handle(Event::Rpc(Rpc::Vote(Vote {
            term: 1,
            from: 2,
            success: true,
        })));
        assert!(r.role.is_leader());
        r.handle(Event::Rpc(Rpc::AppendEntries(AppendEntries {
            term: 5,
            from: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            commit_index: 0,
        })));
        assert!(r.role.is_follower());
        assert_eq!(r.term(), 5);
        assert_eq!(r.leader(), None);
    }

    #[test]
    fn follower_rejects_stale_append_entries_with_its_own_term() {
        let mut r = replica(2, vec![1], vec![1, 2]);
        r.handle(Event::Rpc(Rpc::AppendEntries(AppendEntries {
            term: 5,
            from: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            commit_index: 0,
        })));
        assert_eq!(r.term(), 5);
        let effects = r.handle(Event::Rpc(Rpc::AppendEntries(AppendEntries {
            term: 3,
            from: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            commit_index: 0,
        })));
        let reply = effects
            .outbound
            .iter()
            .find_map(|o| match o {
                Outbound::AppendEntriesReply { msg, .. } => Some(msg),
                _ => None,
            })
            .expect("a reply is sent for a stale AppendEntries");
        assert!(!reply.success);
        assert_eq!(reply.term, 5);
        // B didn't step down: its own term is still ahead of the stale message.
        assert_eq!(r.term(), 5);
    }

    #[test]
    fn leader_repairs_divergent_follower_log_by_backing_off_next_index() {
        let mut leader = replica(1, vec![2], vec![1, 2]);
        leader.log.append(vec![
            Entry { term: 1, kind: EntryKind::Op(vec![]) }, // index 1
            Entry { term: 1, kind: EntryKind::Op(vec![]) }, // index 2
            Entry { term: 1, kind: EntryKind::Op(vec![]) }, // index 3
            Entry { term: 3, kind: EntryKind::Op(vec![]) }, // index 4
            Entry { term: 3, kind: EntryKind::Op(vec![]) }, // index 5
        ]);
        leader.term = 3;
        leader.log.set_current_term(3);
        let mut followers = HashMap::new();
        followers.insert(2, leader.log.get_last_index() + 1);
        leader.role = Role::Leader {
            responses: HashMap::new(),
            followers,
        };
        leader.leader = Some(1);

        let mut follower = replica(2, vec![1], vec![1, 2]);
        follower.log.append(vec![
            Entry { term: 1, kind: EntryKind::Op(vec![]) },
            Entry { term: 1, kind: EntryKind::Op(vec![]) },
            Entry { term: 1, kind: EntryKind::Op(vec![]) },
            Entry { term: 2, kind: EntryKind::Op(vec![]) }, // diverges at index 4
        ]);
        follower.term = 3;
        follower.log.set_current_term(3);

        let mut initial = Effects::new();
        leader.send_entry(2, &mut initial);
        let mut pending = initial.outbound.into_iter().find_map(|o| match o {
            Outbound::AppendEntries { msg, .. } => Some(msg),
            _ => None,
        });
        for _ in 0..6 {
            let ae = match pending.take() {
                Some(ae) => ae,
                None => break,
            };
            let follower_effects = follower.handle(Event::Rpc(Rpc::AppendEntries(ae)));
            let reply = follower_effects
                .outbound
                .into_iter()
                .find_map(|o| match o {
                    Outbound::AppendEntriesReply { msg, .. } => Some(msg),
                    _ => None,
                })
                .expect("follower always replies to AppendEntries");
            let leader_effects = leader.handle(Event::Rpc(Rpc::AppendEntriesReply(reply)));
            pending = leader_effects.outbound.into_iter().find_map(|o| match o {
                Outbound::AppendEntries { msg, .. } => Some(msg),
                _ => None,
            });
        }

        assert_eq!(follower.log.get_last_index(), 5);
        assert_eq!(follower.log.get_term(4), 3);
        assert_eq!(follower.log.get_term(5), 3);
    }
}

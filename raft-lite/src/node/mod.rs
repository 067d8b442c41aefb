//! Core consensus replica.
//!
//! [`Replica`] owns every piece of consensus state (role, term, vote, log,
//! commit and apply indices, replication indices, pending client requests)
//! and never performs I/O itself. Callers feed it inputs:
//!
//! - [`Replica::step`] for a message from a peer
//! - [`Replica::on_election_timeout`] / [`Replica::on_heartbeat`] for timers
//! - [`Replica::submit`] for a new client mutation
//! - [`Replica::on_applied`] once the sink has executed a committed entry
//! - [`Replica::observe_peer`] / [`Replica::forget_peer`] for membership hints
//!
//! Each input runs to completion and leaves its side effects queued in a
//! [`ReadyBundle`], which the caller drains with [`Replica::poll_ready`]:
//! messages to send, committed entries to apply, events to publish, timers to
//! (re)arm or cancel, and client requests that resolved.
//!
//! Handlers are split by concern:
//!
//! - `election`: timeouts, vote requests and vote counting
//! - `replication`: AppendEntries on both sides, heartbeats, commit advancement
//! - `router`: client submission, forwarding, queuing and response correlation

mod election;
mod replication;
mod router;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::mem;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::events::RaftEvent;
use crate::log::{EntryKind, EntryMeta, Log, LogEntry};
use crate::message::Message;
use crate::mutation::Mutation;
use crate::topology::Topology;
use crate::{LogIndex, PeerId, RequestId, Term};

pub use router::{ClientOutcome, CommitReceipt};
use router::{PendingRequest, QueuedRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Peer(PeerId),
    /// Every peer the transport can reach.
    Broadcast,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: Destination,
    pub message: Message,
}

/// Timer changes requested by the replica.
///
/// Arming a timer that is already armed replaces it; the old deadline must
/// never fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    ArmElection(Duration),
    DisarmElection,
    StartHeartbeat(Duration),
    StopHeartbeat,
}

/// Side effects produced by one or more inputs, in the order they occurred.
#[derive(Debug, Default)]
pub struct ReadyBundle {
    pub messages: Vec<Outbound>,
    /// Newly committed entries, in ascending index order. Each must be
    /// applied and reported back through [`Replica::on_applied`].
    pub apply: Vec<LogEntry>,
    pub events: Vec<RaftEvent>,
    pub timers: Vec<TimerCommand>,
    /// Client requests submitted here that have resolved.
    pub outcomes: Vec<ClientOutcome>,
}

impl ReadyBundle {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.apply.is_empty()
            && self.events.is_empty()
            && self.timers.is_empty()
            && self.outcomes.is_empty()
    }
}

/// Point-in-time view of a replica, returned by the `STATUS` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub node_id: PeerId,
    pub role: Role,
    pub term: Term,
    pub voted_for: Option<PeerId>,
    pub leader_id: Option<PeerId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub log_length: usize,
    pub quorum_size: usize,
    pub cluster_size: usize,
    pub peers: Vec<PeerId>,
    pub pending_requests: usize,
    pub queued_requests: usize,
}

/// A single consensus participant.
pub struct Replica {
    id: PeerId,
    config: RaftConfig,
    role: Role,
    current_term: Term,
    voted_for: Option<PeerId>,
    leader_id: Option<PeerId>,
    log: Log,
    commit_index: LogIndex,
    /// Highest index handed to the apply queue. Runs ahead of `last_applied`
    /// while the sink is working.
    last_dispatched: LogIndex,
    last_applied: LogIndex,
    votes: HashSet<PeerId>,
    next_index: HashMap<PeerId, LogIndex>,
    match_index: HashMap<PeerId, LogIndex>,
    topology: Topology,
    pending: HashMap<RequestId, PendingRequest>,
    queued: VecDeque<QueuedRequest>,
    ready: ReadyBundle,
    running: bool,
}

impl Replica {
    /// Creates a follower at term 0 with an empty log. Call [`Replica::start`]
    /// before feeding it inputs.
    pub fn new(id: PeerId, config: RaftConfig) -> Self {
        let topology = Topology::new(id, config.cluster_size_hint);
        Self {
            id,
            config,
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            log: Log::new(),
            commit_index: 0,
            last_dispatched: 0,
            last_applied: 0,
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            topology,
            pending: HashMap::new(),
            queued: VecDeque::new(),
            ready: ReadyBundle::default(),
            running: false,
        }
    }

    /// Arms the first election timer.
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        info!(node = self.id, "replica started");
        self.arm_election_timer();
    }

    /// Cancels both timers and rejects every unresolved client request.
    /// Inputs received afterwards are ignored.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.ready.timers.push(TimerCommand::DisarmElection);
        if self.role == Role::Leader {
            self.ready.timers.push(TimerCommand::StopHeartbeat);
        }
        self.queued.clear();
        for request_id in self.pending.drain().map(|(id, _)| id) {
            self.ready.outcomes.push(ClientOutcome {
                request_id,
                result: Err(RaftError::Shutdown),
            });
        }
        info!(node = self.id, term = self.current_term, "replica shut down");
    }

    /// Takes the side effects accumulated since the last call.
    pub fn poll_ready(&mut self) -> Option<ReadyBundle> {
        if self.ready.is_empty() {
            None
        } else {
            Some(mem::take(&mut self.ready))
        }
    }

    /// Handles a message from `from`. Malformed messages and messages that
    /// claim to come from this replica are dropped.
    pub fn step(&mut self, from: PeerId, message: Message) {
        if !self.running || from == self.id {
            return;
        }
        if let Err(violation) = message.validate(from) {
            debug!(
                node = self.id,
                peer = from,
                kind = message.kind(),
                %violation,
                "dropping message"
            );
            return;
        }
        self.observe_peer(from);
        match message {
            Message::RequestVote(request) => self.handle_request_vote(from, request),
            Message::RequestVoteResponse(response) => self.handle_vote_response(from, response),
            Message::AppendEntries(request) => self.handle_append_entries(from, request),
            Message::AppendEntriesResponse(response) => {
                self.handle_append_response(from, response)
            }
            Message::ClientRequest(request) => self.handle_client_request(from, request),
            Message::ClientResponse(response) => self.handle_client_response(response),
        }
    }

    /// Records that `peer` is reachable. The cluster size hint only grows.
    pub fn observe_peer(&mut self, peer: PeerId) {
        if !self.topology.observe(peer) {
            return;
        }
        info!(
            node = self.id,
            peer,
            cluster_size = self.topology.cluster_size(),
            "peer joined"
        );
        if self.running && self.role == Role::Leader {
            self.next_index.insert(peer, self.log.last_index() + 1);
            self.match_index.insert(peer, 0);
            self.send_append(peer, true);
        }
    }

    /// Records that `peer` is unreachable. Quorum is still computed from the
    /// sticky size hint, so losing peers never makes quorum easier.
    ///
    /// A leader keeps sending heartbeats to the peer; the first message it
    /// gets back marks the peer live again and restarts its replication.
    pub fn forget_peer(&mut self, peer: PeerId) {
        if !self.topology.forget(peer) {
            return;
        }
        info!(
            node = self.id,
            peer,
            live = self.topology.live_count(),
            cluster_size = self.topology.cluster_size(),
            "peer left"
        );
    }

    /// Reports that the sink finished the entry at `index`.
    ///
    /// A sink error is logged and the entry still counts as applied.
    pub fn on_applied(&mut self, index: LogIndex, result: Result<(), String>) {
        if index != self.last_applied + 1 || index > self.last_dispatched {
            warn!(
                node = self.id,
                index,
                last_applied = self.last_applied,
                "ignoring out-of-order apply report"
            );
            return;
        }
        let Some(entry) = self.log.get(index).cloned() else {
            warn!(node = self.id, index, "apply report for missing entry");
            return;
        };
        self.last_applied = index;
        let error = result.err();
        match &error {
            Some(err) => warn!(
                node = self.id,
                index,
                error = %err,
                "sink rejected committed entry"
            ),
            None => debug!(node = self.id, index, "entry applied"),
        }
        self.ready.events.push(RaftEvent::EntryApplied {
            node_id: self.id,
            index,
            term: entry.term,
            error,
        });
        self.complete_request(&entry);
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<PeerId> {
        self.voted_for
    }

    pub fn leader_id(&self) -> Option<PeerId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn quorum_size(&self) -> usize {
        self.topology.quorum_size()
    }

    pub fn cluster_size(&self) -> usize {
        self.topology.cluster_size()
    }

    pub fn match_index_of(&self, peer: PeerId) -> Option<LogIndex> {
        self.match_index.get(&peer).copied()
    }

    pub fn next_index_of(&self, peer: PeerId) -> Option<LogIndex> {
        self.next_index.get(&peer).copied()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_requests(&self) -> usize {
        self.queued.len()
    }

    pub fn status(&self) -> Status {
        Status {
            node_id: self.id,
            role: self.role,
            term: self.current_term,
            voted_for: self.voted_for,
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            log_length: self.log.len(),
            quorum_size: self.topology.quorum_size(),
            cluster_size: self.topology.cluster_size(),
            peers: self.topology.peers().collect(),
            pending_requests: self.pending.len(),
            queued_requests: self.queued.len(),
        }
    }

    /// Payload-free projection of the log.
    pub fn log_meta(&self) -> Vec<EntryMeta> {
        self.log.meta()
    }

    /// Steps down to follower, adopting `term` if it is newer.
    ///
    /// Always re-arms the election timer. `leader` is the leader for the
    /// resulting term, if known.
    fn become_follower(&mut self, term: Term, leader: Option<PeerId>) {
        let previous = (self.role, self.current_term, self.leader_id);
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        if self.role == Role::Leader {
            self.ready.timers.push(TimerCommand::StopHeartbeat);
            self.next_index.clear();
            self.match_index.clear();
        }
        self.role = Role::Follower;
        self.leader_id = leader;
        self.votes.clear();
        self.arm_election_timer();

        if previous != (self.role, self.current_term, self.leader_id) {
            info!(
                node = self.id,
                term = self.current_term,
                leader = ?self.leader_id,
                from = %previous.0,
                "became follower"
            );
            self.emit_role_changed();
        }
        if leader.is_some() && previous.2 != leader {
            self.forward_queued();
        }
    }

    /// Steps down if `term` is newer than ours. Returns whether it did.
    fn observe_term(&mut self, term: Term) -> bool {
        if term > self.current_term {
            self.become_follower(term, None);
            true
        } else {
            false
        }
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        self.votes.clear();
        let next = self.log.last_index() + 1;
        let peers: Vec<PeerId> = self.topology.members().collect();
        self.next_index = peers.iter().map(|&peer| (peer, next)).collect();
        self.match_index = peers.iter().map(|&peer| (peer, 0)).collect();
        self.ready.timers.push(TimerCommand::DisarmElection);
        self.ready
            .timers
            .push(TimerCommand::StartHeartbeat(self.config.heartbeat_interval()));
        info!(
            node = self.id,
            term = self.current_term,
            quorum = self.topology.quorum_size(),
            "became leader"
        );
        self.emit_role_changed();
        self.ready.events.push(RaftEvent::LeadershipAcquired {
            node_id: self.id,
            term: self.current_term,
        });

        if self.config.noop_on_election {
            self.append_entry(EntryKind::Noop, None, None, None);
        }
        self.append_queued();
        self.replicate_all();
        self.advance_commit_index();
    }

    fn append_entry(
        &mut self,
        kind: EntryKind,
        payload: Option<Mutation>,
        request_id: Option<RequestId>,
        origin_id: Option<PeerId>,
    ) -> LogIndex {
        let term = self.current_term;
        let index = self.log.append(term, kind, payload, request_id, origin_id);
        debug!(node = self.id, term, index, "appended entry");
        self.ready.events.push(RaftEvent::EntryAppended {
            node_id: self.id,
            index,
            term,
        });
        index
    }

    /// Raises the commit index. Never lowers it.
    fn commit_to(&mut self, index: LogIndex) {
        let index = index.min(self.log.last_index());
        if index <= self.commit_index {
            return;
        }
        debug!(
            node = self.id,
            term = self.current_term,
            from = self.commit_index,
            to = index,
            "commit index advanced"
        );
        self.commit_index = index;
        self.dispatch_committed();
    }

    fn dispatch_committed(&mut self) {
        while self.last_dispatched < self.commit_index {
            let index = self.last_dispatched + 1;
            let Some(entry) = self.log.get(index) else {
                break;
            };
            self.ready.apply.push(entry.clone());
            self.last_dispatched = index;
        }
    }

    fn arm_election_timer(&mut self) {
        self.ready
            .timers
            .push(TimerCommand::ArmElection(self.config.random_election_timeout()));
    }

    fn emit_role_changed(&mut self) {
        self.ready.events.push(RaftEvent::RoleChanged {
            node_id: self.id,
            role: self.role,
            term: self.current_term,
            leader_id: self.leader_id,
        });
    }

    fn send(&mut self, peer: PeerId, message: Message) {
        self.ready.messages.push(Outbound {
            to: Destination::Peer(peer),
            message,
        });
    }

    fn broadcast(&mut self, message: Message) {
        self.ready.messages.push(Outbound {
            to: Destination::Broadcast,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AppendEntries, RequestVote};

    fn config() -> RaftConfig {
        RaftConfig {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            ..RaftConfig::default()
        }
    }

    fn started(id: PeerId) -> Replica {
        let mut replica = Replica::new(id, config());
        replica.start();
        replica.poll_ready();
        replica
    }

    #[test]
    fn new_replica_is_idle_follower() {
        let replica = Replica::new(1, config());
        let status = replica.status();
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.term, 0);
        assert_eq!(status.leader_id, None);
        assert_eq!(status.log_length, 0);
        assert_eq!(status.quorum_size, 1);
        assert!(!replica.is_running());
    }

    #[test]
    fn start_arms_election_timer() {
        let mut replica = Replica::new(1, config());
        replica.start();
        let ready = replica.poll_ready().expect("ready after start");
        assert!(matches!(ready.timers.as_slice(), [TimerCommand::ArmElection(d)]
            if *d >= Duration::from_millis(150) && *d <= Duration::from_millis(300)));
        assert!(replica.poll_ready().is_none());
    }

    #[test]
    fn messages_before_start_are_ignored() {
        let mut replica = Replica::new(1, config());
        replica.step(
            2,
            Message::RequestVote(RequestVote {
                term: 3,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            }),
        );
        assert_eq!(replica.current_term(), 0);
        assert!(replica.poll_ready().is_none());
    }

    #[test]
    fn higher_term_forces_follower_and_clears_vote() {
        let mut replica = started(1);
        replica.observe_peer(2);
        replica.observe_peer(3);
        replica.on_election_timeout();
        assert_eq!(replica.role(), Role::Candidate);
        assert_eq!(replica.voted_for(), Some(1));

        replica.step(
            3,
            Message::AppendEntries(AppendEntries {
                term: 5,
                leader_id: 3,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            }),
        );
        assert_eq!(replica.role(), Role::Follower);
        assert_eq!(replica.current_term(), 5);
        assert_eq!(replica.voted_for(), None);
        assert_eq!(replica.leader_id(), Some(3));
    }

    #[test]
    fn spoofed_sender_is_dropped() {
        let mut replica = started(1);
        replica.step(
            2,
            Message::AppendEntries(AppendEntries {
                term: 9,
                leader_id: 3,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            }),
        );
        assert_eq!(replica.current_term(), 0);
        assert_eq!(replica.cluster_size(), 1);
    }

    #[test]
    fn forgetting_peer_keeps_cluster_size() {
        let mut replica = started(1);
        replica.observe_peer(2);
        replica.observe_peer(3);
        replica.forget_peer(3);
        assert_eq!(replica.cluster_size(), 3);
        assert_eq!(replica.quorum_size(), 2);
        assert_eq!(replica.status().peers, vec![2]);
    }

    #[test]
    fn append_overflowing_the_index_space_is_dropped() {
        let mut replica = started(1);
        replica.observe_peer(2);
        replica.poll_ready();
        let entry = LogEntry {
            index: 0,
            term: 1,
            kind: EntryKind::Noop,
            payload: None,
            request_id: None,
            origin_id: None,
            timestamp: 0,
        };
        replica.step(
            2,
            Message::AppendEntries(AppendEntries {
                term: 1,
                leader_id: 2,
                prev_log_index: LogIndex::MAX,
                prev_log_term: 1,
                entries: vec![entry],
                leader_commit: 0,
            }),
        );
        assert_eq!(replica.current_term(), 0);
        assert!(replica.log().is_empty());
        assert!(replica.poll_ready().is_none());
    }

    #[test]
    fn shutdown_rejects_pending_and_disarms() {
        let mut replica = started(1);
        replica.observe_peer(2);
        replica.observe_peer(3);
        replica
            .submit("r1".into(), Mutation::write("/a", "x"))
            .expect("queued");
        replica.poll_ready();

        replica.shutdown();
        let ready = replica.poll_ready().expect("ready after shutdown");
        assert!(ready.timers.contains(&TimerCommand::DisarmElection));
        assert_eq!(ready.outcomes.len(), 1);
        assert_eq!(ready.outcomes[0].result, Err(RaftError::Shutdown));
        assert_eq!(replica.pending_requests(), 0);
        assert_eq!(replica.queued_requests(), 0);
        assert_eq!(
            replica.submit("r2".into(), Mutation::write("/b", "y")),
            Err(RaftError::Shutdown)
        );
    }

    #[test]
    fn apply_reports_must_be_in_order() {
        let mut replica = started(1);
        replica.on_election_timeout();
        replica
            .submit("r1".into(), Mutation::write("/a", "x"))
            .unwrap();
        replica
            .submit("r2".into(), Mutation::write("/b", "y"))
            .unwrap();
        let ready = replica.poll_ready().unwrap();
        assert_eq!(ready.apply.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2]);

        replica.on_applied(2, Ok(()));
        assert_eq!(replica.last_applied(), 0);
        replica.on_applied(1, Err("disk full".into()));
        replica.on_applied(2, Ok(()));
        assert_eq!(replica.last_applied(), 2);

        let ready = replica.poll_ready().unwrap();
        assert!(ready.events.iter().any(|event| matches!(
            event,
            RaftEvent::EntryApplied { index: 1, error: Some(_), .. }
        )));
        assert_eq!(ready.outcomes.len(), 2);
        assert!(ready.outcomes.iter().all(|outcome| outcome.result.is_ok()));
    }
}

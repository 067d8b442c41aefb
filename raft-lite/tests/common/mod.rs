//! Deterministic in-memory cluster for driving replicas in tests.
//!
//! Time is virtual: nothing happens until [`SimCluster::advance`] moves the
//! clock, and then timers fire one at a time in deadline order. Messages are
//! delivered instantly until the cluster goes quiet, in FIFO order unless
//! the cluster was built with [`Faults`], in which case a seeded generator
//! drops, duplicates and reorders them. Committed entries are "applied" as
//! soon as they are dispatched.
//!
//! The harness checks the safety properties on every step and panics if one
//! is broken: one leader per term, commit indices never move backwards,
//! entries are applied once each in index order, and a request never
//! resolves twice.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use raft_lite::log::LogEntry;
use raft_lite::message::Message;
use raft_lite::node::{ClientOutcome, Destination, ReadyBundle, TimerCommand};
use raft_lite::{
    LogIndex, Mutation, PeerId, RaftConfig, RaftError, RaftEvent, Replica, RequestId, Role, Term,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn default_config(size: usize) -> RaftConfig {
    RaftConfig {
        cluster_size_hint: size,
        ..RaftConfig::default()
    }
}

pub struct SimNode {
    pub replica: Replica,
    election_at: Option<u64>,
    /// `(next firing, period)`.
    heartbeat: Option<(u64, u64)>,
    pub applied: Vec<LogEntry>,
    pub outcomes: Vec<ClientOutcome>,
    pub events: Vec<RaftEvent>,
    commit_seen: LogIndex,
}

/// Network misbehavior applied to every message in flight.
#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    /// Probability that a message is lost.
    pub drop: f64,
    /// Probability that a sent message is queued twice.
    pub duplicate: f64,
    /// Deliver queued messages in random order instead of FIFO.
    pub reorder: bool,
}

impl Faults {
    pub fn lossy() -> Self {
        Self {
            drop: 0.1,
            duplicate: 0.1,
            reorder: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: PeerId,
    pub to: PeerId,
    pub message: Message,
}

pub struct SimCluster {
    now: u64,
    nodes: BTreeMap<PeerId, SimNode>,
    in_flight: VecDeque<Delivery>,
    isolated: BTreeSet<PeerId>,
    expiries: Vec<(u64, PeerId, RequestId)>,
    leaders: BTreeMap<Term, PeerId>,
    faults: Faults,
    rng: StdRng,
    /// Every message that reached its destination, in delivery order.
    pub delivered: Vec<Delivery>,
}

impl SimCluster {
    /// Starts `size` replicas with ids `1..=size` that all know each other.
    pub fn new(size: usize) -> Self {
        Self::with_config(size, default_config(size))
    }

    /// Starts `size` replicas on a network that misbehaves per `faults`,
    /// with every random choice drawn from `seed`.
    pub fn with_faults(size: usize, seed: u64, faults: Faults) -> Self {
        Self::build(size, default_config(size), seed, faults)
    }

    pub fn with_config(size: usize, config: RaftConfig) -> Self {
        Self::build(size, config, 0, Faults::default())
    }

    fn build(size: usize, config: RaftConfig, seed: u64, faults: Faults) -> Self {
        let ids: Vec<PeerId> = (1..=size as PeerId).collect();
        let mut nodes = BTreeMap::new();
        for &id in &ids {
            let mut replica = Replica::new(id, config.clone());
            replica.start();
            for &peer in &ids {
                replica.observe_peer(peer);
            }
            nodes.insert(
                id,
                SimNode {
                    replica,
                    election_at: None,
                    heartbeat: None,
                    applied: Vec::new(),
                    outcomes: Vec::new(),
                    events: Vec::new(),
                    commit_seen: 0,
                },
            );
        }
        let mut cluster = Self {
            now: 0,
            nodes,
            in_flight: VecDeque::new(),
            isolated: BTreeSet::new(),
            expiries: Vec::new(),
            leaders: BTreeMap::new(),
            faults,
            rng: StdRng::seed_from_u64(seed),
            delivered: Vec::new(),
        };
        cluster.flush();
        cluster
    }

    /// Turns fault injection off. Messages already in flight are kept.
    pub fn calm(&mut self) {
        self.faults = Faults::default();
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node(&self, id: PeerId) -> &SimNode {
        &self.nodes[&id]
    }

    pub fn replica(&self, id: PeerId) -> &Replica {
        &self.nodes[&id].replica
    }

    /// Runs `f` against one replica, then lets the cluster settle.
    pub fn act<R>(&mut self, id: PeerId, f: impl FnOnce(&mut Replica) -> R) -> R {
        let result = f(&mut self.node_mut(id).replica);
        self.flush();
        result
    }

    /// Submits a mutation on `id` and arms its request timeout, the way the
    /// node runtime does.
    pub fn submit(
        &mut self,
        id: PeerId,
        request_id: &str,
        mutation: Mutation,
    ) -> Result<(), RaftError> {
        let timeout = self.replica(id).config().request_timeout_ms;
        let result = self.act(id, |replica| replica.submit(request_id.to_string(), mutation));
        if result.is_ok() {
            self.expiries.push((self.now + timeout, id, request_id.to_string()));
        }
        result
    }

    pub fn outcome(&self, id: PeerId, request_id: &str) -> Option<&ClientOutcome> {
        self.nodes[&id]
            .outcomes
            .iter()
            .find(|outcome| outcome.request_id == request_id)
    }

    /// Replicas that currently consider themselves leader.
    pub fn leaders(&self) -> Vec<PeerId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.replica.role() == Role::Leader)
            .map(|(&id, _)| id)
            .collect()
    }

    /// The single leader among connected replicas, if there is one.
    pub fn leader(&self) -> Option<PeerId> {
        let connected: Vec<PeerId> = self
            .leaders()
            .into_iter()
            .filter(|id| !self.isolated.contains(id))
            .collect();
        match connected.as_slice() {
            [leader] => Some(*leader),
            _ => None,
        }
    }

    /// Every leader ever observed, by term.
    pub fn leader_history(&self) -> &BTreeMap<Term, PeerId> {
        &self.leaders
    }

    /// Advances virtual time in steps until `until` holds or `limit_ms`
    /// passes. Returns whether the condition was met.
    pub fn run_until(&mut self, limit_ms: u64, until: impl Fn(&SimCluster) -> bool) -> bool {
        let deadline = self.now + limit_ms;
        while self.now < deadline {
            if until(self) {
                return true;
            }
            self.advance(10);
        }
        until(self)
    }

    /// Drops all traffic to and from `id`. Both sides see the peer go down.
    pub fn isolate(&mut self, id: PeerId) {
        if !self.isolated.insert(id) {
            return;
        }
        for other in self.ids() {
            if other == id {
                continue;
            }
            self.node_mut(other).replica.forget_peer(id);
            self.node_mut(id).replica.forget_peer(other);
        }
        self.flush();
    }

    pub fn heal(&mut self, id: PeerId) {
        if !self.isolated.remove(&id) {
            return;
        }
        for other in self.ids() {
            if other == id || self.isolated.contains(&other) {
                continue;
            }
            self.node_mut(other).replica.observe_peer(id);
            self.node_mut(id).replica.observe_peer(other);
        }
        self.flush();
    }

    /// Moves the clock forward by `ms`, firing every timer that falls due in
    /// deadline order and settling the cluster after each one.
    pub fn advance(&mut self, ms: u64) {
        let target = self.now + ms;
        while let Some((at, timer)) = self.next_timer(target) {
            self.now = at;
            self.fire(timer);
            self.flush();
        }
        self.now = target;
    }

    /// Asserts the log matching property across every pair of replicas.
    pub fn assert_log_matching(&self) {
        let nodes: Vec<&SimNode> = self.nodes.values().collect();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let (a_log, b_log) = (a.replica.log(), b.replica.log());
                let shared = a_log.last_index().min(b_log.last_index());
                for index in (1..=shared).rev() {
                    if a_log.term_at(index) == b_log.term_at(index) {
                        for prefix in 1..=index {
                            assert_eq!(
                                a_log.get(prefix),
                                b_log.get(prefix),
                                "replicas {} and {} agree at {index} but differ at {prefix}",
                                a.replica.id(),
                                b.replica.id()
                            );
                        }
                        break;
                    }
                }
            }
        }
    }

    fn node_mut(&mut self, id: PeerId) -> &mut SimNode {
        self.nodes
            .get_mut(&id)
            .unwrap_or_else(|| panic!("no replica {id}"))
    }

    fn next_timer(&self, target: u64) -> Option<(u64, Timer)> {
        let mut due: Vec<(u64, Timer)> = Vec::new();
        for (&id, node) in &self.nodes {
            if let Some(at) = node.election_at {
                due.push((at, Timer::Election(id)));
            }
            if let Some((at, _)) = node.heartbeat {
                due.push((at, Timer::Heartbeat(id)));
            }
        }
        for (at, id, request_id) in &self.expiries {
            due.push((*at, Timer::Expiry(*id, request_id.clone())));
        }
        due.into_iter()
            .filter(|(at, _)| *at <= target)
            .min_by(|a, b| a.0.cmp(&b.0))
    }

    fn fire(&mut self, timer: Timer) {
        match timer {
            Timer::Election(id) => {
                let node = self.node_mut(id);
                node.election_at = None;
                node.replica.on_election_timeout();
            }
            Timer::Heartbeat(id) => {
                let now = self.now;
                let node = self.node_mut(id);
                if let Some((next, period)) = node.heartbeat.as_mut() {
                    *next = now + *period;
                }
                node.replica.on_heartbeat();
            }
            Timer::Expiry(id, request_id) => {
                self.expiries
                    .retain(|(_, node, pending)| !(*node == id && *pending == request_id));
                self.node_mut(id).replica.expire_request(&request_id);
            }
        }
    }

    /// Drains side effects and delivers messages until nothing is left.
    fn flush(&mut self) {
        let ids = self.ids();
        loop {
            let mut progressed = false;
            for &id in &ids {
                while let Some(ready) = self.node_mut(id).replica.poll_ready() {
                    progressed = true;
                    self.absorb(id, &ids, ready);
                }
                self.check_invariants(id);
            }
            if let Some(delivery) = self.next_delivery() {
                progressed = true;
                if self.faults.drop > 0.0 && self.rng.gen_bool(self.faults.drop) {
                    continue;
                }
                if self.linked(delivery.from, delivery.to) {
                    if let Some(node) = self.nodes.get_mut(&delivery.to) {
                        node.replica.step(delivery.from, delivery.message.clone());
                    }
                    self.delivered.push(delivery);
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn next_delivery(&mut self) -> Option<Delivery> {
        if self.faults.reorder && self.in_flight.len() > 1 {
            let at = self.rng.gen_range(0..self.in_flight.len());
            return self.in_flight.remove(at);
        }
        self.in_flight.pop_front()
    }

    fn absorb(&mut self, id: PeerId, ids: &[PeerId], ready: ReadyBundle) {
        let now = self.now;
        for command in ready.timers {
            let node = self.node_mut(id);
            match command {
                TimerCommand::ArmElection(delay) => node.election_at = Some(now + millis(delay)),
                TimerCommand::DisarmElection => node.election_at = None,
                TimerCommand::StartHeartbeat(period) => {
                    node.heartbeat = Some((now + millis(period), millis(period)));
                }
                TimerCommand::StopHeartbeat => node.heartbeat = None,
            }
        }
        for outbound in ready.messages {
            let targets: Vec<PeerId> = match outbound.to {
                Destination::Peer(peer) => vec![peer],
                Destination::Broadcast => ids.iter().copied().filter(|&peer| peer != id).collect(),
            };
            for to in targets {
                if !self.linked(id, to) {
                    continue;
                }
                let delivery = Delivery {
                    from: id,
                    to,
                    message: outbound.message.clone(),
                };
                if self.faults.duplicate > 0.0 && self.rng.gen_bool(self.faults.duplicate) {
                    self.in_flight.push_back(delivery.clone());
                }
                self.in_flight.push_back(delivery);
            }
        }
        let node = self.node_mut(id);
        node.events.extend(ready.events);
        for entry in ready.apply {
            assert_eq!(
                entry.index,
                node.applied.len() as LogIndex + 1,
                "replica {id} applied out of order"
            );
            let index = entry.index;
            node.applied.push(entry);
            node.replica.on_applied(index, Ok(()));
        }
        for outcome in ready.outcomes {
            assert!(
                node.outcomes
                    .iter()
                    .all(|seen| seen.request_id != outcome.request_id),
                "request {} resolved twice on replica {id}",
                outcome.request_id
            );
            node.outcomes.push(outcome);
        }
    }

    fn check_invariants(&mut self, id: PeerId) {
        let node = self.node_mut(id);
        let commit = node.replica.commit_index();
        assert!(
            commit >= node.commit_seen,
            "replica {id} commit index went from {} to {commit}",
            node.commit_seen
        );
        node.commit_seen = commit;
        let leading = (node.replica.role() == Role::Leader).then(|| node.replica.current_term());
        if let Some(term) = leading {
            let previous = *self.leaders.entry(term).or_insert(id);
            assert_eq!(previous, id, "two leaders in term {term}");
        }
    }

    fn linked(&self, a: PeerId, b: PeerId) -> bool {
        !self.isolated.contains(&a) && !self.isolated.contains(&b)
    }
}

#[derive(Debug, Clone)]
enum Timer {
    Election(PeerId),
    Heartbeat(PeerId),
    Expiry(PeerId, RequestId),
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

//! Peer tracking and quorum arithmetic.
//!
//! Cluster size is never configured authoritatively. Each replica keeps a
//! hint that starts at the configured value and grows as peers are seen. The
//! hint never shrinks when a peer disconnects, so a transient partition
//! cannot lower the quorum. The flip side is that a replica whose peers have
//! left for good may never reach quorum again.
//!
//! Peers are tracked twice: every peer ever seen is a member and keeps
//! receiving replication traffic, while the live set only holds peers the
//! transport currently reports as reachable.

use std::collections::BTreeSet;

use crate::PeerId;

/// Minimum number of replicas whose agreement is required in a cluster of `n`.
pub fn quorum(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

#[derive(Debug, Clone)]
pub struct Topology {
    local: PeerId,
    members: BTreeSet<PeerId>,
    live: BTreeSet<PeerId>,
    size_hint: usize,
}

impl Topology {
    pub fn new(local: PeerId, size_hint: usize) -> Self {
        Self {
            local,
            members: BTreeSet::new(),
            live: BTreeSet::new(),
            size_hint: size_hint.max(1),
        }
    }

    /// Records a live peer. Returns `true` if it was not live before.
    pub fn observe(&mut self, peer: PeerId) -> bool {
        if peer == self.local {
            return false;
        }
        self.members.insert(peer);
        let added = self.live.insert(peer);
        self.size_hint = self.size_hint.max(self.members.len() + 1);
        added
    }

    /// Marks a peer as unreachable. It stays a member and the size hint is
    /// left untouched.
    pub fn forget(&mut self, peer: PeerId) -> bool {
        self.live.remove(&peer)
    }

    /// Peers currently reachable.
    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.live.iter().copied()
    }

    /// Every peer ever observed, reachable or not.
    pub fn members(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.members.iter().copied()
    }

    /// Live peers plus self.
    pub fn live_count(&self) -> usize {
        self.live.len() + 1
    }

    pub fn cluster_size(&self) -> usize {
        self.size_hint.max(self.live_count())
    }

    pub fn quorum_size(&self) -> usize {
        quorum(self.cluster_size())
    }

    /// Whether enough replicas are currently connected to form a quorum.
    pub fn has_reachable_quorum(&self) -> bool {
        self.live_count() >= self.quorum_size()
    }
}

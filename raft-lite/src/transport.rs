//! Message delivery between replicas.
//!
//! A transport sends envelopes to one peer or to every peer it can reach,
//! and feeds the node an [`Inbound`] stream of received envelopes and peer
//! liveness changes. Delivery is best effort: messages may be lost,
//! duplicated or reordered and the replica copes with all three.
//!
//! [`LocalNetwork`] is an in-process implementation used by tests and demos.
//! It can cut a replica off from everyone else to simulate a partition.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

use crate::message::Envelope;
use crate::PeerId;

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Envelope),
    PeerUp(PeerId),
    PeerDown(PeerId),
}

pub trait Transport: Send + Sync + 'static {
    fn send(&self, to: PeerId, envelope: Envelope);
    fn broadcast(&self, envelope: Envelope);
}

#[derive(Debug, Default)]
struct NetworkState {
    mailboxes: HashMap<PeerId, UnboundedSender<Inbound>>,
    isolated: BTreeSet<PeerId>,
}

impl NetworkState {
    fn linked(&self, a: PeerId, b: PeerId) -> bool {
        a != b && !self.isolated.contains(&a) && !self.isolated.contains(&b)
    }

    fn deliver(&self, from: PeerId, to: PeerId, event: Inbound) {
        if !self.linked(from, to) {
            trace!(from, to, "dropping message across partition");
            return;
        }
        if let Some(mailbox) = self.mailboxes.get(&to) {
            let _ = mailbox.send(event);
        }
    }

    /// Tells `peer` and everyone linked to it about each other.
    fn announce(&self, peer: PeerId, up: bool) {
        for &other in self.mailboxes.keys() {
            if other == peer || !self.linked(peer, other) {
                continue;
            }
            let (to_other, to_peer) = if up {
                (Inbound::PeerUp(peer), Inbound::PeerUp(other))
            } else {
                (Inbound::PeerDown(peer), Inbound::PeerDown(other))
            };
            self.deliver(peer, other, to_other);
            self.deliver(other, peer, to_peer);
        }
    }
}

/// An in-memory network joining any number of replicas.
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects replica `id` and returns its transport and inbox.
    pub fn join(&self, id: PeerId) -> (LocalTransport, UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.mailboxes.insert(id, tx);
        state.announce(id, true);
        debug!(peer = id, "joined local network");
        (
            LocalTransport {
                id,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Disconnects `id` permanently.
    pub fn leave(&self, id: PeerId) {
        let mut state = self.lock();
        state.announce(id, false);
        state.mailboxes.remove(&id);
        state.isolated.remove(&id);
    }

    /// Cuts `id` off from every other replica until [`LocalNetwork::heal`].
    pub fn isolate(&self, id: PeerId) {
        let mut state = self.lock();
        if state.isolated.contains(&id) {
            return;
        }
        state.announce(id, false);
        state.isolated.insert(id);
        debug!(peer = id, "isolated");
    }

    pub fn heal(&self, id: PeerId) {
        let mut state = self.lock();
        if state.isolated.remove(&id) {
            state.announce(id, true);
            debug!(peer = id, "healed");
        }
    }

    pub fn members(&self) -> Vec<PeerId> {
        let mut members: Vec<PeerId> = self.lock().mailboxes.keys().copied().collect();
        members.sort_unstable();
        members
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One replica's view of a [`LocalNetwork`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    id: PeerId,
    network: LocalNetwork,
}

impl Transport for LocalTransport {
    fn send(&self, to: PeerId, envelope: Envelope) {
        self.network
            .lock()
            .deliver(self.id, to, Inbound::Message(envelope));
    }

    fn broadcast(&self, envelope: Envelope) {
        let state = self.network.lock();
        for &peer in state.mailboxes.keys() {
            if peer != self.id {
                state.deliver(self.id, peer, Inbound::Message(envelope.clone()));
            }
        }
    }
}

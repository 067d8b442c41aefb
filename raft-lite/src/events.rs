//! Notifications announced by a replica, and the bus that fans them out.
//!
//! The replica pushes events into its `Ready` batch; the runtime publishes
//! them here. Subscribers that fall behind lose the oldest events rather
//! than stalling the replica.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::node::Role;
use crate::{LogIndex, PeerId, Term};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RaftEvent {
    RoleChanged {
        node_id: PeerId,
        role: Role,
        term: Term,
        leader_id: Option<PeerId>,
    },
    LeadershipAcquired {
        node_id: PeerId,
        term: Term,
    },
    EntryAppended {
        node_id: PeerId,
        index: LogIndex,
        term: Term,
    },
    /// `error` is set when the sink refused the mutation; the entry still
    /// counts as applied.
    EntryApplied {
        node_id: PeerId,
        index: LogIndex,
        term: Term,
        error: Option<String>,
    },
}

/// Broadcast channel for [`RaftEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RaftEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event. Returns how many subscribers received it.
    pub fn publish(&self, event: RaftEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn publish_batch(&self, events: impl IntoIterator<Item = RaftEvent>) -> usize {
        events.into_iter().map(|event| self.publish(event)).sum()
    }

    /// Receives every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RaftEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

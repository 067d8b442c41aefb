//! Raft-lite: leader-based log replication for a small cluster.
//!
//! A handful of replicas elect a leader, append client mutations to the
//! leader's log, replicate the log to followers and apply committed entries,
//! in index order, to a [`MutationSink`](sink::MutationSink). Every replica
//! ends up applying the same mutations in the same order.
//!
//! # Architecture
//!
//! - [`node`]: the consensus core. [`Replica`] never does IO; it takes
//!   messages, timer firings and apply completions, and queues up a
//!   [`ReadyBundle`](node::ReadyBundle) of messages to send, entries to
//!   apply, events and timer changes.
//! - [`runtime`]: tokio tasks that drive a replica, own its timers and run
//!   the sequential apply loop. Callers talk to it through a [`NodeHandle`].
//! - [`transport`] and [`tcp`]: best-effort message delivery, in-process or
//!   over TCP as newline-delimited JSON.
//!
//! Keeping the replica single-threaded and IO-free means the protocol can be
//! driven deterministically in tests, with no locks around its state.
//!
//! # Modules
//!
//! - [`config`]: timing and limits, loadable from JSON
//! - [`error`]: client-facing rejection reasons
//! - [`events`]: role and log notifications plus the broadcast bus
//! - [`log`]: the replicated log
//! - [`message`]: protocol messages and their wire envelope
//! - [`mutation`]: the opaque payload carried by log entries
//! - [`protocol`]: operator console command parsing
//! - [`sink`]: where committed mutations end up
//! - [`timer`]: cancelable one-shot and repeating timers
//! - [`topology`]: known peers and quorum arithmetic

pub mod config;
pub mod error;
pub mod events;
pub mod log;
pub mod message;
pub mod mutation;
pub mod node;
pub mod protocol;
pub mod runtime;
pub mod sink;
pub mod tcp;
pub mod timer;
pub mod topology;
pub mod transport;

pub type PeerId = u64;
pub type Term = u64;
/// 1-based position in the log. Index 0 means "before the first entry".
pub type LogIndex = u64;
pub type RequestId = String;

pub use config::RaftConfig;
pub use error::RaftError;
pub use events::{EventBus, RaftEvent};
pub use mutation::Mutation;
pub use node::{Replica, Role};
pub use runtime::{spawn_node, NodeConfig, NodeHandle};

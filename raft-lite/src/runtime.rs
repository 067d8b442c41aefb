//! Async runtime that drives a [`Replica`].
//!
//! Each node runs two tokio tasks:
//!
//! - **Worker**: owns the replica and is the only code that touches it. It
//!   waits on client commands, inbound transport events, timer firings and
//!   apply reports, feeds each one to the replica, then flushes the
//!   resulting [`ReadyBundle`](crate::node::ReadyBundle): messages go to the
//!   transport, committed entries to the apply task, events to the bus, and
//!   resolved requests back to their callers.
//! - **Apply task**: executes committed entries against the sink strictly one
//!   at a time in index order, reporting each completion back to the worker.
//!
//! Callers interact with the worker through a cloneable [`NodeHandle`].

use std::collections::HashMap;

use anyhow::{Context, Result};
use nanoid::nanoid;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::events::{EventBus, RaftEvent};
use crate::log::{EntryKind, EntryMeta, LogEntry};
use crate::message::Envelope;
use crate::mutation::Mutation;
use crate::node::{ClientOutcome, CommitReceipt, Destination, Replica, Status, TimerCommand};
use crate::sink::MutationSink;
use crate::timer::{TimerFired, TimerHandle, TimerKind, TimerService};
use crate::transport::{Inbound, Transport};
use crate::{LogIndex, PeerId, RequestId};

const COMMAND_CAPACITY: usize = 64;

/// Identity and tuning of a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: PeerId,
    pub raft: RaftConfig,
}

impl NodeConfig {
    pub fn new(id: PeerId, raft: RaftConfig) -> Self {
        Self { id, raft }
    }
}

type Responder = oneshot::Sender<Result<CommitReceipt, RaftError>>;

enum Command {
    Submit {
        mutation: Mutation,
        respond_to: Responder,
    },
    Status {
        respond_to: oneshot::Sender<Status>,
    },
    Log {
        respond_to: oneshot::Sender<Vec<EntryMeta>>,
    },
    Campaign {
        respond_to: oneshot::Sender<()>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle for talking to a running node. Cheap to clone.
///
/// When the last handle is dropped the node shuts down.
#[derive(Clone)]
pub struct NodeHandle {
    id: PeerId,
    commands: mpsc::Sender<Command>,
    events: EventBus,
}

impl NodeHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Submits a mutation and waits until it is committed and applied on
    /// this node, rejected, or timed out.
    pub async fn submit(&self, mutation: Mutation) -> Result<CommitReceipt, RaftError> {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                mutation,
                respond_to,
            })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        response.await.unwrap_or(Err(RaftError::Shutdown))
    }

    pub async fn status(&self) -> Result<Status> {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(Command::Status { respond_to })
            .await
            .context("failed to send status request")?;
        response.await.context("status response channel closed")
    }

    /// Metadata of every entry in this node's log.
    pub async fn log(&self) -> Result<Vec<EntryMeta>> {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(Command::Log { respond_to })
            .await
            .context("failed to send log request")?;
        response.await.context("log response channel closed")
    }

    /// Forces this node to start an election for the next term, whatever its
    /// current role. A leader steps down to do so.
    pub async fn campaign(&self) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(Command::Campaign { respond_to })
            .await
            .context("failed to send campaign request")?;
        response.await.context("campaign response channel closed")
    }

    /// Stops the node, rejecting any request still in flight. Calling it on
    /// a node that already stopped is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { respond_to })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = response.await;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RaftEvent> {
        self.events.subscribe()
    }
}

/// Starts a node on the current tokio runtime.
///
/// `inbox` is the stream of inbound events produced by `transport`'s
/// network. Committed mutations are applied to `sink`.
pub fn spawn_node<T, S>(
    config: NodeConfig,
    transport: T,
    inbox: UnboundedReceiver<Inbound>,
    sink: S,
) -> Result<NodeHandle>
where
    T: Transport,
    S: MutationSink,
{
    config
        .raft
        .validate()
        .with_context(|| format!("invalid config for node {}", config.id))?;

    let id = config.id;
    let events = EventBus::new(config.raft.event_capacity);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (apply_tx, apply_rx) = mpsc::unbounded_channel();
    let (applied_tx, applied_rx) = mpsc::unbounded_channel();
    let (timers, timer_rx) = TimerService::new();

    tokio::spawn(run_apply_loop(id, sink, apply_rx, applied_tx));

    let worker = Worker {
        replica: Replica::new(id, config.raft),
        transport,
        commands: command_rx,
        inbox,
        timers,
        timer_rx,
        election: None,
        heartbeat: None,
        request_timers: HashMap::new(),
        responders: HashMap::new(),
        apply_tx,
        applied_rx,
        events: events.clone(),
    };
    tokio::spawn(worker.run());
    info!(node = id, "node spawned");

    Ok(NodeHandle {
        id,
        commands: command_tx,
        events,
    })
}

/// Completion of one entry on the sink.
#[derive(Debug)]
struct ApplyReport {
    index: LogIndex,
    result: Result<(), String>,
}

/// Applies entries one at a time. The next entry is not started until the
/// previous apply has finished.
async fn run_apply_loop<S: MutationSink>(
    node: PeerId,
    mut sink: S,
    mut entries: UnboundedReceiver<LogEntry>,
    reports: UnboundedSender<ApplyReport>,
) {
    while let Some(entry) = entries.recv().await {
        let result = match (entry.kind, &entry.payload) {
            (EntryKind::Mutation, Some(mutation)) => {
                sink.apply(mutation).await.map_err(|err| err.to_string())
            }
            _ => Ok(()),
        };
        trace!(node, index = entry.index, ok = result.is_ok(), "sink apply finished");
        if reports
            .send(ApplyReport {
                index: entry.index,
                result,
            })
            .is_err()
        {
            break;
        }
    }
    debug!(node, "apply loop stopped");
}

struct Worker<T> {
    replica: Replica,
    transport: T,
    commands: mpsc::Receiver<Command>,
    inbox: UnboundedReceiver<Inbound>,
    timers: TimerService,
    timer_rx: UnboundedReceiver<TimerFired>,
    election: Option<TimerHandle>,
    heartbeat: Option<TimerHandle>,
    request_timers: HashMap<RequestId, TimerHandle>,
    responders: HashMap<RequestId, Responder>,
    apply_tx: UnboundedSender<LogEntry>,
    applied_rx: UnboundedReceiver<ApplyReport>,
    events: EventBus,
}

impl<T: Transport> Worker<T> {
    async fn run(mut self) {
        self.replica.start();
        self.process_ready();
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let keep_running = match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            self.stop();
                            false
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
                Some(inbound) = self.inbox.recv() => self.handle_inbound(inbound),
                Some(fired) = self.timer_rx.recv() => self.handle_timer(fired),
                Some(report) = self.applied_rx.recv() => {
                    self.replica.on_applied(report.index, report.result);
                }
            }
            self.process_ready();
        }
        info!(node = self.replica.id(), "node worker stopped");
    }

    fn stop(&mut self) {
        self.replica.shutdown();
        self.process_ready();
        self.request_timers.clear();
    }

    /// Returns `false` once the node should stop.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Submit {
                mutation,
                respond_to,
            } => {
                let request_id = nanoid!();
                match self.replica.submit(request_id.clone(), mutation) {
                    Ok(()) => {
                        let timer = self.timers.schedule_once(
                            self.replica.config().request_timeout(),
                            TimerKind::RequestExpiry(request_id.clone()),
                        );
                        self.request_timers.insert(request_id.clone(), timer);
                        self.responders.insert(request_id, respond_to);
                    }
                    Err(err) => {
                        debug!(node = self.replica.id(), %err, "request refused");
                        let _ = respond_to.send(Err(err));
                    }
                }
            }
            Command::Status { respond_to } => {
                let _ = respond_to.send(self.replica.status());
            }
            Command::Log { respond_to } => {
                let _ = respond_to.send(self.replica.log_meta());
            }
            Command::Campaign { respond_to } => {
                self.replica.campaign();
                let _ = respond_to.send(());
            }
            Command::Shutdown { respond_to } => {
                self.stop();
                let _ = respond_to.send(());
                return false;
            }
        }
        true
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Message(Envelope { from, message }) => self.replica.step(from, message),
            Inbound::PeerUp(peer) => self.replica.observe_peer(peer),
            Inbound::PeerDown(peer) => self.replica.forget_peer(peer),
        }
    }

    fn handle_timer(&mut self, fired: TimerFired) {
        let current = |handle: &Option<TimerHandle>| handle.as_ref().map(TimerHandle::id);
        match fired.kind {
            TimerKind::Election if current(&self.election) == Some(fired.id) => {
                self.election = None;
                self.replica.on_election_timeout();
            }
            TimerKind::Heartbeat if current(&self.heartbeat) == Some(fired.id) => {
                self.replica.on_heartbeat();
            }
            TimerKind::RequestExpiry(request_id)
                if self.request_timers.get(&request_id).map(TimerHandle::id) == Some(fired.id) =>
            {
                self.request_timers.remove(&request_id);
                self.replica.expire_request(&request_id);
            }
            kind => trace!(node = self.replica.id(), id = fired.id, ?kind, "stale timer"),
        }
    }

    fn process_ready(&mut self) {
        while let Some(ready) = self.replica.poll_ready() {
            for command in ready.timers {
                self.apply_timer_command(command);
            }
            let id = self.replica.id();
            for outbound in ready.messages {
                let envelope = Envelope::new(id, outbound.message);
                match outbound.to {
                    Destination::Peer(peer) => self.transport.send(peer, envelope),
                    Destination::Broadcast => self.transport.broadcast(envelope),
                }
            }
            for entry in ready.apply {
                if self.apply_tx.send(entry).is_err() {
                    warn!(node = id, "apply loop is gone");
                }
            }
            self.events.publish_batch(ready.events);
            for outcome in ready.outcomes {
                self.resolve(outcome);
            }
        }
    }

    fn apply_timer_command(&mut self, command: TimerCommand) {
        match command {
            TimerCommand::ArmElection(delay) => {
                self.election = Some(self.timers.schedule_once(delay, TimerKind::Election));
            }
            TimerCommand::DisarmElection => {
                if let Some(timer) = self.election.take() {
                    timer.cancel();
                }
            }
            TimerCommand::StartHeartbeat(period) => {
                self.heartbeat = Some(self.timers.schedule_repeating(period, TimerKind::Heartbeat));
            }
            TimerCommand::StopHeartbeat => {
                if let Some(timer) = self.heartbeat.take() {
                    timer.cancel();
                }
            }
        }
    }

    fn resolve(&mut self, outcome: ClientOutcome) {
        if let Some(timer) = self.request_timers.remove(&outcome.request_id) {
            timer.cancel();
        }
        match self.responders.remove(&outcome.request_id) {
            Some(respond_to) => {
                let _ = respond_to.send(outcome.result);
            }
            None => debug!(
                node = self.replica.id(),
                request = %outcome.request_id,
                "outcome for request with no waiting caller"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::node::Role;
    use crate::sink::MemoryFs;
    use crate::transport::LocalNetwork;

    fn fast_config() -> RaftConfig {
        RaftConfig {
            election_timeout_min_ms: 50,
            election_timeout_max_ms: 100,
            heartbeat_interval_ms: 20,
            request_timeout_ms: 2_000,
            ..RaftConfig::default()
        }
    }

    #[tokio::test]
    async fn single_node_commits_and_applies() {
        let network = LocalNetwork::new();
        let (transport, inbox) = network.join(1);
        let fs = MemoryFs::new();
        let node = spawn_node(NodeConfig::new(1, fast_config()), transport, inbox, fs.clone())
            .expect("spawn node");

        let receipt = timeout(Duration::from_secs(5), node.submit(Mutation::write("/a", "x")))
            .await
            .expect("submit finished")
            .expect("committed");
        assert_eq!(receipt.index, 1);
        assert_eq!(fs.read("/a").as_deref(), Some("x"));

        let status = node.status().await.unwrap();
        assert_eq!(status.role, Role::Leader);
        assert_eq!(status.commit_index, 1);
        assert_eq!(status.last_applied, 1);
        assert_eq!(status.pending_requests, 0);
        assert_eq!(node.log().await.unwrap().len(), 1);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let network = LocalNetwork::new();
        let (transport, inbox) = network.join(1);
        let config = RaftConfig {
            heartbeat_interval_ms: 0,
            ..RaftConfig::default()
        };
        assert!(spawn_node(NodeConfig::new(1, config), transport, inbox, MemoryFs::new()).is_err());
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails() {
        let network = LocalNetwork::new();
        let (transport, inbox) = network.join(1);
        let node = spawn_node(NodeConfig::new(1, fast_config()), transport, inbox, MemoryFs::new())
            .unwrap();
        node.shutdown().await.unwrap();
        assert_eq!(
            node.submit(Mutation::write("/a", "x")).await,
            Err(RaftError::Shutdown)
        );
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn events_announce_leadership() {
        let network = LocalNetwork::new();
        let (transport, inbox) = network.join(1);
        let node = spawn_node(NodeConfig::new(1, fast_config()), transport, inbox, MemoryFs::new())
            .unwrap();
        let mut events = node.subscribe();
        let acquired = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(RaftEvent::LeadershipAcquired { node_id, .. }) = events.recv().await {
                    return node_id;
                }
            }
        })
        .await
        .expect("leadership event");
        assert_eq!(acquired, 1);
    }
}

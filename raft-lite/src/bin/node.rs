//! CLI entry point for running a replica with an operator console.
//!
//! The node listens for peers over TCP, applies committed writes to an
//! in-memory file tree and reads console commands from stdin.
//!
//! # Example usage
//!
//! Start a 3-node cluster:
//! ```bash
//! # Terminal 1 (node 1)
//! cargo run --bin node -- \
//!   --id 1 --listen 127.0.0.1:7101 \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//!
//! # Terminal 2 (node 2)
//! cargo run --bin node -- \
//!   --id 2 --listen 127.0.0.1:7102 \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//!
//! # Terminal 3 (node 3)
//! cargo run --bin node -- \
//!   --id 3 --listen 127.0.0.1:7103 \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//! ```
//!
//! Then type `WRITE /notes/todo buy milk` on any node and `READ /notes/todo`
//! on another.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueHint};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use raft_lite::protocol::{ConsoleCommand, HELP};
use raft_lite::runtime::{spawn_node, NodeConfig, NodeHandle};
use raft_lite::sink::MemoryFs;
use raft_lite::tcp::TcpTransport;
use raft_lite::{PeerId, RaftConfig, RaftEvent};

/// Command-line arguments for a node.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run a raft-lite replica with an operator console")]
struct Args {
    /// Numeric node ID
    #[arg(long)]
    id: PeerId,

    /// Address this node listens on for peer messages, e.g. 127.0.0.1:7101
    #[arg(long, value_hint = ValueHint::Hostname)]
    listen: SocketAddr,

    /// Comma-separated peer map: id=addr,id=addr,... (may include self)
    #[arg(long, value_delimiter = ',', value_parser = parse_peer)]
    peer: Vec<(PeerId, SocketAddr)>,

    /// JSON file with timing and limit settings
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Lower bound of the randomized election timeout
    #[arg(long)]
    election_min_ms: Option<u64>,

    /// Upper bound of the randomized election timeout
    #[arg(long)]
    election_max_ms: Option<u64>,

    /// Leader heartbeat period
    #[arg(long)]
    heartbeat_ms: Option<u64>,

    /// How long a client request may stay unresolved
    #[arg(long)]
    request_timeout_ms: Option<u64>,
}

impl Args {
    fn raft_config(&self) -> Result<RaftConfig> {
        let mut config = match &self.config {
            Some(path) => RaftConfig::from_json_file(path)?,
            None => RaftConfig::default(),
        };
        if let Some(ms) = self.election_min_ms {
            config.election_timeout_min_ms = ms;
        }
        if let Some(ms) = self.election_max_ms {
            config.election_timeout_max_ms = ms;
        }
        if let Some(ms) = self.heartbeat_ms {
            config.heartbeat_interval_ms = ms;
        }
        if let Some(ms) = self.request_timeout_ms {
            config.request_timeout_ms = ms;
        }
        // Every configured member counts toward quorum from the first tick,
        // so an isolated node cannot elect itself while peers boot.
        let members = self.peers().len() + 1;
        config.cluster_size_hint = config.cluster_size_hint.max(members);
        config.validate()?;
        Ok(config)
    }

    fn peers(&self) -> HashMap<PeerId, SocketAddr> {
        self.peer
            .iter()
            .copied()
            .filter(|(id, _)| *id != self.id)
            .collect()
    }
}

fn parse_peer(entry: &str) -> Result<(PeerId, SocketAddr)> {
    let (id, addr) = entry
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid peer entry '{entry}', expected id=addr"))?;
    let id = id
        .trim()
        .parse()
        .with_context(|| format!("invalid peer id in '{entry}'"))?;
    let addr = addr
        .trim()
        .parse()
        .with_context(|| format!("invalid peer address in '{entry}'"))?;
    Ok((id, addr))
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let raft = args.raft_config()?;
    let peers = args.peers();

    let (transport, inbox, local_addr) = TcpTransport::bind(args.id, args.listen, peers).await?;
    let fs = MemoryFs::new();
    let node = spawn_node(NodeConfig::new(args.id, raft), transport, inbox, fs.clone())?;
    info!(node = args.id, %local_addr, "node started; type HELP for commands");

    tokio::spawn(log_events(node.subscribe()));

    let result = run_console(&node, &fs).await;
    node.shutdown().await?;
    result
}

async fn log_events(mut events: broadcast::Receiver<RaftEvent>) {
    loop {
        match events.recv().await {
            Ok(RaftEvent::RoleChanged {
                role,
                term,
                leader_id,
                ..
            }) => info!(%role, term, ?leader_id, "role changed"),
            Ok(RaftEvent::LeadershipAcquired { term, .. }) => info!(term, "became leader"),
            Ok(RaftEvent::EntryApplied {
                index,
                error: Some(error),
                ..
            }) => warn!(index, %error, "entry applied with error"),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
            Err(RecvError::Closed) => return,
        }
    }
}

async fn run_console(node: &NodeHandle, fs: &MemoryFs) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    loop {
        input.clear();
        select! {
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 {
                    break;
                }
                if input.trim().is_empty() {
                    continue;
                }
                match ConsoleCommand::parse(&input) {
                    Ok(ConsoleCommand::Exit) => break,
                    Ok(command) => execute(node, fs, command).await?,
                    Err(err) => println!("error: {err}"),
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn execute(node: &NodeHandle, fs: &MemoryFs, command: ConsoleCommand) -> Result<()> {
    if let Some(mutation) = command.mutation() {
        // Submitting in the background keeps the console responsive while
        // the write waits on the cluster.
        let node = node.clone();
        tokio::spawn(async move {
            match node.submit(mutation).await {
                Ok(receipt) => println!("committed at index {}", receipt.index),
                Err(err) => println!("rejected: {} ({err})", err.reason()),
            }
        });
        return Ok(());
    }

    match command {
        ConsoleCommand::Read { path } => match fs.read(&path) {
            Some(content) => println!("{path}: {content}"),
            None => println!("{path}: <not found>"),
        },
        ConsoleCommand::Status => {
            let status = node.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        ConsoleCommand::Log => {
            let entries = node.log().await?;
            if entries.is_empty() {
                println!("log is empty");
            }
            for entry in entries {
                println!(
                    "#{} term={} kind={:?} request={} origin={}",
                    entry.index,
                    entry.term,
                    entry.kind,
                    entry.request_id.as_deref().unwrap_or("-"),
                    entry
                        .origin_id
                        .map_or_else(|| "-".to_string(), |id| id.to_string()),
                );
            }
        }
        ConsoleCommand::Campaign => {
            node.campaign().await?;
            println!("election started");
        }
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Write { .. } | ConsoleCommand::Delete { .. } | ConsoleCommand::Exit => {}
    }
    Ok(())
}

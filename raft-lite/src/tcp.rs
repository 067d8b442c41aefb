//! TCP transport for replicas running as separate processes.
//!
//! Envelopes are written as newline-delimited JSON, one connection per
//! message. Each replica knows its peers' addresses up front; a peer is
//! reported down after a failed send and up again after a successful one.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::message::Envelope;
use crate::transport::{Inbound, Transport};
use crate::PeerId;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub struct TcpTransport {
    id: PeerId,
    peers: HashMap<PeerId, SocketAddr>,
    reachable: Arc<Mutex<HashSet<PeerId>>>,
    inbox: UnboundedSender<Inbound>,
}

impl TcpTransport {
    /// Binds `listen` and starts accepting envelopes from peers.
    ///
    /// Returns the transport, the inbox to hand to the node, and the bound
    /// address (useful when `listen` asks for port 0).
    pub async fn bind(
        id: PeerId,
        listen: SocketAddr,
        peers: HashMap<PeerId, SocketAddr>,
    ) -> Result<(Self, UnboundedReceiver<Inbound>, SocketAddr)> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind {listen}"))?;
        let local_addr = listener.local_addr()?;
        let (inbox, rx) = mpsc::unbounded_channel();

        let peers: HashMap<PeerId, SocketAddr> =
            peers.into_iter().filter(|(peer, _)| *peer != id).collect();
        for &peer in peers.keys() {
            let _ = inbox.send(Inbound::PeerUp(peer));
        }
        info!(node = id, %local_addr, peers = peers.len(), "listening for peers");

        tokio::spawn(accept_loop(listener, inbox.clone()));
        let transport = Self {
            id,
            reachable: Arc::new(Mutex::new(peers.keys().copied().collect())),
            peers,
            inbox,
        };
        Ok((transport, rx, local_addr))
    }

    /// Peers that answered the most recent send.
    pub fn reachable_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = lock(&self.reachable).iter().copied().collect();
        peers.sort_unstable();
        peers
    }
}

impl Transport for TcpTransport {
    fn send(&self, to: PeerId, envelope: Envelope) {
        let Some(&addr) = self.peers.get(&to) else {
            debug!(node = self.id, peer = to, "no address for peer");
            return;
        };
        let reachable = Arc::clone(&self.reachable);
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = deliver(addr, &envelope).await;
            let mut reachable = lock(&reachable);
            match result {
                Ok(()) => {
                    if reachable.insert(to) {
                        info!(peer = to, %addr, "peer reachable");
                        let _ = inbox.send(Inbound::PeerUp(to));
                    }
                }
                Err(err) => {
                    if reachable.remove(&to) {
                        warn!(peer = to, %addr, error = %err, "peer unreachable");
                        let _ = inbox.send(Inbound::PeerDown(to));
                    } else {
                        debug!(peer = to, %addr, error = %err, "send failed");
                    }
                }
            }
        });
    }

    fn broadcast(&self, envelope: Envelope) {
        let targets: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer in targets {
            self.send(peer, envelope.clone());
        }
    }
}

async fn deliver(addr: SocketAddr, envelope: &Envelope) -> io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    write_message(&mut stream, envelope).await?;
    stream.shutdown().await
}

async fn accept_loop(listener: TcpListener, inbox: UnboundedSender<Inbound>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        let conn_inbox = inbox.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            loop {
                match read_message::<_, Envelope>(&mut reader).await {
                    Ok(Some(envelope)) => {
                        if conn_inbox.send(Inbound::Message(envelope)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(err) => {
                        debug!(%remote, error = %err, "dropping malformed frame");
                        return;
                    }
                }
            }
        });
        if inbox.is_closed() {
            return;
        }
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }
        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

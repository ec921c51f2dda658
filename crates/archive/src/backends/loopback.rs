//! In-process swarm and replication protocol.
//!
//! Remote peers are created with [`LoopbackSwarm::dial`]; each gets one end of
//! an in-memory duplex pipe while the other end is handed to whoever calls
//! [`Swarm::accept`]. On the wire, the local side greets with
//! `hello <network id>` and the remote side asks for archives with
//! `feed <discovery key>`, one command per line.

use crate::error::{ArchiveError, ArchiveResult};
use crate::traits::{
    PeerConnection, PeerInfo, Protocol, ProtocolSession, ReplicationStream, StreamEvent,
    StreamOptions, Swarm,
};
use async_trait::async_trait;
use pinfold_core::DiscoveryKey;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const PIPE_CAPACITY: usize = 64 * 1024;

// =============================================================================
// Swarm
// =============================================================================

/// Swarm whose only peers are the ones dialed in-process.
pub struct LoopbackSwarm {
    channels: Mutex<HashSet<DiscoveryKey>>,
    listens: AtomicUsize,
    leaves: AtomicUsize,
    listen_failure: Mutex<Option<String>>,
    incoming_tx: mpsc::UnboundedSender<PeerConnection>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PeerConnection>>,
    shutdown: CancellationToken,
}

impl Default for LoopbackSwarm {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackSwarm {
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            channels: Mutex::new(HashSet::new()),
            listens: AtomicUsize::new(0),
            leaves: AtomicUsize::new(0),
            listen_failure: Mutex::new(None),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            shutdown: CancellationToken::new(),
        }
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, HashSet<DiscoveryKey>> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a connection from a new remote peer.
    pub fn dial(&self, peer_id: impl Into<String>) -> RemotePeer {
        let info = PeerInfo {
            id: peer_id.into(),
            address: None,
        };
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let connection = PeerConnection {
            info: info.clone(),
            io: Box::new(local),
        };
        if self.incoming_tx.send(connection).is_err() {
            debug!(peer = %info.id, "Swarm receiver gone; connection dropped");
        }

        let (reader, writer) = tokio::io::split(remote);
        RemotePeer {
            info,
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Whether this node currently announces `key`.
    pub fn is_listening(&self, key: &DiscoveryKey) -> bool {
        self.channels().contains(key)
    }

    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }

    /// Total `listen` calls, including repeats.
    pub fn listen_count(&self) -> usize {
        self.listens.load(Ordering::SeqCst)
    }

    /// Total `leave` calls, including repeats.
    pub fn leave_count(&self) -> usize {
        self.leaves.load(Ordering::SeqCst)
    }

    /// Make the next `listen` fail with `reason` without joining.
    pub fn fail_next_listen(&self, reason: impl Into<String>) {
        *self
            .listen_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason.into());
    }

    /// Stop handing out connections. Pending and future `accept` calls
    /// return `None`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Swarm for LoopbackSwarm {
    async fn listen(&self, key: &DiscoveryKey) -> ArchiveResult<()> {
        self.listens.fetch_add(1, Ordering::SeqCst);
        let failure = self
            .listen_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(reason) = failure {
            return Err(ArchiveError::Protocol(reason));
        }
        self.channels().insert(*key);
        trace!(channel = %key, "Joined swarm channel");
        Ok(())
    }

    async fn leave(&self, key: &DiscoveryKey) -> ArchiveResult<()> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        self.channels().remove(key);
        trace!(channel = %key, "Left swarm channel");
        Ok(())
    }

    async fn accept(&self) -> Option<PeerConnection> {
        let mut incoming = self.incoming_rx.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            connection = incoming.recv() => connection,
        }
    }
}

/// The remote end of a dialed connection.
pub struct RemotePeer {
    info: PeerInfo,
    reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
    writer: tokio::io::WriteHalf<DuplexStream>,
}

impl RemotePeer {
    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    /// Ask the local node to replicate the archive with discovery key `key`.
    pub async fn request(&mut self, key: &DiscoveryKey) -> std::io::Result<()> {
        self.send_line(&format!("feed {}", key.to_hex())).await
    }

    /// Write an arbitrary protocol line.
    pub async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Read the local side's greeting and return the network id it carried.
    pub async fn read_greeting(&mut self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(line.trim().strip_prefix("hello ").map(str::to_string))
    }

    /// Wait until the local side closes the connection.
    pub async fn wait_closed(&mut self) -> std::io::Result<()> {
        let mut sink = Vec::new();
        self.reader.read_to_end(&mut sink).await?;
        Ok(())
    }

    /// Close this end of the connection.
    pub async fn hang_up(mut self) -> std::io::Result<()> {
        self.writer.shutdown().await
    }
}

// =============================================================================
// Protocol
// =============================================================================

/// Line protocol spoken over loopback connections.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoopbackProtocol;

impl Protocol for LoopbackProtocol {
    fn open(&self, connection: PeerConnection, options: StreamOptions) -> ProtocolSession {
        let stream = Arc::new(LoopbackStream {
            id: options.id,
            peer: connection.info.clone(),
            destroy: CancellationToken::new(),
            closed: CancellationToken::new(),
        });
        let (events_tx, events) = mpsc::unbounded_channel();

        tokio::spawn(drive(connection, options, stream.clone(), events_tx));

        ProtocolSession { stream, events }
    }
}

struct LoopbackStream {
    id: u64,
    peer: PeerInfo,
    destroy: CancellationToken,
    closed: CancellationToken,
}

#[async_trait]
impl ReplicationStream for LoopbackStream {
    fn id(&self) -> u64 {
        self.id
    }

    fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    fn destroy(&self) {
        self.destroy.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }
}

fn parse_line(line: &str) -> Result<Option<DiscoveryKey>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    match line.split_once(' ') {
        Some(("feed", hex)) => DiscoveryKey::from_hex(hex.trim())
            .map(Some)
            .map_err(|e| format!("bad feed request: {e}")),
        _ => Err(format!("unknown message: {line:?}")),
    }
}

async fn drive(
    connection: PeerConnection,
    options: StreamOptions,
    stream: Arc<LoopbackStream>,
    events: mpsc::UnboundedSender<StreamEvent>,
) {
    let (reader, mut writer) = tokio::io::split(connection.io);

    let greeting = format!("hello {}\n", hex::encode(options.network_id));
    match writer.write_all(greeting.as_bytes()).await {
        Ok(()) => {
            let _ = events.send(StreamEvent::Handshake);
        }
        Err(e) => {
            let _ = events.send(StreamEvent::Error(format!("handshake failed: {e}")));
        }
    }

    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = stream.destroy.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => match parse_line(&line) {
                    Ok(Some(key)) => {
                        let _ = events.send(StreamEvent::Feed(key));
                    }
                    Ok(None) => {}
                    Err(message) => {
                        let _ = events.send(StreamEvent::Error(message));
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    let _ = events.send(StreamEvent::Error(e.to_string()));
                    break;
                }
            },
        }
    }

    let _ = writer.shutdown().await;
    drop(writer);
    drop(lines);
    stream.closed.cancel();
    let _ = events.send(StreamEvent::Close);
    debug!(stream = stream.id, peer = %stream.peer.id, "Replication stream closed");
}

//! Replication connection multiplexer.
//!
//! Every inbound peer connection becomes one live replication stream. The
//! peer then names the vaults it wants by discovery key, and the same
//! stream is attached to each of them that this node has loaded.

use super::handle::VaultHandle;
use super::Vaultr;
use crate::metrics::{FLOCK_FALLBACK, REPLICATION_STREAMS_ACTIVE, record_connection_event};
use pinfold_archive::{
    PeerConnection, PeerInfo, ProtocolSession, ReplicateOptions, ReplicationStream, StreamEvent,
    StreamOptions,
};
use pinfold_core::{DiscoveryKey, FlockIntent};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Peer connection lifecycle, broadcast for observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened {
        stream_id: u64,
        peer: PeerInfo,
    },
    Errored {
        stream_id: u64,
        peer: PeerInfo,
        message: String,
    },
    Closed {
        stream_id: u64,
        peer: PeerInfo,
    },
}

impl Vaultr {
    /// Accept peer connections until shutdown.
    pub fn start_multiplexer(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            info!("Replication multiplexer started");
            loop {
                let connection = tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    connection = engine.archives.swarm.accept() => match connection {
                        Some(connection) => connection,
                        None => break,
                    },
                };
                engine.handle_connection(connection);
            }
            info!("Replication multiplexer stopped");
        })
    }

    /// Wrap `connection` in a replication stream and serve its requests.
    pub fn handle_connection(
        self: &Arc<Self>,
        connection: PeerConnection,
    ) -> Arc<dyn ReplicationStream> {
        let options = StreamOptions {
            id: self.next_stream_id.fetch_add(1, Ordering::SeqCst),
            network_id: self.network_id,
            live: true,
            encrypt: true,
        };
        let session = self.archives.protocol.open(connection, options);
        let stream = session.stream.clone();

        debug!(stream = stream.id(), peer = %stream.peer().id, "Peer connected");
        record_connection_event("opened");
        self.emit(ConnectionEvent::Opened {
            stream_id: stream.id(),
            peer: stream.peer().clone(),
        });

        let engine = self.clone();
        tokio::spawn(async move { engine.drive_session(session).await });
        stream
    }

    async fn drive_session(self: Arc<Self>, session: ProtocolSession) {
        let ProtocolSession { stream, mut events } = session;
        let mut attached: Vec<Weak<VaultHandle>> = Vec::new();

        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Handshake => {
                    trace!(stream = stream.id(), "Handshake sent");
                }
                StreamEvent::Feed(dkey) => {
                    if let Some(handle) = self.attach(&stream, &dkey) {
                        attached.push(Arc::downgrade(&handle));
                    }
                }
                StreamEvent::Error(message) => {
                    warn!(
                        stream = stream.id(),
                        peer = %stream.peer().id,
                        error = %message,
                        "Replication stream error"
                    );
                    record_connection_event("errored");
                    self.emit(ConnectionEvent::Errored {
                        stream_id: stream.id(),
                        peer: stream.peer().clone(),
                        message,
                    });
                }
                StreamEvent::Close => break,
            }
        }

        for handle in attached.iter().filter_map(Weak::upgrade) {
            if handle.remove_stream(stream.id()) {
                REPLICATION_STREAMS_ACTIVE.dec();
            }
        }

        debug!(stream = stream.id(), peer = %stream.peer().id, "Peer disconnected");
        record_connection_event("closed");
        self.emit(ConnectionEvent::Closed {
            stream_id: stream.id(),
            peer: stream.peer().clone(),
        });
    }

    /// Attach `stream` to the loaded vault with discovery key `dkey`.
    /// Requests for vaults this node does not serve, or that are closing,
    /// are ignored.
    fn attach(
        &self,
        stream: &Arc<dyn ReplicationStream>,
        dkey: &DiscoveryKey,
    ) -> Option<Arc<VaultHandle>> {
        let Some(handle) = self.registry.get_by_discovery(dkey) else {
            trace!(stream = stream.id(), channel = %dkey, "Requested vault not loaded");
            return None;
        };
        if handle.closing().is_cancelled() {
            trace!(vault = %handle.key(), stream = stream.id(), "Requested vault is closing");
            return None;
        }
        if handle.has_stream(stream.id()) {
            return None;
        }

        let intent = match handle.flock_intent() {
            Some(intent) => intent,
            None => {
                warn!(
                    vault = %handle.key(),
                    stream = stream.id(),
                    "Replication requested for a vault with no flock intent, replicating fully"
                );
                FLOCK_FALLBACK.inc();
                FlockIntent::FULL
            }
        };

        let options = ReplicateOptions {
            upload: intent.upload,
            download: intent.download,
            live: true,
        };
        if let Err(e) = handle.archive().replicate(stream.clone(), options) {
            warn!(
                vault = %handle.key(),
                stream = stream.id(),
                error = %e,
                "Failed to attach stream"
            );
            return None;
        }
        if !handle.add_stream(stream.clone()) {
            return None;
        }
        REPLICATION_STREAMS_ACTIVE.inc();
        // Close may have started and taken the stream set since the check above.
        if handle.closing().is_cancelled() {
            if handle.remove_stream(stream.id()) {
                REPLICATION_STREAMS_ACTIVE.dec();
            }
            return None;
        }

        debug!(
            vault = %handle.key(),
            stream = stream.id(),
            upload = intent.upload,
            download = intent.download,
            "Stream attached"
        );
        Some(handle)
    }

    fn emit(&self, event: ConnectionEvent) {
        // No observers is fine.
        let _ = self.connections.send(event);
    }
}

//! LAN peer discovery via UDP broadcast.
//!
//! The [`DiscoveryService`] periodically broadcasts an announcement on the
//! local network and listens for announcements from other peers. The first
//! announcement from an unseen peer records it in the registry and fires the
//! discovery callback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::codec::DataCompressor;
use crate::config::DiscoveryConfig;
use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::message::{DiscoveryMessage, PeerMetadata};
use crate::registry::{DiscoveredPeer, PeerRegistry};

/// Callback invoked once per newly discovered peer.
pub type DiscoveryCallback = Arc<dyn Fn(&PeerId, &PeerMetadata) + Send + Sync>;

/// What the listener did with one datagram.
#[derive(Debug)]
pub enum DatagramOutcome {
    /// A new peer was registered and the callback fired.
    Discovered(PeerId),
    /// The peer was already registered.
    AlreadyKnown(PeerId),
    /// Our own announcement looped back.
    OwnAnnouncement,
    /// A `response` message, accepted and not acted upon.
    ResponseIgnored,
    /// The datagram was dropped.
    Rejected(NetworkError),
}

/// Counters for the announce loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceStats {
    /// Announcements handed to the socket.
    pub sent: u64,
    /// Send attempts that failed and were retried after the backoff.
    pub failed: u64,
}

/// State shared between the service handle and its background tasks.
struct Shared {
    peer_id: PeerId,
    codec: DataCompressor,
    max_datagram_size: usize,
    registry: RwLock<PeerRegistry>,
    callback: RwLock<Option<DiscoveryCallback>>,
    running: AtomicBool,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    /// Decode one datagram and apply it to the registry.
    fn handle_datagram(&self, bytes: &[u8], src: SocketAddr) -> DatagramOutcome {
        if bytes.len() > self.max_datagram_size {
            return DatagramOutcome::Rejected(NetworkError::Oversized {
                len: bytes.len(),
                max: self.max_datagram_size,
            });
        }

        let message = match self.codec.decode::<DiscoveryMessage>(bytes) {
            Ok(message) => message,
            Err(e) => {
                return DatagramOutcome::Rejected(NetworkError::Protocol(format!(
                    "Undecodable datagram from {src}: {e}"
                )));
            }
        };

        let id = match message {
            DiscoveryMessage::Announce { id, .. } => id,
            DiscoveryMessage::Response { .. } => return DatagramOutcome::ResponseIgnored,
        };

        if id == self.peer_id {
            return DatagramOutcome::OwnAnnouncement;
        }

        let metadata = PeerMetadata::from_socket_addr(src);
        let inserted = self
            .registry
            .write()
            .insert_if_absent(id.clone(), metadata.clone());
        if !inserted {
            return DatagramOutcome::AlreadyKnown(id);
        }

        // Clone out of the lock so the callback may re-register.
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(&id, &metadata);
        }
        DatagramOutcome::Discovered(id)
    }

    async fn send_announcement(
        &self,
        socket: &UdpSocket,
        target: SocketAddr,
    ) -> Result<usize, NetworkError> {
        let bytes = self
            .codec
            .encode(&DiscoveryMessage::announce(self.peer_id.clone()))?;
        socket
            .send_to(&bytes, target)
            .await
            .map_err(|e| NetworkError::Transport(format!("Send to {target} failed: {e}")))
    }
}

/// LAN discovery service using UDP broadcast.
///
/// Owns one socket while running: acquired by [`start()`](Self::start),
/// released by [`stop()`](Self::stop). The registry outlives restarts.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    shared: Arc<Shared>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl DiscoveryService {
    pub fn new(peer_id: PeerId, config: DiscoveryConfig) -> Self {
        let limit = config.datagram_limit();
        if limit != config.max_datagram_size {
            warn!(
                "max_datagram_size {} out of range, using {limit}",
                config.max_datagram_size
            );
        }
        let shared = Shared {
            peer_id,
            codec: DataCompressor::new(config.compression),
            max_datagram_size: limit,
            registry: RwLock::new(PeerRegistry::new()),
            callback: RwLock::new(None),
            running: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        };
        Self {
            config,
            shared: Arc::new(shared),
            shutdown_tx: None,
            tasks: Vec::new(),
            local_addr: None,
        }
    }

    /// Create a service with a fresh peer id and default config.
    pub fn with_defaults() -> Self {
        Self::new(PeerId::generate(), DiscoveryConfig::default())
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.shared.peer_id
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// The bound socket address, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Register the discovery callback, replacing any previous one.
    pub fn on_peer_discovered<F>(&self, callback: F)
    where
        F: Fn(&PeerId, &PeerMetadata) + Send + Sync + 'static,
    {
        *self.shared.callback.write() = Some(Arc::new(callback));
    }

    /// Snapshot of all discovered peers, oldest first.
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.shared
            .registry
            .read()
            .list_all()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn is_known(&self, peer_id: &PeerId) -> bool {
        self.shared.registry.read().contains(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.shared.registry.read().len()
    }

    pub fn announce_stats(&self) -> AnnounceStats {
        AnnounceStats {
            sent: self.shared.sent.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Compressed/original byte ratio over every announcement sent so far.
    pub fn compression_ratio(&self) -> f64 {
        self.shared.codec.compression_ratio()
    }

    /// Bind the socket and spawn the announce and listen loops.
    ///
    /// Calling `start` on a running service does nothing.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.is_running() {
            return Ok(());
        }

        let bind_addr = self.config.bind_socket_addr();
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| NetworkError::Discovery(format!("Bind {bind_addr} failed: {e}")))?;
        socket
            .set_broadcast(true)
            .map_err(|e| NetworkError::Discovery(format!("Set broadcast: {e}")))?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let (shutdown_tx, _) = broadcast::channel(4);
        self.shared.running.store(true, Ordering::SeqCst);

        let announcer = tokio::spawn(announce_loop(
            Arc::clone(&self.shared),
            Arc::clone(&socket),
            self.config.broadcast_target(),
            self.config.announce_interval,
            self.config.retry_backoff,
            shutdown_tx.subscribe(),
        ));
        let listener = tokio::spawn(listen_loop(
            Arc::clone(&self.shared),
            socket,
            shutdown_tx.subscribe(),
        ));

        self.tasks = vec![announcer, listener];
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        info!(
            "Discovery service {} listening on {local_addr}, announcing to {}",
            self.shared.peer_id,
            self.config.broadcast_target()
        );
        Ok(())
    }

    /// Stop both loops and release the socket. Does nothing when stopped.
    pub async fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Discovery task ended abnormally: {e}");
            }
        }
        self.local_addr = None;

        info!("Discovery service {} stopped", self.shared.peer_id);
    }
}

async fn announce_loop(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    interval: Duration,
    retry_backoff: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    while shared.running.load(Ordering::SeqCst) {
        let wait = match shared.send_announcement(&socket, target).await {
            Ok(len) => {
                shared.sent.fetch_add(1, Ordering::Relaxed);
                trace!("Announcement sent to {target} ({len} bytes)");
                interval
            }
            Err(e) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Announcement failed, retrying in {retry_backoff:?}: {e}");
                retry_backoff
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.recv() => break,
        }
    }
    debug!("Discovery announcer shutting down");
}

async fn listen_loop(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; shared.max_datagram_size + 1];
    while shared.running.load(Ordering::SeqCst) {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => match shared.handle_datagram(&buf[..len], src) {
                        DatagramOutcome::Discovered(id) => info!("Discovered peer {id} at {src}"),
                        DatagramOutcome::AlreadyKnown(id) => trace!("Repeat announcement from {id}"),
                        DatagramOutcome::OwnAnnouncement => trace!("Skipping own announcement"),
                        DatagramOutcome::ResponseIgnored => trace!("Ignoring response from {src}"),
                        DatagramOutcome::Rejected(e) => debug!("Dropped datagram from {src}: {e}"),
                    },
                    Err(e) => warn!("Discovery recv error: {e}"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
    debug!("Discovery listener shutting down");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

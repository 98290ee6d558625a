//! Peercast Net: LAN peer discovery and network error recovery.
//!
//! Processes on the same network segment find each other by periodically
//! broadcasting a small announcement over UDP. Failed network operations are
//! routed through an error middleware that can restore per-peer state
//! snapshots or hand the failure to a recovery strategy.
//!
//! # Architecture
//!
//! - **Discovery**: an announce loop and a listen loop sharing one UDP socket.
//! - **Registry**: grow-only set of peers seen so far.
//! - **Codec**: JSON payloads, optionally zlib or lz4 compressed.
//! - **Middleware**: per-peer snapshots plus classify-and-dispatch recovery.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use peercast_net::{DiscoveryConfig, DiscoveryService, PeerId};
//!
//! # async fn example() {
//! let mut service = DiscoveryService::new(PeerId::generate(), DiscoveryConfig::default());
//! service.on_peer_discovered(|id, meta| println!("found {id} at {}", meta.address));
//!
//! service.start().await.unwrap();
//! // ... announcements go out, peers are discovered ...
//! service.stop().await;
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod message;
pub mod middleware;
pub mod recovery;
pub mod registry;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use codec::{CompressionType, DataCompressor, Payload};
pub use config::DiscoveryConfig;
pub use discovery::{AnnounceStats, DatagramOutcome, DiscoveryService};
pub use error::{CodecError, NetworkError};
pub use identity::{NodeIdentity, PeerId};
pub use message::{DiscoveryMessage, PeerMetadata};
pub use middleware::{ErrorKind, ErrorReport, NetworkContext, NetworkErrorMiddleware, UnknownKind};
pub use recovery::{ConnectionRecovery, DataRepair, RecoveryError, RecoveryStrategy, SyncRecovery};
pub use registry::{DiscoveredPeer, PeerRegistry};

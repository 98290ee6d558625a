//! Discovery wire protocol: one JSON object per datagram, tagged by `type`.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// A message carried in a single discovery datagram.
///
/// Wire form: `{"type": "announce", "id": "<peer id>", "timestamp": 1712345678.25}`.
/// Any `type` other than the variants below fails to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    /// Periodic self-announcement.
    Announce {
        /// The announcing peer's identifier.
        id: PeerId,
        /// Send time in seconds since the UNIX epoch.
        timestamp: f64,
    },
    /// Reserved for directed replies. Any fields it carries are ignored.
    Response {},
}

impl DiscoveryMessage {
    /// Build an announcement for `id` stamped with the current time.
    pub fn announce(id: PeerId) -> Self {
        Self::Announce {
            id,
            timestamp: unix_timestamp(),
        }
    }

    /// The wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Announce { .. } => "announce",
            Self::Response { .. } => "response",
        }
    }
}

/// Metadata handed to the discovery callback alongside the peer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetadata {
    /// Sender IP address in text form.
    pub address: String,
    /// Source UDP port of the announcement.
    pub port: u16,
}

impl PeerMetadata {
    pub fn from_socket_addr(addr: std::net::SocketAddr) -> Self {
        Self {
            address: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

/// Current time as fractional seconds since the UNIX epoch.
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

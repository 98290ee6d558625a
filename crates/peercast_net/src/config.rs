//! Discovery configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CompressionType;
use crate::error::NetworkError;

/// Default discovery port, shared by the listener and the announcement target.
pub const DEFAULT_PORT: u16 = 5353;
/// Default largest datagram the listener accepts.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1024;
/// Largest payload of a UDP datagram over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Configuration for the discovery service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Local address to bind the UDP socket on.
    pub bind_addr: IpAddr,

    /// UDP port to listen on; also the announcement port unless
    /// `announce_port` is set.
    pub port: u16,

    /// Destination address for announcements.
    pub broadcast_addr: IpAddr,

    /// Destination port override for announcements.
    pub announce_port: Option<u16>,

    /// Wait between successful announcements.
    #[serde(rename = "announce_interval_ms", with = "duration_ms_serde")]
    pub announce_interval: Duration,

    /// Wait after a failed announcement before retrying.
    #[serde(rename = "retry_backoff_ms", with = "duration_ms_serde")]
    pub retry_backoff: Duration,

    /// Largest datagram the listener accepts; longer ones are dropped.
    /// Values outside `1..=65507` are clamped, see [`Self::datagram_limit`].
    pub max_datagram_size: usize,

    /// Codec strategy used for every datagram sent and received.
    pub compression: CompressionType,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            announce_port: None,
            announce_interval: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(1),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            compression: CompressionType::None,
        }
    }
}

impl DiscoveryConfig {
    /// Address the listener socket binds to.
    pub fn bind_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Address announcements are sent to.
    pub fn broadcast_target(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_addr, self.announce_port.unwrap_or(self.port))
    }

    /// Largest datagram the listener will accept: `max_datagram_size`
    /// clamped to what a UDP/IPv4 datagram can carry.
    pub fn datagram_limit(&self) -> usize {
        self.max_datagram_size.clamp(1, MAX_UDP_PAYLOAD)
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is missing
    /// or corrupt. Fields absent from the file keep their defaults.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<DiscoveryConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }

    /// Apply `PEERCAST_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup. Unparsable values are
    /// logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PEERCAST_PORT") {
            match v.parse::<u16>() {
                Ok(port) => self.port = port,
                Err(e) => tracing::warn!("Ignoring PEERCAST_PORT={v}: {e}"),
            }
        }
        if let Some(v) = lookup("PEERCAST_BROADCAST_ADDR") {
            match v.parse::<IpAddr>() {
                Ok(addr) => self.broadcast_addr = addr,
                Err(e) => tracing::warn!("Ignoring PEERCAST_BROADCAST_ADDR={v}: {e}"),
            }
        }
        if let Some(v) = lookup("PEERCAST_ANNOUNCE_INTERVAL_MS") {
            match v.parse::<u64>() {
                Ok(ms) => self.announce_interval = Duration::from_millis(ms),
                Err(e) => tracing::warn!("Ignoring PEERCAST_ANNOUNCE_INTERVAL_MS={v}: {e}"),
            }
        }
        if let Some(v) = lookup("PEERCAST_COMPRESSION") {
            match v.parse::<CompressionType>() {
                Ok(compression) => self.compression = compression,
                Err(e) => tracing::warn!("Ignoring PEERCAST_COMPRESSION={v}: {e}"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

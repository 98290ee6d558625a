//! Peer registry: the grow-only set of peers seen on the LAN.
//!
//! Entries are never removed or refreshed: the first announcement from a peer
//! fixes its entry for the lifetime of the registry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;
use crate::message::PeerMetadata;

/// A peer recorded by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    /// The peer's unique identifier.
    pub id: PeerId,
    /// Where the first announcement came from.
    pub metadata: PeerMetadata,
    /// When the first announcement was received.
    pub first_seen: DateTime<Utc>,
}

/// Registry of all peers discovered so far.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, DiscoveredPeer>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Record `id` unless it is already known. Returns `true` iff the peer
    /// was newly inserted.
    pub fn insert_if_absent(&mut self, id: PeerId, metadata: PeerMetadata) -> bool {
        if self.peers.contains_key(&id) {
            return false;
        }
        self.peers.insert(
            id.clone(),
            DiscoveredPeer {
                id,
                metadata,
                first_seen: Utc::now(),
            },
        );
        true
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&DiscoveredPeer> {
        self.peers.get(id)
    }

    /// List all known peers, oldest first.
    pub fn list_all(&self) -> Vec<&DiscoveredPeer> {
        let mut peers: Vec<&DiscoveredPeer> = self.peers.values().collect();
        peers.sort_by_key(|p| p.first_seen);
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(addr: &str) -> PeerMetadata {
        PeerMetadata {
            address: addr.to_string(),
            port: 5353,
        }
    }

    #[test]
    fn test_insert_new_peer() {
        let mut registry = PeerRegistry::new();
        let id = PeerId::from_string("alpha");

        assert!(registry.insert_if_absent(id.clone(), meta("10.0.0.1")));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&id));
        assert_eq!(registry.get(&id).unwrap().metadata.address, "10.0.0.1");
    }

    #[test]
    fn test_repeat_insert_is_rejected_and_first_seen_wins() {
        let mut registry = PeerRegistry::new();
        let id = PeerId::from_string("beta");

        assert!(registry.insert_if_absent(id.clone(), meta("10.0.0.2")));
        let first_seen = registry.get(&id).unwrap().first_seen;

        assert!(!registry.insert_if_absent(id.clone(), meta("10.0.0.99")));
        assert_eq!(registry.len(), 1);
        let entry = registry.get(&id).unwrap();
        assert_eq!(entry.metadata.address, "10.0.0.2");
        assert_eq!(entry.first_seen, first_seen);
    }

    #[test]
    fn test_list_all_in_discovery_order() {
        let mut registry = PeerRegistry::new();
        assert!(registry.is_empty());

        for name in ["gamma", "delta", "epsilon"] {
            registry.insert_if_absent(PeerId::from_string(name), meta("10.0.0.3"));
        }

        let listed = registry.list_all();
        assert_eq!(listed.len(), 3);
        assert!(listed.windows(2).all(|w| w[0].first_seen <= w[1].first_seen));
    }
}

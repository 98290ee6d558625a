//! Node identity: the peer id announced on the wire and its on-disk record.

use std::fmt;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::NetworkError;

/// Opaque peer identifier. Serialized as a bare string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Mint a fresh random id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Use a caller-chosen id, e.g. a persisted one or a fixed test id.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a daemon remembers about itself between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub peer_id: PeerId,
    pub name: String,
    /// Version of the build that created the record.
    pub version: String,
}

impl NodeIdentity {
    pub fn generate(name: impl Into<String>) -> Self {
        Self {
            peer_id: PeerId::generate(),
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Write the record as pretty JSON. The file is replaced atomically, so a
    /// crash mid-write leaves the previous record intact.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let staging = sibling(path, "tmp");
        std::fs::write(&staging, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&staging, path)?;
        Ok(())
    }

    /// Read a record. `Ok(None)` means there is no file yet; unreadable or
    /// malformed files are errors.
    pub fn load(path: &Path) -> Result<Option<Self>, NetworkError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let identity: Self = serde_json::from_slice(&data)?;
        if identity.peer_id.as_str().trim().is_empty() {
            return Err(NetworkError::Serialization(serde::de::Error::custom(
                "peer_id is empty",
            )));
        }
        Ok(Some(identity))
    }

    /// Load the record at `path`, or mint and persist a new one.
    ///
    /// A file that exists but cannot be used is moved aside to
    /// `<file>.corrupt` before being replaced.
    pub fn load_or_generate(path: &Path, name: impl Into<String>) -> Self {
        match Self::load(path) {
            Ok(Some(identity)) => {
                debug!("Loaded identity {} from {}", identity.peer_id, path.display());
                return identity;
            }
            Ok(None) => info!("No identity at {}, generating one", path.display()),
            Err(e) => {
                warn!("Unusable identity file {}: {e}", path.display());
                let aside = sibling(path, "corrupt");
                match std::fs::rename(path, &aside) {
                    Ok(()) => warn!("Moved unusable identity to {}", aside.display()),
                    Err(e) => warn!("Could not move unusable identity aside: {e}"),
                }
            }
        }

        let identity = Self::generate(name);
        if let Err(e) = identity.save_to_file(path) {
            warn!("Failed to persist new identity: {e}");
        }
        identity
    }
}

/// `identity.json` -> `identity.json.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_peer_id_is_a_bare_string_on_the_wire() {
        let id = PeerId::from_string("abc");
        assert_eq!(id.to_string(), "abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        let back: PeerId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let original = NodeIdentity::generate("persist-test");
        original.save_to_file(&path).unwrap();

        assert_eq!(NodeIdentity::load(&path).unwrap(), Some(original));
        assert!(!sibling(&path, "tmp").exists());
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = NodeIdentity::load(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_malformed_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            NodeIdentity::load(&path),
            Err(NetworkError::Serialization(_))
        ));

        std::fs::write(&path, r#"{"peer_id":"  ","name":"n","version":"0"}"#).unwrap();
        assert!(matches!(
            NodeIdentity::load(&path),
            Err(NetworkError::Serialization(_))
        ));
    }

    #[test]
    fn test_missing_file_generates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity.json");

        let first = NodeIdentity::load_or_generate(&path, "new-node");
        assert_eq!(first.name, "new-node");
        assert!(path.exists());

        // A restart reuses the same id.
        let second = NodeIdentity::load_or_generate(&path, "ignored");
        assert_eq!(second.peer_id, first.peer_id);
        assert!(!sibling(&path, "corrupt").exists());
    }

    #[test]
    fn test_corrupt_file_is_moved_aside_and_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, "not json").unwrap();

        let identity = NodeIdentity::load_or_generate(&path, "recovered");
        assert_eq!(identity.name, "recovered");

        let aside = sibling(&path, "corrupt");
        assert_eq!(std::fs::read_to_string(aside).unwrap(), "not json");
        assert_eq!(NodeIdentity::load(&path).unwrap(), Some(identity));
    }
}

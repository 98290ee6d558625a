//! Recovery strategies for classified network errors.
//!
//! A strategy inspects an [`ErrorReport`], records what the caller should do
//! next into `report.data`, and answers whether the error is recoverable.
//! Keys written back:
//!
//! | strategy            | keys                                                        |
//! |---------------------|-------------------------------------------------------------|
//! | [`ConnectionRecovery`] | `reconnect_attempt`, `retry_after_ms`, `reconnect_exhausted` |
//! | [`SyncRecovery`]       | `resync_required`, `resync_from`, `resync_direction`        |
//! | [`DataRepair`]         | `verified`, `refetch_required` (removes a corrupt `payload`) |

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::codec::Payload;
use crate::identity::PeerId;
use crate::middleware::ErrorReport;

/// Errors a strategy may return instead of a verdict. The middleware logs
/// them and treats the report as unhandled.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("Invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Recovery failed: {0}")]
    Failed(String),
}

/// A named procedure that attempts to resolve one class of error.
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Attempt recovery. `Ok(true)` means the caller may retry using the
    /// guidance written into `report.data`.
    fn recover(&self, report: &mut ErrorReport) -> Result<bool, RecoveryError>;

    /// Forget per-peer state after an operation against `peer_id` succeeded.
    fn reset(&self, _peer_id: &PeerId) {}
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Bounded reconnect with exponential backoff, tracked per peer.
pub struct ConnectionRecovery {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    attempts: Mutex<HashMap<PeerId, u32>>,
}

impl ConnectionRecovery {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Reconnect attempts granted so far for `peer_id` since the last reset.
    pub fn attempts(&self, peer_id: &PeerId) -> u32 {
        self.attempts.lock().get(peer_id).copied().unwrap_or(0)
    }

    /// Delay before the given 1-based attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ConnectionRecovery {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_MAX_ATTEMPTS,
            Duration::from_millis(500),
            Duration::from_secs(30),
        )
    }
}

impl RecoveryStrategy for ConnectionRecovery {
    fn name(&self) -> &'static str {
        "connection"
    }

    fn recover(&self, report: &mut ErrorReport) -> Result<bool, RecoveryError> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(report.peer_id.clone()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };

        if attempt > self.max_attempts {
            warn!(
                "Reconnect budget of {} exhausted for peer {}",
                self.max_attempts, report.peer_id
            );
            report.data.insert("reconnect_exhausted".into(), json!(true));
            return Ok(false);
        }

        let delay = self.backoff_for(attempt);
        debug!(
            "Reconnect attempt {attempt}/{} for peer {} in {delay:?}",
            self.max_attempts, report.peer_id
        );
        report.data.insert("reconnect_attempt".into(), json!(attempt));
        report
            .data
            .insert("retry_after_ms".into(), json!(delay.as_millis() as u64));
        Ok(true)
    }

    fn reset(&self, peer_id: &PeerId) {
        self.attempts.lock().remove(peer_id);
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Revision-based resynchronisation.
///
/// Reads the local `revision` and the peer's `remote_revision`. With no local
/// revision a full resync (from 0) is requested.
#[derive(Debug, Default)]
pub struct SyncRecovery;

impl RecoveryStrategy for SyncRecovery {
    fn name(&self) -> &'static str {
        "sync"
    }

    fn recover(&self, report: &mut ErrorReport) -> Result<bool, RecoveryError> {
        let local = read_revision(&report.data, "revision")?;
        let remote = read_revision(&report.data, "remote_revision")?;

        let direction = match (local, remote) {
            (Some(local), Some(remote)) if remote < local => "push",
            _ => "pull",
        };
        let from = local.unwrap_or(0);

        debug!(
            "Resync with peer {} from revision {from} ({direction})",
            report.peer_id
        );
        report.data.insert("resync_required".into(), json!(true));
        report.data.insert("resync_from".into(), json!(from));
        report
            .data
            .insert("resync_direction".into(), json!(direction));
        Ok(true)
    }
}

fn read_revision(data: &Payload, field: &'static str) -> Result<Option<u64>, RecoveryError> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| RecoveryError::InvalidField {
                field,
                reason: format!("expected unsigned integer, got {v}"),
            }),
    }
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// Checksum-based data repair.
///
/// A `payload` whose SHA-256 does not match `checksum` is discarded and a
/// refetch is requested. Without both fields nothing can be verified, so a
/// refetch is requested as well.
#[derive(Debug, Default)]
pub struct DataRepair;

impl RecoveryStrategy for DataRepair {
    fn name(&self) -> &'static str {
        "data"
    }

    fn recover(&self, report: &mut ErrorReport) -> Result<bool, RecoveryError> {
        let expected = match report.data.get("checksum") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(RecoveryError::InvalidField {
                    field: "checksum",
                    reason: format!("expected hex string, got {other}"),
                });
            }
        };

        let verdict = match (expected, report.data.get("payload")) {
            (Some(expected), Some(payload)) => {
                Some(payload_checksum(payload).eq_ignore_ascii_case(&expected))
            }
            _ => None,
        };

        match verdict {
            Some(true) => {
                report.data.insert("verified".into(), json!(true));
            }
            Some(false) => {
                warn!(
                    "Checksum mismatch in {} for peer {}, discarding payload",
                    report.operation, report.peer_id
                );
                report.data.remove("payload");
                report.data.insert("refetch_required".into(), json!(true));
            }
            None => {
                report.data.insert("refetch_required".into(), json!(true));
            }
        }
        Ok(true)
    }
}

/// SHA-256 (hex) of a value's JSON encoding.
pub fn payload_checksum(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

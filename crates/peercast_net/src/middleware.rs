//! Error middleware: per-peer recovery snapshots and a classify-and-dispatch
//! boundary for failed network operations.
//!
//! [`NetworkErrorMiddleware::handle_error`] never propagates a failure: every
//! outcome, including a failing or panicking strategy, collapses to a bool.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::codec::Payload;
use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::recovery::{
    ConnectionRecovery, DataRepair, RecoveryError, RecoveryStrategy, SyncRecovery,
};

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Classification of a failed operation.
///
/// Text form is `ConnectionError`, `SyncError` or `DataError`. Any other
/// string becomes [`ErrorKind::Unrecognized`], which no strategy handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorKind {
    Connection,
    Sync,
    Data,
    Unrecognized(UnknownKind),
}

/// The name of an error kind no strategy handles.
///
/// Only built by parsing, so it never holds one of the recognized names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnknownKind(String);

impl UnknownKind {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnknownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Connection => "ConnectionError",
            Self::Sync => "SyncError",
            Self::Data => "DataError",
            Self::Unrecognized(name) => name.as_str(),
        }
    }
}

impl From<&str> for ErrorKind {
    fn from(s: &str) -> Self {
        match s {
            "ConnectionError" => Self::Connection,
            "SyncError" => Self::Sync,
            "DataError" => Self::Data,
            other => Self::Unrecognized(UnknownKind(other.to_string())),
        }
    }
}

impl From<String> for ErrorKind {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<ErrorKind> for String {
    fn from(kind: ErrorKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Reports and snapshots
// ---------------------------------------------------------------------------

/// Everything known about one failed network operation.
///
/// `data` is the operation's working state. Recovery mutates it in place, and
/// that is how recovered state flows back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub peer_id: PeerId,
    pub data: Payload,
    pub error_kind: Option<ErrorKind>,
    pub trace: Option<String>,
}

/// Older name for [`ErrorReport`].
pub type NetworkContext = ErrorReport;

impl ErrorReport {
    pub fn new(operation: impl Into<String>, peer_id: PeerId) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.into(),
            peer_id,
            data: Payload::new(),
            error_kind: None,
            trace: None,
        }
    }

    /// Build a report from a crate error, classifying it and keeping its
    /// source chain as the trace.
    pub fn from_error(operation: impl Into<String>, peer_id: PeerId, err: &NetworkError) -> Self {
        let mut trace = err.to_string();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            trace.push_str(&format!("\ncaused by: {cause}"));
            source = cause.source();
        }
        Self::new(operation, peer_id)
            .with_kind(err.error_kind())
            .with_trace(trace)
    }

    pub fn with_kind(mut self, kind: impl Into<ErrorKind>) -> Self {
        self.error_kind = Some(kind.into());
        self
    }

    pub fn with_data(mut self, data: Payload) -> Self {
        self.data = data;
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

/// The most recently captured recovery state for one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub state: Payload,
    pub captured_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Snapshot store plus error dispatch.
pub struct NetworkErrorMiddleware {
    snapshots: RwLock<HashMap<PeerId, RecoverySnapshot>>,
    connection: Box<dyn RecoveryStrategy>,
    sync: Box<dyn RecoveryStrategy>,
    data: Box<dyn RecoveryStrategy>,
}

impl NetworkErrorMiddleware {
    /// Create a middleware with the default strategies.
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            connection: Box::new(ConnectionRecovery::default()),
            sync: Box::new(SyncRecovery),
            data: Box::new(DataRepair),
        }
    }

    pub fn with_connection_strategy(mut self, strategy: impl RecoveryStrategy + 'static) -> Self {
        self.connection = Box::new(strategy);
        self
    }

    pub fn with_sync_strategy(mut self, strategy: impl RecoveryStrategy + 'static) -> Self {
        self.sync = Box::new(strategy);
        self
    }

    pub fn with_data_strategy(mut self, strategy: impl RecoveryStrategy + 'static) -> Self {
        self.data = Box::new(strategy);
        self
    }

    /// Store a copy of `state` for `peer_id`, replacing any earlier snapshot.
    pub fn capture_state(&self, peer_id: &PeerId, state: &Payload) {
        let snapshot = RecoverySnapshot {
            state: state.clone(),
            captured_at: Utc::now(),
        };
        self.snapshots.write().insert(peer_id.clone(), snapshot);
    }

    /// The stored state for `peer_id`, if any. Does not clear the snapshot.
    pub fn restore_state(&self, peer_id: &PeerId) -> Option<Payload> {
        self.snapshots.read().get(peer_id).map(|s| s.state.clone())
    }

    pub fn snapshot(&self, peer_id: &PeerId) -> Option<RecoverySnapshot> {
        self.snapshots.read().get(peer_id).cloned()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().len()
    }

    /// Tell every strategy that an operation against `peer_id` succeeded.
    pub fn mark_recovered(&self, peer_id: &PeerId) {
        for strategy in [&self.connection, &self.sync, &self.data] {
            strategy.reset(peer_id);
        }
    }

    /// Log the report, then try to recover. Returns whether the error was
    /// handled; the caller decides what to do when it was not.
    pub fn handle_error(&self, report: &mut ErrorReport) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| self.try_handle(report))) {
            Ok(Ok(handled)) => handled,
            Ok(Err(e)) => {
                error!(
                    "Failed to handle error in {} for peer {}: {e}",
                    report.operation, report.peer_id
                );
                false
            }
            Err(panic) => {
                error!(
                    "Recovery panicked in {} for peer {}: {}",
                    report.operation,
                    report.peer_id,
                    panic_message(panic.as_ref())
                );
                false
            }
        }
    }

    fn try_handle(&self, report: &mut ErrorReport) -> Result<bool, RecoveryError> {
        let kind = report
            .error_kind
            .as_ref()
            .map(ErrorKind::as_str)
            .unwrap_or("unclassified");
        warn!(
            operation = %report.operation,
            peer = %report.peer_id,
            kind,
            "Network error"
        );
        if let Some(trace) = &report.trace {
            debug!(operation = %report.operation, trace = %trace, "Network error trace");
        }

        // Any snapshot wins, whatever the error kind. Known risk: the snapshot
        // may predate or be unrelated to this failure.
        if let Some(previous) = self.restore_state(&report.peer_id) {
            debug!(
                "Restored {} snapshot fields for peer {}",
                previous.len(),
                report.peer_id
            );
            report.data.extend(previous);
            return Ok(true);
        }

        let strategy = match &report.error_kind {
            Some(ErrorKind::Connection) => &self.connection,
            Some(ErrorKind::Sync) => &self.sync,
            Some(ErrorKind::Data) => &self.data,
            Some(ErrorKind::Unrecognized(name)) => {
                debug!("No recovery strategy for error kind {name}");
                return Ok(false);
            }
            None => return Ok(false),
        };

        let handled = strategy.recover(report)?;
        debug!(
            "{} recovery for peer {} returned {handled}",
            strategy.name(),
            report.peer_id
        );
        Ok(handled)
    }
}

impl Default for NetworkErrorMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn peer(name: &str) -> PeerId {
        PeerId::from_string(name)
    }

    struct FailingStrategy;

    impl RecoveryStrategy for FailingStrategy {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn recover(&self, _report: &mut ErrorReport) -> Result<bool, RecoveryError> {
            Err(RecoveryError::Failed("backend unavailable".into()))
        }
    }

    struct PanickingStrategy;

    impl RecoveryStrategy for PanickingStrategy {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn recover(&self, _report: &mut ErrorReport) -> Result<bool, RecoveryError> {
            panic!("strategy bug");
        }
    }

    struct DecliningStrategy;

    impl RecoveryStrategy for DecliningStrategy {
        fn name(&self) -> &'static str {
            "declining"
        }

        fn recover(&self, _report: &mut ErrorReport) -> Result<bool, RecoveryError> {
            Ok(false)
        }
    }

    #[test]
    fn test_capture_then_restore() {
        let mw = NetworkErrorMiddleware::new();
        let state = payload(json!({"cursor": 42, "nested": {"ok": true}}));

        mw.capture_state(&peer("a"), &state);
        assert_eq!(mw.restore_state(&peer("a")), Some(state));
        assert_eq!(mw.restore_state(&peer("b")), None);
    }

    #[test]
    fn test_latest_capture_wins() {
        let mw = NetworkErrorMiddleware::new();
        let s1 = payload(json!({"cursor": 1}));
        let s2 = payload(json!({"cursor": 2, "extra": "x"}));

        mw.capture_state(&peer("a"), &s1);
        mw.capture_state(&peer("a"), &s2);

        assert_eq!(mw.restore_state(&peer("a")), Some(s2));
        assert_eq!(mw.snapshot_count(), 1);
    }

    #[test]
    fn test_restore_does_not_clear_and_capture_copies() {
        let mw = NetworkErrorMiddleware::new();
        let mut state = payload(json!({"cursor": 1}));
        mw.capture_state(&peer("a"), &state);
        state.insert("cursor".into(), json!(99));

        let first = mw.restore_state(&peer("a")).unwrap();
        let second = mw.restore_state(&peer("a")).unwrap();
        assert_eq!(first["cursor"], json!(1));
        assert_eq!(first, second);
        assert!(mw.snapshot(&peer("a")).unwrap().captured_at <= Utc::now());
    }

    #[test]
    fn test_snapshot_short_circuits_and_wins_conflicts() {
        let mw = NetworkErrorMiddleware::new().with_connection_strategy(DecliningStrategy);
        mw.capture_state(&peer("a"), &payload(json!({"cursor": 7, "mode": "full"})));

        let mut report = ErrorReport::new("fetch", peer("a"))
            .with_kind("ConnectionError")
            .with_data(payload(json!({"cursor": 3, "local_only": true})));

        assert!(mw.handle_error(&mut report));
        assert_eq!(report.data["cursor"], json!(7));
        assert_eq!(report.data["mode"], json!("full"));
        assert_eq!(report.data["local_only"], json!(true));
    }

    #[test]
    fn test_snapshot_applies_even_without_kind() {
        let mw = NetworkErrorMiddleware::new();
        mw.capture_state(&peer("a"), &payload(json!({"cursor": 7})));

        let mut report = ErrorReport::new("fetch", peer("a"));
        assert!(mw.handle_error(&mut report));
        assert!(report.data.contains_key("cursor"));
    }

    #[test]
    fn test_known_kinds_without_snapshot_are_handled() {
        let mw = NetworkErrorMiddleware::new();
        for kind in ["ConnectionError", "SyncError", "DataError"] {
            let mut report = ErrorReport::new("op", peer("fresh")).with_kind(kind);
            assert!(mw.handle_error(&mut report), "kind {kind}");
        }
    }

    #[test]
    fn test_unknown_or_missing_kind_is_unhandled() {
        let mw = NetworkErrorMiddleware::new();

        let mut unknown = ErrorReport::new("op", peer("a")).with_kind("TimeoutError");
        assert!(!mw.handle_error(&mut unknown));

        let mut missing = ErrorReport::new("op", peer("a"));
        assert!(!mw.handle_error(&mut missing));
    }

    #[test]
    fn test_strategy_error_is_contained() {
        let mw = NetworkErrorMiddleware::new().with_sync_strategy(FailingStrategy);
        let mut report = ErrorReport::new("sync", peer("a")).with_kind("SyncError");
        assert!(!mw.handle_error(&mut report));
    }

    #[test]
    fn test_strategy_panic_is_contained() {
        let mw = NetworkErrorMiddleware::new().with_data_strategy(PanickingStrategy);
        let mut report = ErrorReport::new("decode", peer("a")).with_kind("DataError");
        assert!(!mw.handle_error(&mut report));

        // The middleware stays usable afterwards.
        mw.capture_state(&peer("a"), &payload(json!({"k": 1})));
        assert!(mw.handle_error(&mut report));
    }

    #[test]
    fn test_invalid_sync_data_is_unhandled() {
        let mw = NetworkErrorMiddleware::new();
        let mut report = ErrorReport::new("sync", peer("a"))
            .with_kind("SyncError")
            .with_data(payload(json!({"revision": "not-a-number"})));
        assert!(!mw.handle_error(&mut report));
    }

    #[test]
    fn test_connection_budget_and_mark_recovered() {
        let mw = NetworkErrorMiddleware::new().with_connection_strategy(ConnectionRecovery::new(
            1,
            std::time::Duration::from_millis(10),
            std::time::Duration::from_secs(1),
        ));
        let mut report = ErrorReport::new("connect", peer("a")).with_kind(ErrorKind::Connection);

        assert!(mw.handle_error(&mut report));
        assert!(!mw.handle_error(&mut report));

        mw.mark_recovered(&peer("a"));
        assert!(mw.handle_error(&mut report));
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_reported_error_is_logged_with_fields() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mw = NetworkErrorMiddleware::new();
            let mut report = ErrorReport::new("fetch", peer("node-7")).with_kind("SyncError");
            mw.handle_error(&mut report);
        });

        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(output.contains("Network error"), "{output}");
        assert!(output.contains("operation=fetch"), "{output}");
        assert!(output.contains("peer=node-7"), "{output}");
        assert!(output.contains("SyncError"), "{output}");
    }

    #[test]
    fn test_error_kind_text_forms() {
        assert_eq!(ErrorKind::from("SyncError"), ErrorKind::Sync);
        assert!(matches!(
            ErrorKind::from("Weird"),
            ErrorKind::Unrecognized(ref name) if name.as_str() == "Weird"
        ));
        assert_eq!(ErrorKind::Data.to_string(), "DataError");

        let json = serde_json::to_string(&ErrorKind::Connection).unwrap();
        assert_eq!(json, "\"ConnectionError\"");
        let parsed: ErrorKind = serde_json::from_str("\"Other\"").unwrap();
        assert_eq!(parsed, ErrorKind::from("Other"));
    }

    #[test]
    fn test_error_kind_serde_roundtrip_keeps_meaning() {
        let kinds = [
            ErrorKind::Connection,
            ErrorKind::Sync,
            ErrorKind::Data,
            ErrorKind::from("TimeoutError"),
            ErrorKind::from(String::from("ConnectionError")),
        ];
        for kind in kinds {
            let json = serde_json::to_string(&kind).unwrap();
            let back: ErrorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind, "kind {json}");
        }

        // A recognized name never ends up unrecognized.
        assert_eq!(ErrorKind::from("ConnectionError"), ErrorKind::Connection);
    }

    #[test]
    fn test_report_from_network_error() {
        let err = NetworkError::Io(std::io::Error::other("socket closed"));
        let report = ErrorReport::from_error("announce", peer("a"), &err);
        assert_eq!(report.error_kind, Some(ErrorKind::Connection));
        assert!(report.trace.unwrap().contains("socket closed"));
        assert_eq!(report.operation, "announce");
    }
}

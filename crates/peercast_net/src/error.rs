//! Network error types.

use crate::middleware::ErrorKind;

/// Errors that can occur in the peercast_net crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (UDP send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Discovery subsystem error (socket setup, bind).
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// A datagram could not be decoded or carried an unknown message type.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A datagram exceeded the configured receive limit.
    #[error("Datagram of {len} bytes exceeds limit of {max} bytes")]
    Oversized { len: usize, max: usize },

    /// Encoding or decoding through the payload codec failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A persisted file (identity, config) could not be encoded or parsed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Classify this error for the recovery middleware.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::Discovery(_) | Self::Io(_) => ErrorKind::Connection,
            Self::Protocol(_) | Self::Oversized { .. } | Self::Codec(_) | Self::Serialization(_) => {
                ErrorKind::Data
            }
        }
    }
}

/// Errors raised by [`DataCompressor`](crate::codec::DataCompressor).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The JSON layer failed (invalid UTF-8, malformed JSON, wrong shape).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The compression layer rejected the bytes.
    #[error("Decompression failed: {0}")]
    Decompress(String),

    /// Compressor stream I/O failed.
    #[error("Compression I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Decoded output would exceed the allowed size.
    #[error("Decoded payload too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },
}

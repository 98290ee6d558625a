//! Payload codec: JSON text optionally passed through a byte compressor.
//!
//! The strategy is chosen once, at construction, and never renegotiated.
//! Every strategy is lossless: `decompress(compress(m)) == m`.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// A key-value payload as carried on the wire and in recovery snapshots.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Upper bound on the size of a decoded payload.
pub const MAX_DECODED_LEN: usize = 64 * 1024;

/// Length of the little-endian size prefix written by the lz4 strategy.
const LZ4_PREFIX_LEN: usize = 4;

/// Available compression strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    /// Pass-through: plain UTF-8 JSON.
    #[default]
    None,
    /// zlib/deflate at best compression. Best ratio, slowest.
    Zlib,
    /// lz4 block format with a size prefix. Fastest.
    Lz4,
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Zlib => "zlib",
            Self::Lz4 => "lz4",
        };
        f.write_str(s)
    }
}

impl FromStr for CompressionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "zlib" => Ok(Self::Zlib),
            "lz4" => Ok(Self::Lz4),
            other => Err(format!("Unknown compression type: {other}")),
        }
    }
}

/// Encodes structured values to bytes and back using a fixed strategy.
///
/// Keeps running totals of bytes before and after compression so callers can
/// report the effective ratio.
#[derive(Debug)]
pub struct DataCompressor {
    compression: CompressionType,
    total_original: AtomicU64,
    total_compressed: AtomicU64,
}

impl DataCompressor {
    pub fn new(compression: CompressionType) -> Self {
        Self {
            compression,
            total_original: AtomicU64::new(0),
            total_compressed: AtomicU64::new(0),
        }
    }

    pub fn compression_type(&self) -> CompressionType {
        self.compression
    }

    /// Encode a key-value payload.
    pub fn compress(&self, data: &Payload) -> Result<Vec<u8>, CodecError> {
        self.encode(data)
    }

    /// Decode bytes back into a key-value payload. Fails unless the JSON is
    /// an object.
    pub fn decompress(&self, data: &[u8]) -> Result<Payload, CodecError> {
        self.decode(data)
    }

    /// Serialize any value to JSON and compress it.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let json = serde_json::to_vec(value)?;
        let original_len = json.len() as u64;
        let out = match self.compression {
            CompressionType::None => json,
            CompressionType::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
                encoder.write_all(&json)?;
                encoder.finish()?
            }
            CompressionType::Lz4 => lz4_flex::compress_prepend_size(&json),
        };

        self.total_original
            .fetch_add(original_len, Ordering::Relaxed);
        self.total_compressed
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        Ok(out)
    }

    /// Decompress bytes and deserialize the JSON they contain.
    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        let json = self.decompress_bytes(data)?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Cumulative compressed/original size over every `encode` call.
    /// Returns 1.0 before anything has been encoded.
    pub fn compression_ratio(&self) -> f64 {
        let original = self.total_original.load(Ordering::Relaxed);
        if original == 0 {
            return 1.0;
        }
        self.total_compressed.load(Ordering::Relaxed) as f64 / original as f64
    }

    fn decompress_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self.compression {
            CompressionType::None => {
                check_len(data.len())?;
                Ok(data.to_vec())
            }
            CompressionType::Zlib => {
                let mut out = Vec::new();
                ZlibDecoder::new(data)
                    .take(MAX_DECODED_LEN as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| CodecError::Decompress(e.to_string()))?;
                check_len(out.len())?;
                Ok(out)
            }
            CompressionType::Lz4 => {
                if data.len() < LZ4_PREFIX_LEN {
                    return Err(CodecError::Decompress("missing lz4 size prefix".into()));
                }
                let claimed = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
                check_len(claimed)?;
                lz4_flex::decompress_size_prepended(data)
                    .map_err(|e| CodecError::Decompress(e.to_string()))
            }
        }
    }
}

impl Default for DataCompressor {
    fn default() -> Self {
        Self::new(CompressionType::default())
    }
}

fn check_len(len: usize) -> Result<(), CodecError> {
    if len > MAX_DECODED_LEN {
        return Err(CodecError::TooLarge {
            len,
            max: MAX_DECODED_LEN,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALL: [CompressionType; 3] = [
        CompressionType::None,
        CompressionType::Zlib,
        CompressionType::Lz4,
    ];

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_roundtrip_all_strategies() {
        let samples = [
            Payload::new(),
            payload(json!({"type": "announce", "id": "peer-a", "timestamp": 1.5})),
            payload(json!({
                "nested": {"list": [1, 2, {"deep": null}], "flag": true},
                "text": "ünïcödé",
                "empty": {}
            })),
        ];

        for strategy in ALL {
            let codec = DataCompressor::new(strategy);
            for sample in &samples {
                let bytes = codec.compress(sample).unwrap();
                let decoded = codec.decompress(&bytes).unwrap();
                assert_eq!(&decoded, sample, "strategy {strategy}");
            }
        }
    }

    #[test]
    fn test_none_strategy_is_plain_json() {
        let codec = DataCompressor::new(CompressionType::None);
        let bytes = codec.compress(&payload(json!({"a": 1}))).unwrap();
        assert_eq!(bytes, br#"{"a":1}"#);
    }

    #[test]
    fn test_compressors_shrink_repetitive_payloads() {
        let big = payload(json!({"blob": "peer ".repeat(500)}));
        for strategy in [CompressionType::Zlib, CompressionType::Lz4] {
            let codec = DataCompressor::new(strategy);
            let bytes = codec.compress(&big).unwrap();
            let plain = serde_json::to_vec(&big).unwrap();
            assert!(bytes.len() < plain.len(), "strategy {strategy}");
            assert!(codec.compression_ratio() < 1.0);
        }
    }

    #[test]
    fn test_ratio_defaults_to_one() {
        let codec = DataCompressor::default();
        assert_eq!(codec.compression_ratio(), 1.0);
        codec.compress(&payload(json!({"k": "v"}))).unwrap();
        assert_eq!(codec.compression_ratio(), 1.0);
    }

    #[test]
    fn test_garbage_is_rejected_by_every_strategy() {
        for strategy in ALL {
            let codec = DataCompressor::new(strategy);
            assert!(codec.decompress(b"\xff\x00garbage").is_err(), "strategy {strategy}");
        }
    }

    #[test]
    fn test_non_object_json_is_rejected() {
        let codec = DataCompressor::new(CompressionType::None);
        assert!(matches!(
            codec.decompress(b"[1,2,3]"),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn test_lz4_oversized_prefix_is_rejected() {
        let codec = DataCompressor::new(CompressionType::Lz4);
        let mut bytes = (u32::MAX).to_le_bytes().to_vec();
        bytes.extend_from_slice(b"xxxx");
        assert!(matches!(
            codec.decompress(&bytes),
            Err(CodecError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_zlib_bomb_is_capped() {
        let codec = DataCompressor::new(CompressionType::Zlib);
        let bomb = payload(json!({"blob": "a".repeat(MAX_DECODED_LEN * 2)}));
        let bytes = codec.compress(&bomb).unwrap();
        assert!(matches!(
            codec.decompress(&bytes),
            Err(CodecError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_compression_type_parse_and_display() {
        for strategy in ALL {
            let parsed: CompressionType = strategy.to_string().parse().unwrap();
            assert_eq!(parsed, strategy);
        }
        assert_eq!("ZLIB".parse::<CompressionType>().unwrap(), CompressionType::Zlib);
        assert!("brotli".parse::<CompressionType>().is_err());
    }
}

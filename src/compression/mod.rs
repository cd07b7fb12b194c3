// src/compression/mod.rs

//! Pluggable per-chunk compression
//!
//! Three codecs are supported: raw (`None`), gzip (the LZ-family option),
//! and zstd. Zstd additionally supports shared dictionaries, which pay off
//! for bundles full of many small, similar chunks. A dictionary is
//! identified by the SHA-256 of its bytes; decoding dictionary-compressed
//! data without the exact dictionary is a hard [`Error::MissingDictionary`],
//! never a silent fallback.

use crate::error::{Error, Result};
use crate::hash::sha256_hex;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Compression codec applied to a chunk payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Raw bytes, no compression
    #[default]
    None,
    /// Gzip (flate2)
    Gzip,
    /// Zstandard, optionally dictionary-based
    Zstd,
}

impl Codec {
    /// Human-readable codec name
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
        }
    }

    /// Whether this codec can use a shared dictionary
    pub const fn supports_dictionary(&self) -> bool {
        matches!(self, Self::Zstd)
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A shared compression dictionary, identified by content hash
#[derive(Debug, Clone)]
pub struct Dictionary {
    bytes: Vec<u8>,
    hash: String,
}

impl Dictionary {
    /// Wrap raw dictionary bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let hash = sha256_hex(&bytes);
        Self { bytes, hash }
    }

    /// Train a dictionary from sample chunks (zstd's COVER trainer)
    pub fn train(samples: &[Vec<u8>], max_size: usize) -> Result<Self> {
        let refs: Vec<&[u8]> = samples.iter().map(|s| s.as_slice()).collect();
        let bytes = zstd::dict::from_samples(&refs, max_size)
            .map_err(|e| Error::Decode(format!("dictionary training failed: {}", e)))?;
        Ok(Self::from_bytes(bytes))
    }

    /// SHA-256 of the dictionary bytes (its identity)
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Bundle-level compression settings, persisted in the bundle body
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompressionDescriptor {
    /// Codec applied to newly written chunks
    pub codec: Codec,
    /// Compression level (codec-specific; zstd 1-22, gzip 0-9)
    pub level: i32,
    /// Hash of the dictionary required to decode, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dictionary_hash: Option<String>,
}

/// Compress `data` with the given codec
///
/// A dictionary may only be supplied for codecs that support one; gzip and
/// raw encoding reject the request outright rather than quietly dropping it.
pub fn encode(data: &[u8], codec: Codec, level: i32, dict: Option<&Dictionary>) -> Result<Vec<u8>> {
    if dict.is_some() && !codec.supports_dictionary() {
        return Err(Error::Format(format!(
            "codec {} does not support dictionaries",
            codec
        )));
    }

    match codec {
        Codec::None => Ok(data.to_vec()),
        Codec::Gzip => {
            let clamped = level.clamp(0, 9) as u32;
            let mut encoder = flate2::read::GzEncoder::new(data, flate2::Compression::new(clamped));
            let mut out = Vec::new();
            encoder.read_to_end(&mut out)?;
            Ok(out)
        }
        Codec::Zstd => match dict {
            Some(d) => {
                let mut compressor = zstd::bulk::Compressor::with_dictionary(level, d.as_bytes())
                    .map_err(|e| Error::Decode(format!("zstd dictionary init: {}", e)))?;
                compressor
                    .compress(data)
                    .map_err(|e| Error::Decode(format!("zstd compress: {}", e)))
            }
            None => zstd::bulk::compress(data, level)
                .map_err(|e| Error::Decode(format!("zstd compress: {}", e))),
        },
    }
}

/// Decompress `data` produced by [`encode`]
///
/// `max_len` bounds the decoded output (the caller knows the recorded raw
/// length); truncated or corrupt input fails with [`Error::Decode`] and
/// never returns partial data.
pub fn decode(
    data: &[u8],
    codec: Codec,
    dict: Option<&Dictionary>,
    max_len: usize,
) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(data.to_vec()),
        Codec::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::Decode(format!("gzip stream: {}", e)))?;
            if out.len() > max_len {
                return Err(Error::Decode(format!(
                    "gzip output exceeds recorded length ({} > {})",
                    out.len(),
                    max_len
                )));
            }
            Ok(out)
        }
        Codec::Zstd => match dict {
            Some(d) => {
                let mut decompressor = zstd::bulk::Decompressor::with_dictionary(d.as_bytes())
                    .map_err(|e| Error::Decode(format!("zstd dictionary init: {}", e)))?;
                decompressor
                    .decompress(data, max_len)
                    .map_err(|e| Error::Decode(format!("zstd stream: {}", e)))
            }
            None => zstd::bulk::decompress(data, max_len)
                .map_err(|e| Error::Decode(format!("zstd stream: {}", e))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"The quick brown fox jumps over the lazy dog. \
        The quick brown fox jumps over the lazy dog. \
        The quick brown fox jumps over the lazy dog.";

    #[test]
    fn test_roundtrip_all_codecs() {
        for codec in [Codec::None, Codec::Gzip, Codec::Zstd] {
            let encoded = encode(SAMPLE, codec, 3, None).unwrap();
            let decoded = decode(&encoded, codec, None, SAMPLE.len()).unwrap();
            assert_eq!(decoded, SAMPLE, "roundtrip failed for {}", codec);
        }
    }

    #[test]
    fn test_compression_shrinks_repetitive_data() {
        let encoded = encode(SAMPLE, Codec::Zstd, 3, None).unwrap();
        assert!(encoded.len() < SAMPLE.len());
    }

    #[test]
    fn test_truncated_zstd_fails() {
        let encoded = encode(SAMPLE, Codec::Zstd, 3, None).unwrap();
        let truncated = &encoded[..encoded.len() / 2];
        let err = decode(truncated, Codec::Zstd, None, SAMPLE.len()).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_corrupt_gzip_fails() {
        let mut encoded = encode(SAMPLE, Codec::Gzip, 6, None).unwrap();
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0xff;
        let result = decode(&encoded, Codec::Gzip, None, SAMPLE.len());
        assert!(result.is_err());
    }

    #[test]
    fn test_gzip_rejects_dictionary() {
        let dict = Dictionary::from_bytes(b"dictionary material".to_vec());
        let err = encode(SAMPLE, Codec::Gzip, 6, Some(&dict)).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_zstd_dictionary_roundtrip() {
        // Raw-content dictionary; zstd accepts arbitrary bytes as a dictionary.
        let dict = Dictionary::from_bytes(SAMPLE.to_vec());
        let encoded = encode(SAMPLE, Codec::Zstd, 3, Some(&dict)).unwrap();
        let decoded = decode(&encoded, Codec::Zstd, Some(&dict), SAMPLE.len()).unwrap();
        assert_eq!(decoded, SAMPLE);

        // Decoding without the dictionary must not yield the original
        assert!(decode(&encoded, Codec::Zstd, None, SAMPLE.len()).is_err());
    }

    #[test]
    fn test_dictionary_identity_is_content_hash() {
        let a = Dictionary::from_bytes(b"same bytes".to_vec());
        let b = Dictionary::from_bytes(b"same bytes".to_vec());
        let c = Dictionary::from_bytes(b"other bytes".to_vec());
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }
}

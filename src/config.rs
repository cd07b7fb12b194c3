// src/config.rs

//! Build configuration
//!
//! One immutable options struct constructed up front and passed to `pack`
//! and `update`. There is deliberately no fluent builder: options never
//! mutate once a build starts, so concurrent workers can share a reference
//! freely.

use crate::compression::{Codec, Dictionary};
use crate::hash::HashAlgorithm;
use std::path::PathBuf;
use std::time::Duration;

/// Options governing pack/update/verify/migrate behavior
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Codec for newly written chunks
    pub compression: Codec,
    /// Compression level (codec-specific)
    pub level: i32,
    /// Shared dictionary for dictionary-capable codecs
    pub dictionary: Option<Dictionary>,
    /// Algorithm for integrity seals (chunk identity is always SHA-256)
    pub integrity: HashAlgorithm,
    /// Whether `open_versioned` may migrate old bundles in place
    pub allow_migration: bool,
    /// Optional cache directory for intermediate build artifacts
    pub cache_dir: Option<PathBuf>,
    /// Cache size limit in bytes; `None` means unbounded
    pub cache_limit: Option<u64>,
    /// Worker-pool size for independent per-asset processing
    pub workers: usize,
    /// Wall-clock limit for a single pack/update/verify/migrate call
    pub timeout: Option<Duration>,
    /// Platform tag stamped into produced bundles
    pub platform: Option<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            compression: Codec::Zstd,
            level: 3,
            dictionary: None,
            integrity: HashAlgorithm::Sha256,
            allow_migration: false,
            cache_dir: None,
            cache_limit: None,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            timeout: None,
            platform: None,
        }
    }
}

impl BuildOptions {
    /// Options for tests and tools that want raw, single-threaded behavior
    pub fn uncompressed() -> Self {
        Self {
            compression: Codec::None,
            level: 0,
            workers: 1,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = BuildOptions::default();
        assert_eq!(opts.compression, Codec::Zstd);
        assert_eq!(opts.level, 3);
        assert!(opts.workers >= 1);
        assert!(!opts.allow_migration);
        assert!(opts.timeout.is_none());
    }

    #[test]
    fn test_uncompressed_preset() {
        let opts = BuildOptions::uncompressed();
        assert_eq!(opts.compression, Codec::None);
        assert_eq!(opts.workers, 1);
    }
}

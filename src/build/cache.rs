// src/build/cache.rs

//! On-disk cache of processed assets
//!
//! Entries are keyed by the SHA-256 of the source bytes, so a cache hit is
//! exactly "this content was processed before". The cache is advisory: any
//! unreadable or undecodable entry is treated as a miss, and store failures
//! degrade to reprocessing next run. Pruning drops oldest entries first
//! until the configured size limit is met.

use crate::build::ProcessedAsset;
use crate::error::{Error, Result};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, warn};

pub struct BuildCache {
    dir: PathBuf,
    limit: Option<u64>,
}

impl BuildCache {
    pub fn new(dir: impl Into<PathBuf>, limit: Option<u64>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, limit })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.cbor"))
    }

    /// Cached result for a source-content hash, if present and decodable
    pub fn load(&self, key: &str) -> Option<ProcessedAsset> {
        let bytes = std::fs::read(self.entry_path(key)).ok()?;
        match ciborium::from_reader(bytes.as_slice()) {
            Ok(asset) => {
                debug!(key, "build cache hit");
                Some(asset)
            }
            Err(e) => {
                warn!(key, error = %e, "discarding undecodable cache entry");
                let _ = std::fs::remove_file(self.entry_path(key));
                None
            }
        }
    }

    /// Persist a processing result under its source-content hash
    pub fn store(&self, key: &str, asset: &ProcessedAsset) -> Result<()> {
        let mut encoded = Vec::new();
        ciborium::into_writer(asset, &mut encoded)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&encoded)?;
        tmp.persist(self.entry_path(key))
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Delete oldest entries until the cache fits its size limit
    ///
    /// Returns the number of entries removed; a cache with no limit never
    /// prunes.
    pub fn prune(&self) -> Result<usize> {
        let Some(limit) = self.limit else {
            return Ok(0);
        };

        let mut entries = Vec::new();
        let mut total = 0u64;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            total += meta.len();
            entries.push((meta.modified()?, meta.len(), entry.path()));
        }
        if total <= limit {
            return Ok(0);
        }

        entries.sort();
        let mut removed = 0;
        for (_, len, path) in entries {
            if total <= limit {
                break;
            }
            std::fs::remove_file(&path)?;
            total -= len;
            removed += 1;
        }
        debug!(removed, remaining_bytes = total, "pruned build cache");
        Ok(removed)
    }
}

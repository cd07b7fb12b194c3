// src/integrity.rs

//! Bundle sealing and verification
//!
//! The seal is a SHA-256 over the canonical CBOR encodings of the chunk
//! table, the graph table, and the compression descriptor, in that order.
//! It is order-sensitive on purpose: two bundles with the same content but
//! different serialization are distinguishable. A CRC32 of the same bytes
//! rides alongside for quick checks that touch no chunk payloads.
//!
//! Verification modes:
//! - **Quick**: recompute only the CRC32 of the tables; O(tables)
//! - **Deep**: additionally re-hash every chunk payload, re-run graph
//!   validation, and recompute the full seal; O(bundle size)

use crate::cancel::{CancelToken, Deadline};
use crate::chunk::{ChunkId, ChunkStore};
use crate::error::Result;
use crate::graph::GraphIndex;
use crate::hash::{self, HashAlgorithm};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Persisted integrity trailer of a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityDescriptor {
    /// Seal algorithm (always cryptographic)
    pub algorithm: HashAlgorithm,
    /// Hash over the canonical table encodings
    pub bundle_hash: String,
    /// Number of chunks sealed
    pub chunk_count: u64,
    /// CRC32 over the same canonical bytes, for in-memory quick checks
    pub quick_crc32: u32,
    /// CRC32 over the file's header and body bytes as last written;
    /// filled in by the bundle writer, zero before the first save
    #[serde(default)]
    pub file_crc32: u32,
}

/// How much work `verify` does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Table checksum only; never reads chunk payloads
    Quick,
    /// Recompute every chunk hash and the full seal
    Deep,
}

/// Outcome of a verification pass
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub mode: VerifyMode,
    /// Chunks whose payload hash was recomputed (0 in quick mode)
    pub chunks_checked: usize,
    /// Human-readable mismatch descriptions; empty means the bundle is sound
    pub failures: Vec<String>,
}

impl VerifyReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Canonical byte string the seal is computed over
///
/// CBOR encoding of serde structs is deterministic for our fixed field
/// order, so re-encoding the in-memory tables reproduces the sealed bytes.
pub fn seal_bytes(chunks: &ChunkStore, graph: &GraphIndex) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(&chunks.entries(), &mut buf)?;
    ciborium::into_writer(&graph.nodes(), &mut buf)?;
    ciborium::into_writer(&chunks.descriptor(), &mut buf)?;
    Ok(buf)
}

/// Compute the integrity descriptor for a bundle's current state
pub fn seal(chunks: &ChunkStore, graph: &GraphIndex, algorithm: HashAlgorithm) -> Result<IntegrityDescriptor> {
    let bytes = seal_bytes(chunks, graph)?;
    let descriptor = IntegrityDescriptor {
        algorithm,
        bundle_hash: hash::hash_bytes(algorithm, &bytes).value,
        chunk_count: chunks.len() as u64,
        quick_crc32: hash::crc32_of(&bytes),
        file_crc32: 0,
    };
    debug!(
        chunks = descriptor.chunk_count,
        hash = %descriptor.bundle_hash,
        "sealed bundle"
    );
    Ok(descriptor)
}

/// Verify a bundle's tables (and, in deep mode, every chunk) against a seal
///
/// Mismatches are collected into the report rather than aborting on the
/// first one; cancellation and timeout still return errors.
pub fn verify(
    chunks: &ChunkStore,
    graph: &GraphIndex,
    sealed: &IntegrityDescriptor,
    mode: VerifyMode,
    cancel: &CancelToken,
    deadline: Deadline,
) -> Result<VerifyReport> {
    let mut report = VerifyReport {
        mode,
        chunks_checked: 0,
        failures: Vec::new(),
    };

    let bytes = seal_bytes(chunks, graph)?;
    if hash::crc32_of(&bytes) != sealed.quick_crc32 {
        report
            .failures
            .push("table checksum does not match sealed CRC32".to_string());
    }
    if chunks.len() as u64 != sealed.chunk_count {
        report.failures.push(format!(
            "chunk count changed: sealed {}, found {}",
            sealed.chunk_count,
            chunks.len()
        ));
    }

    if mode == VerifyMode::Quick {
        return Ok(report);
    }

    let actual = hash::hash_bytes(sealed.algorithm, &bytes).value;
    if actual != sealed.bundle_hash {
        report.failures.push(format!(
            "bundle seal mismatch: sealed {}, recomputed {}",
            sealed.bundle_hash, actual
        ));
    }

    if let Err(e) = graph.validate(chunks.len()) {
        report.failures.push(format!("graph validation: {}", e));
    }

    // Chunk payloads last; each get() re-hashes the decoded bytes
    for idx in 0..chunks.len() {
        cancel.check()?;
        deadline.check("deep verification")?;
        let id = ChunkId(idx as u32);
        if let Err(e) = chunks.get(id) {
            report.failures.push(format!("{}: {}", id, e));
        }
        report.chunks_checked += 1;
    }

    debug!(
        mode = ?mode,
        checked = report.chunks_checked,
        failures = report.failures.len(),
        "verification finished"
    );
    Ok(report)
}

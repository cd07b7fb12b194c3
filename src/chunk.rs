// src/chunk.rs

//! Content-addressed chunk storage inside a bundle
//!
//! Chunks live in a flat arena: a table of [`ChunkEntry`] records plus one
//! contiguous payload blob. A chunk's identity is the SHA-256 of its raw
//! (uncompressed) bytes, so identical content is stored exactly once per
//! bundle regardless of how many graph nodes reference it. Chunk ids are
//! small indices into the table, not pointers, which keeps reference checks
//! simple array traversals.
//!
//! The store is append-only during a build; reclamation of unreferenced
//! chunks happens only in the post-build sweep (`delete_unreferenced`),
//! never mid-transaction.

use crate::compression::{self, Codec, CompressionDescriptor, Dictionary};
use crate::error::{Error, Result};
use crate::hash::sha256_hex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Index of a chunk in the bundle's chunk table
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChunkId(pub u32);

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chunk#{}", self.0)
    }
}

/// One entry in the persisted chunk table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// SHA-256 of the raw chunk bytes (the chunk's identity)
    pub hash: String,
    /// Offset of the stored bytes within the payload blob
    pub offset: u64,
    /// Length of the raw (decoded) bytes
    pub raw_len: u64,
    /// Length of the stored (possibly compressed) bytes
    pub stored_len: u64,
    /// Codec the stored bytes were encoded with
    pub codec: Codec,
}

/// In-memory chunk arena backing a bundle
#[derive(Debug, Clone, Default)]
pub struct ChunkStore {
    entries: Vec<ChunkEntry>,
    blob: Vec<u8>,
    by_hash: HashMap<String, ChunkId>,
    codec: Codec,
    level: i32,
    dictionary: Option<Dictionary>,
    /// Dictionary hash recorded by the bundle that produced this store.
    /// When set, dictionary-coded chunks refuse to decode without it.
    required_dictionary: Option<String>,
}

impl ChunkStore {
    /// Create an empty store writing chunks with the given codec settings
    pub fn new(codec: Codec, level: i32) -> Self {
        Self {
            codec,
            level,
            ..Default::default()
        }
    }

    /// Reassemble a store from persisted parts (bundle open path)
    pub fn from_parts(
        entries: Vec<ChunkEntry>,
        blob: Vec<u8>,
        descriptor: &CompressionDescriptor,
    ) -> Result<Self> {
        let blob_len = blob.len() as u64;
        let mut by_hash = HashMap::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            // Offsets come straight off disk; a lying table must fail as a
            // format error, not wrap around
            let end = entry.offset.checked_add(entry.stored_len);
            if end.is_none_or(|e| e > blob_len) {
                return Err(Error::Format(format!(
                    "chunk {} extends past payload blob ({} + {} > {})",
                    idx, entry.offset, entry.stored_len, blob_len
                )));
            }
            by_hash.insert(entry.hash.clone(), ChunkId(idx as u32));
        }
        Ok(Self {
            entries,
            blob,
            by_hash,
            codec: descriptor.codec,
            level: descriptor.level,
            dictionary: None,
            required_dictionary: descriptor.dictionary_hash.clone(),
        })
    }

    /// Attach the shared dictionary this store was sealed with
    ///
    /// Fails when the bundle requires a different dictionary (by hash).
    pub fn set_dictionary(&mut self, dict: Dictionary) -> Result<()> {
        if let Some(required) = &self.required_dictionary
            && required != dict.hash()
        {
            return Err(Error::MissingDictionary(format!(
                "bundle requires dictionary {}, got {}",
                required,
                dict.hash()
            )));
        }
        self.required_dictionary = Some(dict.hash().to_string());
        self.dictionary = Some(dict);
        Ok(())
    }

    /// Store chunk content, returning its id
    ///
    /// Idempotent: identical bytes always return the same id, and the blob
    /// grows by at most one stored copy.
    pub fn put(&mut self, data: &[u8]) -> Result<ChunkId> {
        let hash = sha256_hex(data);
        if let Some(&id) = self.by_hash.get(&hash) {
            debug!(chunk = %id, "content already in chunk table");
            return Ok(id);
        }

        let mut codec = self.codec;
        let mut stored = compression::encode(data, codec, self.level, self.dictionary.as_ref())?;
        // Incompressible content is kept raw so decode stays cheap
        if codec != Codec::None && stored.len() >= data.len() {
            codec = Codec::None;
            stored = data.to_vec();
        }

        let id = ChunkId(self.entries.len() as u32);
        let offset = self.blob.len() as u64;
        self.entries.push(ChunkEntry {
            hash: hash.clone(),
            offset,
            raw_len: data.len() as u64,
            stored_len: stored.len() as u64,
            codec,
        });
        self.blob.extend_from_slice(&stored);
        self.by_hash.insert(hash, id);
        debug!(chunk = %id, raw = data.len(), stored = self.entries[id.0 as usize].stored_len, "stored chunk");
        Ok(id)
    }

    /// Retrieve and decode chunk content by id
    pub fn get(&self, id: ChunkId) -> Result<Vec<u8>> {
        let entry = self
            .entries
            .get(id.0 as usize)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let dict = if entry.codec.supports_dictionary() && self.required_dictionary.is_some() {
            match &self.dictionary {
                Some(d) => Some(d),
                None => {
                    return Err(Error::MissingDictionary(
                        self.required_dictionary.clone().unwrap_or_default(),
                    ));
                }
            }
        } else {
            None
        };

        let start = entry.offset as usize;
        let end = start + entry.stored_len as usize;
        let raw = compression::decode(&self.blob[start..end], entry.codec, dict, entry.raw_len as usize)?;

        // The hash is the chunk's identity; a mismatch means on-disk corruption
        let actual = sha256_hex(&raw);
        if actual != entry.hash {
            return Err(Error::Integrity {
                context: id.to_string(),
                expected: entry.hash.clone(),
                actual,
            });
        }
        Ok(raw)
    }

    /// Look up a chunk id by raw-content hash
    pub fn lookup(&self, hash: &str) -> Option<ChunkId> {
        self.by_hash.get(hash).copied()
    }

    /// Table entry for a chunk, if it exists
    pub fn entry(&self, id: ChunkId) -> Option<&ChunkEntry> {
        self.entries.get(id.0 as usize)
    }

    /// Number of chunks in the table
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total stored (on-disk) payload size in bytes
    pub fn stored_size(&self) -> u64 {
        self.blob.len() as u64
    }

    /// The persisted chunk table, in id order
    pub fn entries(&self) -> &[ChunkEntry] {
        &self.entries
    }

    /// The raw payload blob
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Drop every chunk not in `live`, compacting the arena
    ///
    /// Returns the number of reclaimed chunks and a remap table from old id
    /// to new id (`None` for swept chunks) that callers apply to the graph.
    pub fn delete_unreferenced(
        &mut self,
        live: &HashSet<ChunkId>,
    ) -> (usize, Vec<Option<ChunkId>>) {
        let mut remap = vec![None; self.entries.len()];
        let mut new_entries = Vec::with_capacity(live.len());
        let mut new_blob = Vec::new();
        let mut new_by_hash = HashMap::with_capacity(live.len());

        for (idx, entry) in self.entries.iter().enumerate() {
            let old_id = ChunkId(idx as u32);
            if !live.contains(&old_id) {
                continue;
            }
            let new_id = ChunkId(new_entries.len() as u32);
            let start = entry.offset as usize;
            let end = start + entry.stored_len as usize;
            let mut moved = entry.clone();
            moved.offset = new_blob.len() as u64;
            new_blob.extend_from_slice(&self.blob[start..end]);
            new_by_hash.insert(moved.hash.clone(), new_id);
            new_entries.push(moved);
            remap[idx] = Some(new_id);
        }

        let swept = self.entries.len() - new_entries.len();
        if swept > 0 {
            debug!(swept, kept = new_entries.len(), "swept unreferenced chunks");
        }
        self.entries = new_entries;
        self.blob = new_blob;
        self.by_hash = new_by_hash;
        (swept, remap)
    }

    /// Descriptor describing how this store encodes chunks
    pub fn descriptor(&self) -> CompressionDescriptor {
        CompressionDescriptor {
            codec: self.codec,
            level: self.level,
            dictionary_hash: self.required_dictionary.clone(),
        }
    }
}

// src/bundle/mod.rs

//! The persisted bundle container
//!
//! A [`Bundle`] owns a chunk store and a graph index plus the descriptors
//! that seal them. Finalized bundles are immutable in memory, so any number
//! of readers can share one without locks; mutation happens on a read-write
//! handle and becomes visible only through the atomic rename in
//! [`Bundle::save`].

mod format;

pub use format::{BundleBody, FormatFlags, HEADER_LEN, MAGIC, RawBundle, read_version};

/// Decode a bundle file into parts without a version check (migration path)
pub(crate) fn read_raw(path: &Path) -> Result<RawBundle> {
    format::read_from_path(path)
}

use crate::cancel::{CancelToken, Deadline};
use crate::chunk::{ChunkId, ChunkStore};
use crate::compression::Dictionary;
use crate::config::BuildOptions;
use crate::error::{Error, Result};
use crate::graph::{GraphIndex, NodeId, PropertyValue, ROOT};
use crate::hash::HashAlgorithm;
use crate::integrity::{self, IntegrityDescriptor, VerifyMode, VerifyReport};
use crate::version;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// How a bundle handle may be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// An asset bundle: chunk store + graph index + descriptors
#[derive(Debug)]
pub struct Bundle {
    chunks: ChunkStore,
    graph: GraphIndex,
    format_version: u16,
    flags: FormatFlags,
    platform: Option<String>,
    built_at: DateTime<Utc>,
    integrity: Option<IntegrityDescriptor>,
    integrity_algorithm: HashAlgorithm,
    mode: OpenMode,
    path: Option<PathBuf>,
}

impl Bundle {
    /// Create an empty read-write bundle with the given build options
    pub fn create(options: &BuildOptions) -> Result<Self> {
        let mut chunks = ChunkStore::new(options.compression, options.level);
        if let Some(dict) = &options.dictionary {
            chunks.set_dictionary(dict.clone())?;
        }
        Ok(Self {
            chunks,
            graph: GraphIndex::new(),
            format_version: version::CURRENT_VERSION,
            flags: FormatFlags::default(),
            platform: options.platform.clone(),
            built_at: Utc::now(),
            integrity: None,
            integrity_algorithm: options.integrity,
            mode: OpenMode::ReadWrite,
            path: None,
        })
    }

    /// Open an existing bundle file
    ///
    /// The format version must be inside the reader's supported range; use
    /// [`crate::version::open_versioned`] to migrate older bundles instead.
    /// The file checksum over header and body is verified before the
    /// tables are loaded.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        version::check_supported(format::read_version(path)?)?;
        format::quick_check(path)?;
        let raw = format::read_from_path(path)?;
        let bundle = Self::from_raw(raw, Some(path.to_path_buf()), mode)?;
        info!(path = %path.display(), version = bundle.format_version, "opened bundle");
        Ok(bundle)
    }

    /// Build a bundle from decoded file parts (open and migration paths)
    pub(crate) fn from_raw(raw: RawBundle, path: Option<PathBuf>, mode: OpenMode) -> Result<Self> {
        if let Some(allowed) = version::allowed_flags(raw.version)
            && raw.flags.0 & !allowed != 0
        {
            return Err(Error::Format(format!(
                "flag bits {:#x} not valid for format version {}",
                raw.flags.0 & !allowed,
                raw.version
            )));
        }
        let chunks = ChunkStore::from_parts(raw.body.chunk_table, raw.blob, &raw.body.compression)?;
        let graph = GraphIndex::from_nodes(raw.body.graph_table)?;
        Ok(Self {
            chunks,
            graph,
            format_version: raw.version,
            flags: raw.flags,
            platform: raw.body.platform,
            built_at: raw.body.built_at,
            integrity_algorithm: raw.trailer.algorithm,
            integrity: Some(raw.trailer),
            mode,
            path,
        })
    }

    // --- accessors -------------------------------------------------------

    pub fn format_version(&self) -> u16 {
        self.format_version
    }

    pub(crate) fn set_format_version(&mut self, version: u16) {
        self.format_version = version;
    }

    pub fn flags(&self) -> FormatFlags {
        self.flags
    }

    pub(crate) fn set_flag(&mut self, bit: u32) {
        self.flags = self.flags.with(bit);
    }

    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Path this bundle was opened from or last saved to
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The integrity trailer, present once sealed or opened
    pub fn integrity(&self) -> Option<&IntegrityDescriptor> {
        self.integrity.as_ref()
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn graph(&self) -> &GraphIndex {
        &self.graph
    }

    pub(crate) fn chunks_mut(&mut self) -> Result<&mut ChunkStore> {
        self.require_writable()?;
        Ok(&mut self.chunks)
    }

    pub(crate) fn graph_mut(&mut self) -> Result<&mut GraphIndex> {
        self.require_writable()?;
        Ok(&mut self.graph)
    }

    fn require_writable(&self) -> Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "bundle opened read-only",
            )));
        }
        Ok(())
    }

    /// Attach the shared dictionary required to decode this bundle
    pub fn set_dictionary(&mut self, dict: Dictionary) -> Result<()> {
        self.chunks.set_dictionary(dict)
    }

    // --- asset-level access ---------------------------------------------

    /// Read the content of the asset at a slash-separated graph path
    pub fn read(&self, asset_path: &str) -> Result<Vec<u8>> {
        let node = self.graph.resolve_path(ROOT, asset_path)?;
        let chunk = self
            .graph
            .property(node, "data")?
            .and_then(PropertyValue::as_chunk)
            .ok_or_else(|| Error::NotFound(format!("{} has no data chunk", asset_path)))?;
        self.chunks.get(chunk)
    }

    /// Resolve an asset path to its graph node
    pub fn resolve(&self, asset_path: &str) -> Result<NodeId> {
        self.graph.resolve_path(ROOT, asset_path)
    }

    /// Walk directory nodes toward `asset_path`, creating missing ones
    ///
    /// Returns the parent node and the leaf edge label. The leaf itself is
    /// left to the caller, which knows the asset's node type.
    pub(crate) fn ensure_parent(&mut self, asset_path: &str) -> Result<(NodeId, String)> {
        self.require_writable()?;
        let segments: Vec<&str> = asset_path.split('/').filter(|s| !s.is_empty()).collect();
        let leaf = segments
            .last()
            .ok_or_else(|| Error::PathNotFound("empty asset path".to_string()))?
            .to_string();

        let mut current = ROOT;
        for segment in &segments[..segments.len() - 1] {
            current = match self.graph.child_by_label(current, segment)? {
                Some(existing) => existing,
                None => {
                    let dir = self.graph.create_node("dir");
                    self.graph.add_edge(current, dir, *segment)?;
                    dir
                }
            };
        }
        Ok((current, leaf))
    }

    /// Every asset path reachable from the root, in authoring order
    pub fn asset_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<(NodeId, String)> = self
            .graph
            .children(ROOT)
            .map(|iter| {
                iter.map(|(label, child)| (child, label.to_string()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        stack.reverse();
        while let Some((node, path)) = stack.pop() {
            if let Ok(record) = self.graph.node(node) {
                if record.type_tag != "dir" {
                    out.push(path.clone());
                }
                let mut children: Vec<(NodeId, String)> = record
                    .edges
                    .iter()
                    .map(|e| (e.child, format!("{}/{}", path, e.label)))
                    .collect();
                children.reverse();
                stack.extend(children);
            }
        }
        out
    }

    // --- lifecycle -------------------------------------------------------

    /// Reclaim chunks no graph node references any more
    ///
    /// Runs only after a completed build pass, never mid-transaction.
    pub fn sweep_orphans(&mut self) -> Result<usize> {
        self.require_writable()?;
        let live = self.graph.referenced_chunks();
        let (swept, remap) = self.chunks.delete_unreferenced(&live);
        self.graph.remap_chunks(&remap)?;
        Ok(swept)
    }

    /// Recompute the integrity descriptor over the current tables
    pub fn seal(&mut self) -> Result<()> {
        self.integrity = Some(integrity::seal(
            &self.chunks,
            &self.graph,
            self.integrity_algorithm,
        )?);
        Ok(())
    }

    /// Verify against the stored seal with default cancellation settings
    pub fn verify(&self, mode: VerifyMode) -> Result<VerifyReport> {
        self.verify_with(mode, &CancelToken::new(), Deadline::after(None))
    }

    /// Verify with explicit cancellation token and deadline
    pub fn verify_with(
        &self,
        mode: VerifyMode,
        cancel: &CancelToken,
        deadline: Deadline,
    ) -> Result<VerifyReport> {
        let sealed = self
            .integrity
            .as_ref()
            .ok_or_else(|| Error::Format("bundle has no integrity seal".to_string()))?;
        integrity::verify(&self.chunks, &self.graph, sealed, mode, cancel, deadline)
    }

    /// Seal and atomically write the bundle to `path`
    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.require_writable()?;
        let path = path.as_ref();

        self.built_at = Utc::now();
        let trailer = integrity::seal(&self.chunks, &self.graph, self.integrity_algorithm)?;
        let descriptor = self.chunks.descriptor();
        if descriptor.codec != crate::compression::Codec::None {
            self.flags = self.flags.with(FormatFlags::COMPRESSION);
        }

        let body = BundleBody {
            platform: self.platform.clone(),
            built_at: self.built_at,
            compression: descriptor,
            chunk_table: self.chunks.entries().to_vec(),
            graph_table: self.graph.nodes().to_vec(),
            payload_len: self.chunks.blob().len() as u64,
        };
        self.integrity = Some(format::write_to_path(
            path,
            self.format_version,
            self.flags,
            &body,
            self.chunks.blob(),
            &trailer,
        )?);
        self.path = Some(path.to_path_buf());
        debug!(path = %path.display(), chunks = self.chunks.len(), nodes = self.graph.node_count(), "saved bundle");
        Ok(())
    }

    /// Close the bundle, flushing a read-write handle back to its file
    pub fn close(mut self) -> Result<()> {
        if self.mode == OpenMode::ReadWrite
            && let Some(path) = self.path.clone()
        {
            self.save(&path)?;
        }
        Ok(())
    }
}

/// Quick-verify a bundle file without loading its payload
///
/// Streams the header, body, and trailer and checks the file checksum;
/// work is proportional to the table sizes. A checksum mismatch becomes a
/// report failure, any other problem propagates as an error.
pub fn quick_verify_file(path: impl AsRef<Path>) -> Result<VerifyReport> {
    let mut report = VerifyReport {
        mode: VerifyMode::Quick,
        chunks_checked: 0,
        failures: Vec::new(),
    };
    match format::quick_check(path.as_ref()) {
        Ok(()) => {}
        Err(Error::Integrity {
            context,
            expected,
            actual,
        }) => {
            report.failures.push(format!(
                "{}: file checksum mismatch, sealed {}, recomputed {}",
                context, expected, actual
            ));
        }
        Err(e) => return Err(e),
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Codec;
    use tempfile::TempDir;

    fn writable() -> Bundle {
        Bundle::create(&BuildOptions::uncompressed()).unwrap()
    }

    fn add_asset(bundle: &mut Bundle, path: &str, content: &[u8]) {
        let chunk = bundle.chunks_mut().unwrap().put(content).unwrap();
        let (parent, leaf) = bundle.ensure_parent(path).unwrap();
        let graph = bundle.graph_mut().unwrap();
        let node = graph.create_node("file");
        graph.add_edge(parent, node, leaf).unwrap();
        graph
            .set_property(node, "data", PropertyValue::Chunk(chunk))
            .unwrap();
    }

    #[test]
    fn test_create_read_asset() {
        let mut bundle = writable();
        add_asset(&mut bundle, "textures/stone.png", b"stone pixels");
        assert_eq!(bundle.read("textures/stone.png").unwrap(), b"stone pixels");
        assert!(matches!(
            bundle.read("textures/wood.png").unwrap_err(),
            Error::PathNotFound(_)
        ));
    }

    #[test]
    fn test_save_open_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("world.hdag");

        let mut bundle = Bundle::create(&BuildOptions {
            compression: Codec::Zstd,
            platform: Some("linux-x86_64".to_string()),
            ..BuildOptions::default()
        })
        .unwrap();
        add_asset(&mut bundle, "models/ship.obj", b"vertices and faces, vertices and faces");
        add_asset(&mut bundle, "readme.txt", b"hello");
        bundle.save(&path).unwrap();

        let reopened = Bundle::open(&path, OpenMode::ReadOnly).unwrap();
        assert_eq!(reopened.format_version(), version::CURRENT_VERSION);
        assert_eq!(reopened.platform(), Some("linux-x86_64"));
        assert_eq!(
            reopened.read("models/ship.obj").unwrap(),
            b"vertices and faces, vertices and faces"
        );
        assert!(reopened.verify(VerifyMode::Deep).unwrap().ok());
        assert!(reopened.flags().contains(FormatFlags::COMPRESSION));
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ro.hdag");
        let mut bundle = writable();
        add_asset(&mut bundle, "a.txt", b"a");
        bundle.save(&path).unwrap();

        let mut ro = Bundle::open(&path, OpenMode::ReadOnly).unwrap();
        assert!(ro.chunks_mut().is_err());
        assert!(ro.save(&path).is_err());
    }

    #[test]
    fn test_shared_chunk_across_paths() {
        let mut bundle = writable();
        add_asset(&mut bundle, "a/copy1.bin", b"identical texture content");
        add_asset(&mut bundle, "b/copy2.bin", b"identical texture content");
        assert_eq!(bundle.chunks().len(), 1);
        assert_eq!(bundle.read("a/copy1.bin").unwrap(), bundle.read("b/copy2.bin").unwrap());
    }

    #[test]
    fn test_sweep_orphans() {
        let mut bundle = writable();
        add_asset(&mut bundle, "keep.bin", b"keep this");
        let orphan = bundle.chunks_mut().unwrap().put(b"never referenced").unwrap();
        assert!(bundle.chunks().entry(orphan).is_some());

        let swept = bundle.sweep_orphans().unwrap();
        assert_eq!(swept, 1);
        assert_eq!(bundle.chunks().len(), 1);
        assert_eq!(bundle.read("keep.bin").unwrap(), b"keep this");
    }

    #[test]
    fn test_asset_paths_in_authoring_order() {
        let mut bundle = writable();
        add_asset(&mut bundle, "z/last.bin", b"1");
        add_asset(&mut bundle, "a/first.bin", b"2");
        assert_eq!(bundle.asset_paths(), vec!["z/last.bin", "a/first.bin"]);
    }

    #[test]
    fn test_open_detects_tampered_tables() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tamper.hdag");
        let mut bundle = writable();
        add_asset(&mut bundle, "a.bin", b"content");
        bundle.save(&path).unwrap();

        // Flip a byte inside the CBOR body (past the 20-byte header)
        let mut bytes = std::fs::read(&path).unwrap();
        let target = HEADER_LEN + 40;
        bytes[target] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        // Either the CBOR no longer parses or the quick check trips
        assert!(Bundle::open(&path, OpenMode::ReadOnly).is_err());
    }

    #[test]
    fn test_flags_checked_against_format_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flags.hdag");
        let mut bundle = writable();
        add_asset(&mut bundle, "a.bin", b"content");
        bundle.save(&path).unwrap();

        // Dependency tracking did not exist before version 3
        let mut raw = read_raw(&path).unwrap();
        raw.version = 2;
        raw.flags = raw.flags.with(FormatFlags::DEPENDENCY_TRACKING);
        assert!(matches!(
            Bundle::from_raw(raw, None, OpenMode::ReadOnly).unwrap_err(),
            Error::Format(_)
        ));

        // The same flag is fine on the current version
        let mut raw = read_raw(&path).unwrap();
        raw.flags = raw.flags.with(FormatFlags::DEPENDENCY_TRACKING);
        assert!(Bundle::from_raw(raw, None, OpenMode::ReadOnly).is_ok());
    }

    #[test]
    fn test_quick_verify_file_reports_body_tamper() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quick.hdag");
        let mut bundle = writable();
        add_asset(&mut bundle, "a.bin", b"payload bytes");
        bundle.save(&path).unwrap();

        assert!(quick_verify_file(&path).unwrap().ok());

        // Rename the edge label inside the CBOR body without breaking the
        // encoding; the file checksum must catch it
        let mut bytes = std::fs::read(&path).unwrap();
        let at = bytes
            .windows(5)
            .position(|w| w == b"a.bin")
            .expect("edge label present in body");
        bytes[at] = b'b';
        std::fs::write(&path, &bytes).unwrap();

        let report = quick_verify_file(&path).unwrap();
        assert!(!report.ok());
        assert!(report.failures[0].contains("checksum mismatch"));
    }
}

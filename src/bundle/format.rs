// src/bundle/format.rs

//! On-disk bundle layout
//!
//! ```text
//! +----------------------------+
//! | header (20 bytes, fixed)   |  magic "HDAG" | major u16 | minor u16
//! |                            |  | flags u32 | body_len u64   (all LE)
//! +----------------------------+
//! | body (CBOR, body_len)      |  platform, timestamp, compression
//! |                            |  descriptor, chunk table, graph table,
//! |                            |  payload_len
//! +----------------------------+
//! | payload blob (raw bytes)   |  concatenated stored chunk bytes
//! +----------------------------+
//! | integrity trailer (CBOR)   |  seal hash, chunk count, quick CRC32
//! +----------------------------+
//! ```
//!
//! Writes go to a temp file in the target directory and rename over the
//! destination while holding an exclusive lock on a `.lock` sidecar, so a
//! partial write never replaces a valid bundle and concurrent readers of
//! the previous file keep a consistent view.

use crate::chunk::ChunkEntry;
use crate::compression::CompressionDescriptor;
use crate::error::{Error, Result};
use crate::graph::NodeRecord;
use crate::integrity::IntegrityDescriptor;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

/// Bundle file magic
pub const MAGIC: [u8; 4] = *b"HDAG";

/// Fixed header length in bytes
pub const HEADER_LEN: usize = 20;

/// Header feature-flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatFlags(pub u32);

impl FormatFlags {
    pub const COMPRESSION: u32 = 1 << 0;
    pub const ENCRYPTION: u32 = 1 << 1;
    pub const STREAMING: u32 = 1 << 2;
    pub const DEPENDENCY_TRACKING: u32 = 1 << 3;

    const KNOWN: u32 =
        Self::COMPRESSION | Self::ENCRYPTION | Self::STREAMING | Self::DEPENDENCY_TRACKING;

    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn with(mut self, bit: u32) -> Self {
        self.0 |= bit;
        self
    }
}

/// CBOR body between header and payload blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    pub built_at: DateTime<Utc>,
    pub compression: CompressionDescriptor,
    pub chunk_table: Vec<ChunkEntry>,
    pub graph_table: Vec<NodeRecord>,
    /// Length of the raw payload blob following the body
    pub payload_len: u64,
}

/// A bundle file decoded into its constituent parts
#[derive(Debug)]
pub struct RawBundle {
    pub version: u16,
    pub flags: FormatFlags,
    pub body: BundleBody,
    pub blob: Vec<u8>,
    pub trailer: IntegrityDescriptor,
}

fn parse_header(bytes: &[u8]) -> Result<(u16, u16, FormatFlags, u64)> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Format(format!(
            "file too short for bundle header ({} bytes)",
            bytes.len()
        )));
    }
    if bytes[0..4] != MAGIC {
        return Err(Error::Format("bad magic, not a bundle file".to_string()));
    }
    let major = u16::from_le_bytes([bytes[4], bytes[5]]);
    let minor = u16::from_le_bytes([bytes[6], bytes[7]]);
    let flags = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    if flags & !FormatFlags::KNOWN != 0 {
        return Err(Error::Format(format!(
            "unknown header flag bits: {:#x}",
            flags & !FormatFlags::KNOWN
        )));
    }
    let body_len = u64::from_le_bytes(bytes[12..20].try_into().expect("sliced 8 bytes"));
    Ok((major, minor, FormatFlags(flags), body_len))
}

/// Lock sidecar guarding writes to a bundle path
///
/// Appended to the full filename so `a.hdag` and `a.pak` in one directory
/// never share a lock.
fn lock_path(bundle_path: &Path) -> std::path::PathBuf {
    let mut os = bundle_path.as_os_str().to_os_string();
    os.push(".lock");
    std::path::PathBuf::from(os)
}

/// Read only the format version from a bundle header
///
/// Reads [`HEADER_LEN`] bytes; used by the migrator to dispatch before
/// committing to a full parse.
pub fn read_version(path: &Path) -> Result<u16> {
    let mut file = File::open(path)?;
    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header).map_err(|_| {
        Error::Format(format!("{}: file too short for bundle header", path.display()))
    })?;
    let (major, _, _, _) = parse_header(&header)?;
    Ok(major)
}

/// Decode a whole bundle file into its parts
pub fn read_from_path(path: &Path) -> Result<RawBundle> {
    let bytes = fs::read(path)?;
    let (major, _minor, flags, body_len) = parse_header(&bytes)?;

    let body_start = HEADER_LEN;
    let body_end = body_start
        .checked_add(body_len as usize)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| Error::Format("body length exceeds file size".to_string()))?;
    let body: BundleBody = ciborium::from_reader(&bytes[body_start..body_end])?;

    let blob_end = body_end
        .checked_add(body.payload_len as usize)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| Error::Format("payload length exceeds file size".to_string()))?;
    let blob = bytes[body_end..blob_end].to_vec();

    let mut trailer_cursor = Cursor::new(&bytes[blob_end..]);
    let trailer: IntegrityDescriptor = ciborium::from_reader(&mut trailer_cursor)?;
    if (trailer_cursor.position() as usize) < bytes.len() - blob_end {
        return Err(Error::Format(
            "trailing bytes after integrity trailer".to_string(),
        ));
    }

    debug!(
        path = %path.display(),
        version = major,
        chunks = body.chunk_table.len(),
        nodes = body.graph_table.len(),
        "read bundle"
    );
    Ok(RawBundle {
        version: major,
        flags,
        body,
        blob,
        trailer,
    })
}

/// Serialize a bundle and atomically replace `path` with it
///
/// Returns the trailer as written, with its file checksum filled in.
pub fn write_to_path(
    path: &Path,
    version: u16,
    flags: FormatFlags,
    body: &BundleBody,
    blob: &[u8],
    trailer: &IntegrityDescriptor,
) -> Result<IntegrityDescriptor> {
    debug_assert_eq!(body.payload_len as usize, blob.len());

    let mut body_cbor = Vec::new();
    ciborium::into_writer(body, &mut body_cbor)?;

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(&MAGIC);
    header.extend_from_slice(&version.to_le_bytes());
    header.extend_from_slice(&0u16.to_le_bytes()); // minor, reserved
    header.extend_from_slice(&flags.0.to_le_bytes());
    header.extend_from_slice(&(body_cbor.len() as u64).to_le_bytes());

    // The file checksum covers exactly the bytes quick verification reads
    let mut crc = crc32fast::Hasher::new();
    crc.update(&header);
    crc.update(&body_cbor);
    let mut trailer = trailer.clone();
    trailer.file_crc32 = crc.finalize();
    let mut trailer_cbor = Vec::new();
    ciborium::into_writer(&trailer, &mut trailer_cbor)?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    // Exclusive write intent for the swap; readers of the old file content
    // are unaffected by the rename
    let lock_file = File::create(lock_path(path))?;
    lock_file.lock_exclusive()?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(&header)?;
    tmp.write_all(&body_cbor)?;
    tmp.write_all(blob)?;
    tmp.write_all(&trailer_cbor)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;

    fs2::FileExt::unlock(&lock_file)?;
    debug!(path = %path.display(), version, bytes = HEADER_LEN + body_cbor.len() + blob.len() + trailer_cbor.len(), "wrote bundle");
    Ok(trailer)
}

/// Check the file checksum over header and body, skipping the payload blob
///
/// Reads only the header, the CBOR body, and the trailer; work is
/// proportional to the table sizes, never to the payload. A mismatch means
/// the bytes quick verification covers were altered after the last write.
pub fn quick_check(path: &Path) -> Result<()> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();

    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header).map_err(|_| {
        Error::Format(format!("{}: file too short for bundle header", path.display()))
    })?;
    let (_, _, _, body_len) = parse_header(&header)?;
    if (HEADER_LEN as u64).saturating_add(body_len) > file_len {
        return Err(Error::Format("body length exceeds file size".to_string()));
    }

    let mut body = vec![0u8; body_len as usize];
    file.read_exact(&mut body)
        .map_err(|_| Error::Format("file too short for bundle body".to_string()))?;
    let decoded: BundleBody = ciborium::from_reader(body.as_slice())?;

    let payload_len = i64::try_from(decoded.payload_len)
        .map_err(|_| Error::Format("payload length exceeds file size".to_string()))?;
    file.seek(SeekFrom::Current(payload_len))?;
    let mut trailer_bytes = Vec::new();
    file.read_to_end(&mut trailer_bytes)?;
    let trailer: IntegrityDescriptor = ciborium::from_reader(trailer_bytes.as_slice())?;

    let mut crc = crc32fast::Hasher::new();
    crc.update(&header);
    crc.update(&body);
    let actual = crc.finalize();
    if actual != trailer.file_crc32 {
        return Err(Error::Integrity {
            context: path.display().to_string(),
            expected: format!("{:#010x}", trailer.file_crc32),
            actual: format!("{:#010x}", actual),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;
    use tempfile::TempDir;

    fn sample_parts() -> (BundleBody, Vec<u8>, IntegrityDescriptor) {
        let blob = b"rawchunkbytes".to_vec();
        let body = BundleBody {
            platform: Some("linux-x86_64".to_string()),
            built_at: Utc::now(),
            compression: CompressionDescriptor::default(),
            chunk_table: Vec::new(),
            graph_table: vec![NodeRecord {
                type_tag: "root".into(),
                properties: vec![],
                edges: vec![],
            }],
            payload_len: blob.len() as u64,
        };
        let trailer = IntegrityDescriptor {
            algorithm: HashAlgorithm::Sha256,
            bundle_hash: crate::hash::sha256_hex(b"tables"),
            chunk_count: 0,
            quick_crc32: 0,
            file_crc32: 0,
        };
        (body, blob, trailer)
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.hdag");
        let (body, blob, trailer) = sample_parts();

        let written =
            write_to_path(&path, 3, FormatFlags::default(), &body, &blob, &trailer).unwrap();
        let raw = read_from_path(&path).unwrap();

        assert_eq!(raw.version, 3);
        assert_eq!(raw.blob, blob);
        assert_eq!(raw.body.platform.as_deref(), Some("linux-x86_64"));
        assert_eq!(raw.trailer, written);
        assert_eq!(raw.trailer.bundle_hash, trailer.bundle_hash);
        assert_ne!(raw.trailer.file_crc32, 0);
        assert_eq!(read_version(&path).unwrap(), 3);
    }

    #[test]
    fn test_quick_check_covers_header_and_body_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quick.hdag");
        let (body, blob, trailer) = sample_parts();
        write_to_path(&path, 3, FormatFlags::default(), &body, &blob, &trailer).unwrap();

        quick_check(&path).unwrap();

        // Alter the platform string inside the CBOR body: still valid
        // CBOR, but the file checksum catches it
        let original = fs::read(&path).unwrap();
        let at = original
            .windows(5)
            .position(|w| w == b"linux")
            .expect("platform string present in body");
        let mut tampered = original.clone();
        tampered[at] = b'q';
        fs::write(&path, &tampered).unwrap();
        assert!(matches!(
            quick_check(&path).unwrap_err(),
            Error::Integrity { .. }
        ));

        // Flip a byte inside the payload blob: outside quick coverage
        let mut body_cbor = Vec::new();
        ciborium::into_writer(&body, &mut body_cbor).unwrap();
        let blob_start = HEADER_LEN + body_cbor.len();
        let mut payload_tampered = original;
        payload_tampered[blob_start] ^= 0x01;
        fs::write(&path, &payload_tampered).unwrap();
        quick_check(&path).unwrap();
    }

    #[test]
    fn test_lock_path_keeps_full_filename() {
        assert_eq!(
            lock_path(Path::new("/out/a.hdag")),
            Path::new("/out/a.hdag.lock")
        );
        assert_ne!(
            lock_path(Path::new("/out/a.hdag")),
            lock_path(Path::new("/out/a.pak"))
        );
    }

    #[test]
    fn test_bad_magic_is_format_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not_a_bundle.bin");
        fs::write(&path, b"GARBAGE CONTENT LONG ENOUGH FOR A HEADER").unwrap();
        assert!(matches!(
            read_from_path(&path).unwrap_err(),
            Error::Format(_)
        ));
    }

    #[test]
    fn test_truncated_file_is_format_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.hdag");
        fs::write(&path, b"HDAG").unwrap();
        assert!(matches!(
            read_from_path(&path).unwrap_err(),
            Error::Format(_)
        ));
        assert!(matches!(read_version(&path).unwrap_err(), Error::Format(_)));
    }

    #[test]
    fn test_body_len_overflow_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lying_header.hdag");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&3u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            read_from_path(&path).unwrap_err(),
            Error::Format(_)
        ));
    }

    #[test]
    fn test_unknown_flag_bits_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("future_flags.hdag");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&3u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&0x8000_0000u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            read_from_path(&path).unwrap_err(),
            Error::Format(_)
        ));
    }

    #[test]
    fn test_overwrite_is_atomic_replacement() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bundle.hdag");
        let (body, blob, trailer) = sample_parts();
        write_to_path(&path, 3, FormatFlags::default(), &body, &blob, &trailer).unwrap();

        let mut body2 = body.clone();
        body2.platform = Some("windows-x86_64".to_string());
        write_to_path(&path, 3, FormatFlags::default(), &body2, &blob, &trailer).unwrap();

        let raw = read_from_path(&path).unwrap();
        assert_eq!(raw.body.platform.as_deref(), Some("windows-x86_64"));
    }
}

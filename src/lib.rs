// src/lib.rs

//! hyperdag: content-addressed asset bundles with a typed dependency graph
//!
//! A bundle is a single file holding deduplicated content chunks plus a DAG
//! of typed nodes describing the assets built from them. The library covers
//! the full asset pipeline: packing a source tree, incrementally rebuilding
//! only what changed, verifying integrity, and migrating bundles across
//! format versions.
//!
//! ```no_run
//! use hyperdag::{BuildEngine, BuildOptions, RawFileProcessor};
//! use std::path::Path;
//!
//! # fn main() -> hyperdag::Result<()> {
//! let options = BuildOptions::default();
//! let engine = BuildEngine::new("assets/", &RawFileProcessor, &options);
//! let (bundle, report) = engine.pack_dir(Path::new("game.hdag"))?;
//! println!("{report}");
//! let stone = bundle.read("textures/stone.png")?;
//! assert!(!stone.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod build;
pub mod bundle;
pub mod cancel;
pub mod chunk;
pub mod compression;
pub mod config;
pub mod deps;
pub mod error;
pub mod graph;
pub mod hash;
pub mod integrity;
pub mod version;
pub mod watch;

pub use build::{AssetProcessor, BuildEngine, BuildReport, ProcessedAsset, RawFileProcessor};
pub use bundle::{Bundle, FormatFlags, OpenMode};
pub use cancel::{CancelToken, Deadline};
pub use chunk::{ChunkId, ChunkStore};
pub use compression::{Codec, Dictionary};
pub use config::BuildOptions;
pub use deps::{AssetDependency, DependencySet};
pub use error::{Error, Result};
pub use graph::{GraphIndex, NodeId, PropertyValue, ROOT};
pub use hash::{ContentHash, HashAlgorithm};
pub use integrity::{VerifyMode, VerifyReport};
pub use version::{CURRENT_VERSION, migrate, open_versioned};
pub use watch::Watcher;

use std::path::Path;

/// Pack every file under `source_root` into a new bundle at `bundle_path`
pub fn pack(source_root: &Path, bundle_path: &Path, options: &BuildOptions) -> Result<BuildReport> {
    let engine = BuildEngine::new(source_root, &RawFileProcessor, options);
    let (_, report) = engine.pack_dir(bundle_path)?;
    Ok(report)
}

/// Incrementally rebuild a bundle after source changes
///
/// `changed` is a hint merged with the tracked asset set; staleness is
/// decided by content hash.
pub fn update(
    bundle_path: &Path,
    source_root: &Path,
    changed: &[std::path::PathBuf],
    options: &BuildOptions,
) -> Result<BuildReport> {
    let mut bundle = open_versioned(bundle_path, OpenMode::ReadWrite, options.allow_migration)?;
    let engine = BuildEngine::new(source_root, &RawFileProcessor, options);
    engine.update(&mut bundle, changed)
}

/// Verify a bundle file at the requested depth
///
/// Quick mode streams the file and never loads chunk payloads; deep mode
/// opens the bundle and re-hashes every chunk.
pub fn verify(bundle_path: &Path, mode: VerifyMode) -> Result<VerifyReport> {
    match mode {
        VerifyMode::Quick => bundle::quick_verify_file(bundle_path),
        VerifyMode::Deep => {
            let bundle = Bundle::open(bundle_path, OpenMode::ReadOnly)?;
            bundle.verify(mode)
        }
    }
}

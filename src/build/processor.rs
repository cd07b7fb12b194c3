// src/build/processor.rs

//! Asset processors: the pluggable import step of a build
//!
//! A processor is a pure per-asset transformation from source bytes to
//! bundle content. It runs on the worker pool, so it must not touch shared
//! state; committing results into the chunk store and graph happens on the
//! build thread afterwards.

use crate::error::Result;
use crate::graph::PropertyValue;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Output of processing one source asset
///
/// Serializable so results can live in the build cache between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedAsset {
    /// Node type tag for the asset's graph node
    pub type_tag: String,
    /// Content stored as the asset's data chunk
    pub content: Vec<u8>,
    /// Additional scalar properties for the node
    pub properties: Vec<(String, PropertyValue)>,
    /// Source-level dependencies discovered while processing
    pub depends_on: Vec<PathBuf>,
}

/// A per-asset import step, keyed off the source file
///
/// Implementations match on file extension or content rather than relying
/// on inheritance; the engine treats every processor uniformly.
pub trait AssetProcessor: Send + Sync {
    /// Transform one source asset into bundle content
    fn process(&self, source_root: &Path, asset: &Path) -> Result<ProcessedAsset>;

    /// Dependencies an asset declares before processing (used for build
    /// ordering of assets that have never been built). Defaults to none.
    fn dependencies(&self, _source_root: &Path, _asset: &Path) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

/// Default processor: stores the file's bytes as a single chunk
///
/// The node is tagged "file" and carries the raw size, which survives even
/// when the chunk itself is compressed.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawFileProcessor;

impl AssetProcessor for RawFileProcessor {
    fn process(&self, source_root: &Path, asset: &Path) -> Result<ProcessedAsset> {
        let content = std::fs::read(source_root.join(asset))?;
        let size = content.len() as i64;
        Ok(ProcessedAsset {
            type_tag: "file".to_string(),
            content,
            properties: vec![("size".to_string(), PropertyValue::Int(size))],
            depends_on: Vec::new(),
        })
    }
}

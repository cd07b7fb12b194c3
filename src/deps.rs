// src/deps.rs

//! Source-asset dependency tracking and staleness
//!
//! One [`AssetDependency`] record per tracked source asset, persisted as a
//! JSON sidecar next to the bundle. The whole set loads at build start and
//! is rewritten atomically at build end. Content hash is authoritative for
//! staleness; the recorded modification time is bookkeeping and never
//! short-circuits a hash comparison. Dependency records must form a DAG
//! mirroring source-level dependencies; a cycle is a configuration error
//! reported at build time, never an unbounded recursion.

use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Per-source-asset dependency record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDependency {
    /// Source path, relative to the source root
    pub path: PathBuf,
    /// SHA-256 of the source content at last successful build
    pub content_hash: String,
    /// Modification time observed at last successful build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    /// Other source assets (or config files) whose change invalidates this one
    #[serde(default)]
    pub depends_on: Vec<PathBuf>,
}

/// The persisted dependency graph for a bundle's sources
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencySet {
    records: BTreeMap<PathBuf, AssetDependency>,
}

/// Sidecar path for a bundle's dependency file
pub fn sidecar_path(bundle_path: &Path) -> PathBuf {
    let mut os = bundle_path.as_os_str().to_os_string();
    os.push(".deps.json");
    PathBuf::from(os)
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the sidecar; a missing file yields an empty set
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let set = serde_json::from_slice(&bytes)?;
                Ok(set)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically rewrite the sidecar (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&serde_json::to_vec_pretty(self)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        debug!(path = %path.display(), records = self.records.len(), "wrote dependency sidecar");
        Ok(())
    }

    pub fn get(&self, path: &Path) -> Option<&AssetDependency> {
        self.records.get(path)
    }

    /// Insert or replace the record for an asset
    pub fn record(&mut self, dep: AssetDependency) {
        self.records.insert(dep.path.clone(), dep);
    }

    pub fn remove(&mut self, path: &Path) -> Option<AssetDependency> {
        self.records.remove(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Tracked asset paths, sorted
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.records.keys()
    }

    /// Group `assets` into dependency waves: every asset's dependencies
    /// (that are themselves in `assets`) land in an earlier wave
    ///
    /// Fails with [`Error::DependencyCycle`] when the records contain one.
    pub fn topo_waves(&self, assets: &HashSet<PathBuf>) -> Result<Vec<Vec<PathBuf>>> {
        // Kahn's algorithm restricted to the requested set
        let mut remaining: HashMap<PathBuf, HashSet<PathBuf>> = assets
            .iter()
            .map(|asset| {
                let deps = self
                    .records
                    .get(asset)
                    .map(|r| {
                        r.depends_on
                            .iter()
                            .filter(|d| assets.contains(*d))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                (asset.clone(), deps)
            })
            .collect();

        let mut waves = Vec::new();
        while !remaining.is_empty() {
            let mut wave: Vec<PathBuf> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(asset, _)| asset.clone())
                .collect();
            if wave.is_empty() {
                let mut stuck: Vec<String> =
                    remaining.keys().map(|p| p.display().to_string()).collect();
                stuck.sort();
                return Err(Error::DependencyCycle(stuck.join(", ")));
            }
            wave.sort();
            for asset in &wave {
                remaining.remove(asset);
            }
            for deps in remaining.values_mut() {
                for asset in &wave {
                    deps.remove(asset);
                }
            }
            waves.push(wave);
        }
        Ok(waves)
    }
}

/// Memoized per-run staleness evaluation over a dependency set
///
/// Work stays linear in the number of distinct assets touched: every asset
/// is hashed and evaluated at most once per build run.
pub struct StalenessChecker<'a> {
    set: &'a DependencySet,
    /// Directory source paths are resolved against
    source_root: &'a Path,
    memo: HashMap<PathBuf, bool>,
    in_progress: Vec<PathBuf>,
}

impl<'a> StalenessChecker<'a> {
    pub fn new(set: &'a DependencySet, source_root: &'a Path) -> Self {
        Self {
            set,
            source_root,
            memo: HashMap::new(),
            in_progress: Vec::new(),
        }
    }

    /// Decide whether a source asset needs reprocessing
    ///
    /// Stale when: no prior record exists, the current content hash differs
    /// from the recorded one, or any transitive dependency is stale.
    pub fn is_stale(&mut self, asset: &Path) -> Result<bool> {
        if let Some(&known) = self.memo.get(asset) {
            return Ok(known);
        }
        if self.in_progress.iter().any(|p| p == asset) {
            let chain: Vec<String> = self
                .in_progress
                .iter()
                .map(|p| p.display().to_string())
                .chain(std::iter::once(asset.display().to_string()))
                .collect();
            return Err(Error::DependencyCycle(chain.join(" -> ")));
        }

        self.in_progress.push(asset.to_path_buf());
        let result = self.evaluate(asset);
        self.in_progress.pop();

        let stale = result?;
        self.memo.insert(asset.to_path_buf(), stale);
        Ok(stale)
    }

    fn evaluate(&mut self, asset: &Path) -> Result<bool> {
        let record = match self.set.get(asset) {
            Some(r) => r,
            None => {
                debug!(asset = %asset.display(), "stale: no prior record");
                return Ok(true);
            }
        };

        let full = self.source_root.join(asset);
        if !full.exists() {
            debug!(asset = %asset.display(), "stale: source file missing");
            return Ok(true);
        }

        // Content hash is authoritative. The recorded mtime is informational
        // only; equal times still get a hash comparison.
        let current = hash::hash_file(HashAlgorithm::Sha256, &full)?;
        if current.value != record.content_hash {
            debug!(asset = %asset.display(), "stale: content hash changed");
            return Ok(true);
        }

        for dep in record.depends_on.clone() {
            if self.is_stale(&dep)? {
                debug!(asset = %asset.display(), dep = %dep.display(), "stale: dependency is stale");
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Observe a source file's current hash and mtime for a fresh record
pub fn observe(source_root: &Path, asset: &Path) -> Result<(String, Option<DateTime<Utc>>)> {
    let full = source_root.join(asset);
    let content_hash = hash::hash_file(HashAlgorithm::Sha256, &full)?.value;
    let modified = std::fs::metadata(&full)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);
    Ok((content_hash, modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_source(root: &Path, rel: &str, content: &[u8]) {
        let full = root.join(rel);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    fn record_current(set: &mut DependencySet, root: &Path, rel: &str, deps: &[&str]) {
        let (content_hash, modified) = observe(root, Path::new(rel)).unwrap();
        set.record(AssetDependency {
            path: PathBuf::from(rel),
            content_hash,
            modified,
            depends_on: deps.iter().map(PathBuf::from).collect(),
        });
    }

    #[test]
    fn test_no_record_is_stale() {
        let dir = TempDir::new().unwrap();
        write_source(dir.path(), "a.txt", b"a");
        let set = DependencySet::new();
        let mut checker = StalenessChecker::new(&set, dir.path());
        assert!(checker.is_stale(Path::new("a.txt")).unwrap());
    }

    #[test]
    fn test_unchanged_content_is_fresh() {
        let dir = TempDir::new().unwrap();
        write_source(dir.path(), "a.txt", b"a");
        let mut set = DependencySet::new();
        record_current(&mut set, dir.path(), "a.txt", &[]);
        let mut checker = StalenessChecker::new(&set, dir.path());
        assert!(!checker.is_stale(Path::new("a.txt")).unwrap());
    }

    #[test]
    fn test_content_change_is_stale_even_with_matching_record_time() {
        let dir = TempDir::new().unwrap();
        write_source(dir.path(), "a.txt", b"original");
        let mut set = DependencySet::new();
        record_current(&mut set, dir.path(), "a.txt", &[]);

        // Rewrite content but copy the recorded mtime into the record, so
        // only the hash can reveal the change
        write_source(dir.path(), "a.txt", b"modified");
        let meta = std::fs::metadata(dir.path().join("a.txt")).unwrap();
        let rec = set.get(Path::new("a.txt")).unwrap().clone();
        set.record(AssetDependency {
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            ..rec
        });

        let mut checker = StalenessChecker::new(&set, dir.path());
        assert!(checker.is_stale(Path::new("a.txt")).unwrap());
    }

    #[test]
    fn test_transitive_staleness() {
        let dir = TempDir::new().unwrap();
        write_source(dir.path(), "a.txt", b"a");
        write_source(dir.path(), "b.txt", b"b");
        write_source(dir.path(), "c.txt", b"c");
        write_source(dir.path(), "d.txt", b"d");

        let mut set = DependencySet::new();
        record_current(&mut set, dir.path(), "a.txt", &[]);
        record_current(&mut set, dir.path(), "b.txt", &["a.txt"]);
        record_current(&mut set, dir.path(), "c.txt", &["b.txt"]);
        record_current(&mut set, dir.path(), "d.txt", &[]);

        // Modify only A; C depends on B depends on A
        write_source(dir.path(), "a.txt", b"a changed");

        let mut checker = StalenessChecker::new(&set, dir.path());
        assert!(checker.is_stale(Path::new("a.txt")).unwrap());
        assert!(checker.is_stale(Path::new("b.txt")).unwrap());
        assert!(checker.is_stale(Path::new("c.txt")).unwrap());
        assert!(!checker.is_stale(Path::new("d.txt")).unwrap());
    }

    #[test]
    fn test_dependency_cycle_reported() {
        let dir = TempDir::new().unwrap();
        write_source(dir.path(), "a.txt", b"a");
        write_source(dir.path(), "b.txt", b"b");
        let mut set = DependencySet::new();
        record_current(&mut set, dir.path(), "a.txt", &["b.txt"]);
        record_current(&mut set, dir.path(), "b.txt", &["a.txt"]);

        let mut checker = StalenessChecker::new(&set, dir.path());
        let err = checker.is_stale(Path::new("a.txt")).unwrap_err();
        assert!(matches!(err, Error::DependencyCycle(_)));
    }

    #[test]
    fn test_sidecar_roundtrip_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let sidecar = dir.path().join("bundle.hdag.deps.json");

        assert!(DependencySet::load(&sidecar).unwrap().is_empty());

        let mut set = DependencySet::new();
        set.record(AssetDependency {
            path: PathBuf::from("a.txt"),
            content_hash: hash::sha256_hex(b"a"),
            modified: None,
            depends_on: vec![PathBuf::from("shared.cfg")],
        });
        set.save(&sidecar).unwrap();

        let loaded = DependencySet::load(&sidecar).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(
            loaded.get(Path::new("a.txt")).unwrap().depends_on,
            vec![PathBuf::from("shared.cfg")]
        );
    }

    #[test]
    fn test_topo_waves_order() {
        let mut set = DependencySet::new();
        for (path, deps) in [
            ("a.txt", vec![]),
            ("b.txt", vec!["a.txt"]),
            ("c.txt", vec!["b.txt"]),
            ("x.txt", vec![]),
        ] {
            set.record(AssetDependency {
                path: PathBuf::from(path),
                content_hash: String::new(),
                modified: None,
                depends_on: deps.into_iter().map(PathBuf::from).collect(),
            });
        }

        let assets: HashSet<PathBuf> = ["a.txt", "b.txt", "c.txt", "x.txt"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let waves = set.topo_waves(&assets).unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0], vec![PathBuf::from("a.txt"), PathBuf::from("x.txt")]);
        assert_eq!(waves[1], vec![PathBuf::from("b.txt")]);
        assert_eq!(waves[2], vec![PathBuf::from("c.txt")]);
    }

    #[test]
    fn test_topo_waves_cycle_error() {
        let mut set = DependencySet::new();
        for (path, dep) in [("a.txt", "b.txt"), ("b.txt", "a.txt")] {
            set.record(AssetDependency {
                path: PathBuf::from(path),
                content_hash: String::new(),
                modified: None,
                depends_on: vec![PathBuf::from(dep)],
            });
        }
        let assets: HashSet<PathBuf> =
            ["a.txt", "b.txt"].iter().map(PathBuf::from).collect();
        assert!(matches!(
            set.topo_waves(&assets).unwrap_err(),
            Error::DependencyCycle(_)
        ));
    }
}

// src/build/mod.rs

//! Incremental build engine
//!
//! Orchestrates reprocessing of stale source assets into bundle chunks and
//! graph nodes. The dependency tracker's topological order is the sole
//! inter-task ordering constraint: assets in the same wave have no edges
//! between them and run concurrently on a fixed-size worker pool. Results
//! are committed to the bundle on the build thread, so the chunk store and
//! graph only mutate single-threaded, inside the save transaction.
//!
//! Failure policy: an asset that fails marks every asset depending on it as
//! skipped (reported, never silent) without aborting unrelated branches.
//! Orphaned chunks are swept only after the whole pass.

mod cache;
mod processor;
mod report;

pub use cache::BuildCache;
pub use processor::{AssetProcessor, ProcessedAsset, RawFileProcessor};
pub use report::BuildReport;

use crate::bundle::{Bundle, FormatFlags};
use crate::cancel::{CancelToken, Deadline};
use crate::config::BuildOptions;
use crate::deps::{self, AssetDependency, DependencySet, StalenessChecker};
use crate::error::{Error, Result};
use crate::graph::PropertyValue;
use crate::hash::{self, HashAlgorithm};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Slash-separated graph path for a relative source path
fn graph_path(asset: &Path) -> String {
    asset
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Drives pack and incremental update runs over one source tree
pub struct BuildEngine<'a> {
    source_root: PathBuf,
    processor: &'a dyn AssetProcessor,
    options: &'a BuildOptions,
    cancel: CancelToken,
}

impl<'a> BuildEngine<'a> {
    pub fn new(
        source_root: impl Into<PathBuf>,
        processor: &'a dyn AssetProcessor,
        options: &'a BuildOptions,
    ) -> Self {
        Self {
            source_root: source_root.into(),
            processor,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// Use an external cancellation token (hot-reload loops share one)
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Full build: every listed source is treated as stale
    ///
    /// Writes the bundle and its dependency sidecar to `bundle_path`.
    pub fn pack(&self, sources: &[PathBuf], bundle_path: &Path) -> Result<(Bundle, BuildReport)> {
        let mut bundle = Bundle::create(self.options)?;
        let mut tracker = DependencySet::new();
        let stale: HashSet<PathBuf> = sources.iter().cloned().collect();

        let report = self.run(&mut bundle, &mut tracker, stale, sources.len())?;

        bundle.set_flag(FormatFlags::DEPENDENCY_TRACKING);
        bundle.save(bundle_path)?;
        tracker.save(&deps::sidecar_path(bundle_path))?;
        info!(bundle = %bundle_path.display(), %report, "pack finished");
        Ok((bundle, report))
    }

    /// Full build over every regular file under the source root
    pub fn pack_dir(&self, bundle_path: &Path) -> Result<(Bundle, BuildReport)> {
        let mut sources = Vec::new();
        for entry in walkdir::WalkDir::new(&self.source_root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            if let Ok(rel) = entry.path().strip_prefix(&self.source_root) {
                sources.push(rel.to_path_buf());
            }
        }
        self.pack(&sources, bundle_path)
    }

    /// Incremental update: reprocess the transitive stale set
    ///
    /// `changed` is a hint; content hashes decide actual staleness, so a
    /// touched-but-identical file stays unchanged. With an empty stale set
    /// the bundle file is not rewritten at all, which keeps a no-op update
    /// byte-identical.
    pub fn update(&self, bundle: &mut Bundle, changed: &[PathBuf]) -> Result<BuildReport> {
        let bundle_path = bundle
            .path()
            .ok_or_else(|| Error::Format("bundle has no backing file to update".to_string()))?
            .to_path_buf();
        let sidecar = deps::sidecar_path(&bundle_path);
        let mut tracker = DependencySet::load(&sidecar)?;

        // Candidates: everything tracked plus anything the caller names
        let mut candidates: HashSet<PathBuf> = tracker.paths().cloned().collect();
        candidates.extend(changed.iter().cloned());

        let mut checker = StalenessChecker::new(&tracker, &self.source_root);
        let mut stale = HashSet::new();
        for asset in &candidates {
            if checker.is_stale(asset)? {
                stale.insert(asset.clone());
            }
        }
        drop(checker);

        if stale.is_empty() {
            debug!("no stale assets, bundle left untouched");
            return Ok(BuildReport {
                unchanged: candidates.len(),
                ..Default::default()
            });
        }

        let report = self.run(bundle, &mut tracker, stale, candidates.len())?;

        bundle.set_flag(FormatFlags::DEPENDENCY_TRACKING);
        bundle.save(&bundle_path)?;
        tracker.save(&sidecar)?;
        info!(bundle = %bundle_path.display(), %report, "update finished");
        Ok(report)
    }

    /// Shared pass: order the stale set, process in waves, commit results
    fn run(
        &self,
        bundle: &mut Bundle,
        tracker: &mut DependencySet,
        stale: HashSet<PathBuf>,
        candidate_count: usize,
    ) -> Result<BuildReport> {
        let start = Instant::now();
        let deadline = Deadline::after(self.options.timeout);
        let mut report = BuildReport {
            unchanged: candidate_count - stale.len(),
            ..Default::default()
        };

        // Ordering needs dependency edges for assets never built before;
        // ask the processor and stage stub records into a working copy.
        let mut ordering = tracker.clone();
        for asset in &stale {
            if ordering.get(asset).is_none() {
                ordering.record(AssetDependency {
                    path: asset.clone(),
                    content_hash: String::new(),
                    modified: None,
                    depends_on: self.processor.dependencies(&self.source_root, asset)?,
                });
            }
        }
        let waves = ordering.topo_waves(&stale)?;
        debug!(
            stale = stale.len(),
            waves = waves.len(),
            workers = self.options.workers,
            "build pass starting"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.workers.max(1))
            .build()
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;

        let cache = match &self.options.cache_dir {
            Some(dir) => Some(BuildCache::new(dir, self.options.cache_limit)?),
            None => None,
        };

        // Assets that failed or were skipped; dependents of these are skipped
        let mut poisoned: HashMap<PathBuf, PathBuf> = HashMap::new();

        for wave in waves {
            self.cancel.check()?;
            deadline.check("incremental build")?;

            let mut runnable = Vec::new();
            for asset in wave {
                let bad_dep = ordering.get(&asset).and_then(|r| {
                    r.depends_on
                        .iter()
                        .find(|d| poisoned.contains_key(*d))
                        .cloned()
                });
                match bad_dep {
                    Some(dep) => {
                        warn!(asset = %asset.display(), dep = %dep.display(), "skipping: dependency failed");
                        poisoned.insert(asset.clone(), dep.clone());
                        report.skipped.push((asset, dep));
                    }
                    None => runnable.push(asset),
                }
            }

            let results: Vec<(PathBuf, Result<ProcessedAsset>)> = pool.install(|| {
                runnable
                    .par_iter()
                    .map(|asset| {
                        let outcome = if self.cancel.is_cancelled() {
                            Err(Error::Cancelled)
                        } else {
                            self.process_one(asset, cache.as_ref())
                        };
                        (asset.clone(), outcome)
                    })
                    .collect()
            });

            for (asset, outcome) in results {
                match outcome {
                    Ok(processed) => {
                        self.commit(bundle, tracker, &asset, processed, &mut report)?;
                    }
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        warn!(asset = %asset.display(), error = %e, "asset processing failed");
                        poisoned.insert(asset.clone(), asset.clone());
                        report.failed.push((asset, e.to_string()));
                    }
                }
            }
        }

        // Cache pruning is advisory; a failure never fails the build
        if let Some(cache) = &cache
            && let Err(e) = cache.prune()
        {
            warn!(error = %e, "build cache prune failed");
        }

        // Replaced assets leave their old chunks orphaned; reclaim them now
        // that the whole pass is done
        report.chunks_swept = bundle.sweep_orphans()?;
        report.duration = start.elapsed();
        Ok(report)
    }

    /// Process one asset, consulting the cache when one is configured
    fn process_one(&self, asset: &Path, cache: Option<&BuildCache>) -> Result<ProcessedAsset> {
        let key = match cache {
            Some(_) => hash::hash_file(HashAlgorithm::Sha256, &self.source_root.join(asset)).ok(),
            None => None,
        };
        if let (Some(cache), Some(key)) = (cache, &key)
            && let Some(hit) = cache.load(&key.value)
        {
            return Ok(hit);
        }
        let processed = self.processor.process(&self.source_root, asset)?;
        if let (Some(cache), Some(key)) = (cache, &key)
            && let Err(e) = cache.store(&key.value, &processed)
        {
            warn!(asset = %asset.display(), error = %e, "failed to write build cache entry");
        }
        Ok(processed)
    }

    /// Write one processed asset into the bundle and refresh its record
    fn commit(
        &self,
        bundle: &mut Bundle,
        tracker: &mut DependencySet,
        asset: &Path,
        processed: ProcessedAsset,
        report: &mut BuildReport,
    ) -> Result<()> {
        let before = bundle.chunks().len();
        let chunk = bundle.chunks_mut()?.put(&processed.content)?;
        if bundle.chunks().len() == before {
            report.chunks_deduplicated += 1;
        } else {
            report.chunks_added += 1;
        }

        let path_str = graph_path(asset);
        let node = match bundle.resolve(&path_str) {
            Ok(existing) => existing,
            Err(Error::PathNotFound(_)) => {
                let (parent, leaf) = bundle.ensure_parent(&path_str)?;
                let graph = bundle.graph_mut()?;
                let node = graph.create_node(processed.type_tag.clone());
                graph.add_edge(parent, node, leaf)?;
                node
            }
            Err(e) => return Err(e),
        };

        let graph = bundle.graph_mut()?;
        graph.set_property(node, "data", PropertyValue::Chunk(chunk))?;
        for (key, value) in processed.properties {
            graph.set_property(node, key, value)?;
        }

        let (content_hash, modified) = deps::observe(&self.source_root, asset)?;
        tracker.record(AssetDependency {
            path: asset.to_path_buf(),
            content_hash,
            modified,
            depends_on: processed.depends_on,
        });
        report.succeeded.push(asset.to_path_buf());
        Ok(())
    }
}

// src/build/report.rs

//! Build outcome reporting
//!
//! The engine aggregates per-asset results instead of failing the whole
//! run: one asset's import error marks its dependents as skipped but leaves
//! unrelated branches untouched. The report carries enough detail for a CLI
//! or CI consumer to present without reaching into engine internals.

use std::path::PathBuf;
use std::time::Duration;

/// Summary of one `pack` or `update` run
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    /// Assets reprocessed successfully this run
    pub succeeded: Vec<PathBuf>,
    /// Assets whose processing failed, with the cause
    pub failed: Vec<(PathBuf, String)>,
    /// Assets not attempted because a declared dependency failed
    /// (asset, failing dependency)
    pub skipped: Vec<(PathBuf, PathBuf)>,
    /// Tracked assets that were already up to date
    pub unchanged: usize,
    /// New chunks written to the store
    pub chunks_added: usize,
    /// Chunk writes that deduplicated against existing content
    pub chunks_deduplicated: usize,
    /// Orphaned chunks reclaimed by the post-build sweep
    pub chunks_swept: usize,
    /// Wall-clock duration of the run
    pub duration: Duration,
}

impl BuildReport {
    /// Number of assets actually reprocessed
    pub fn changed(&self) -> usize {
        self.succeeded.len()
    }

    /// True when nothing failed and nothing had to be skipped
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

impl std::fmt::Display for BuildReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} rebuilt, {} unchanged, {} failed, {} skipped; chunks: +{} ({} deduplicated, {} swept) in {:.2?}",
            self.succeeded.len(),
            self.unchanged,
            self.failed.len(),
            self.skipped.len(),
            self.chunks_added,
            self.chunks_deduplicated,
            self.chunks_swept,
            self.duration
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_classification() {
        let mut report = BuildReport::default();
        assert!(report.is_success());
        assert_eq!(report.changed(), 0);

        report.succeeded.push(PathBuf::from("a.png"));
        assert_eq!(report.changed(), 1);

        report
            .skipped
            .push((PathBuf::from("b.png"), PathBuf::from("a.png")));
        assert!(!report.is_success());
    }

    #[test]
    fn test_display_mentions_counts() {
        let report = BuildReport {
            succeeded: vec![PathBuf::from("a")],
            unchanged: 3,
            ..Default::default()
        };
        let line = report.to_string();
        assert!(line.contains("1 rebuilt"));
        assert!(line.contains("3 unchanged"));
    }
}

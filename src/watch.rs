// src/watch.rs

//! Polling source watcher for hot-reload loops
//!
//! Scans the source tree at a fixed interval and reports batches of paths
//! whose size or modification time changed since the previous scan, plus
//! files that appeared or disappeared. Paths are relative to the source
//! root, ready to hand to [`crate::build::BuildEngine::update`] as the
//! changed-asset hint; the engine's content hashing filters out touched
//! files whose bytes are unchanged.

use crate::cancel::CancelToken;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

fn scan(root: &Path) -> HashMap<PathBuf, FileStamp> {
    let mut stamps = HashMap::new();
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        stamps.insert(
            rel.to_path_buf(),
            FileStamp {
                len: meta.len(),
                modified: meta.modified().ok(),
            },
        );
    }
    stamps
}

fn diff(old: &HashMap<PathBuf, FileStamp>, new: &HashMap<PathBuf, FileStamp>) -> Vec<PathBuf> {
    let mut changed = Vec::new();
    for (path, stamp) in new {
        if old.get(path) != Some(stamp) {
            changed.push(path.clone());
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            changed.push(path.clone());
        }
    }
    changed.sort();
    changed
}

/// Background polling watcher over one source tree
///
/// Dropping the watcher stops the polling thread and joins it.
pub struct Watcher {
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Start polling `source_root` every `interval`
    ///
    /// Each batch of changed paths is sent on `tx`; the thread exits when
    /// the receiver is dropped or the watcher is cancelled. The baseline
    /// scan happens before this returns, so files created after `spawn`
    /// are always reported even if the first tick has not run yet. When
    /// the channel is full, batches accumulate and are delivered as one
    /// deduplicated batch once the receiver catches up; a slow consumer
    /// delays delivery but never blocks polling or drops a change.
    pub fn spawn(
        source_root: impl Into<PathBuf>,
        interval: Duration,
        tx: SyncSender<Vec<PathBuf>>,
    ) -> Self {
        let root = source_root.into();
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let mut previous = scan(&root);
        debug!(root = %root.display(), files = previous.len(), "watcher started");
        let handle = std::thread::spawn(move || {
            let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
            while !token.is_cancelled() {
                std::thread::sleep(interval);
                if token.is_cancelled() {
                    break;
                }
                let current = scan(&root);
                pending.extend(diff(&previous, &current));
                previous = current;
                if pending.is_empty() {
                    continue;
                }
                match tx.try_send(pending.iter().cloned().collect()) {
                    Ok(()) => {
                        debug!(count = pending.len(), "source changes delivered");
                        pending.clear();
                    }
                    Err(TrySendError::Full(_)) => {
                        debug!(count = pending.len(), "receiver busy, holding changes");
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        warn!("change receiver dropped, watcher stopping");
                        break;
                    }
                }
            }
        });
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop the polling thread without waiting for the next tick's send
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

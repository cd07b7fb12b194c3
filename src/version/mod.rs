// src/version/mod.rs

//! Format versioning and bundle migration
//!
//! The header's major version selects the content model. The reader opens
//! versions [`OLDEST_READABLE`]..=[`CURRENT_VERSION`] directly; anything
//! older must be migrated first. Migration loads the whole bundle, applies
//! every registered step in memory, and only then rewrites the file through
//! the usual atomic save, so a failing step leaves the original untouched.
//! When a single step spans the whole distance it is preferred over a chain.
//!
//! Version history:
//!   1  initial container; directory nodes tagged "directory", asset
//!      content stored under the "blob" property
//!   2  directory nodes retagged "dir"
//!   3  asset content property renamed "data"; dependency-tracking flag

use crate::bundle::{self, Bundle, FormatFlags, OpenMode};
use crate::error::{Error, Result};
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info};

/// Version written by this build
pub const CURRENT_VERSION: u16 = 3;

/// Oldest version the reader opens without migration
pub const OLDEST_READABLE: u16 = 2;

/// One entry in the per-version registry
pub struct VersionInfo {
    pub version: u16,
    /// Reader versions able to open this format directly
    pub readers: RangeInclusive<u16>,
    /// Header flag bits a bundle of this version may carry
    pub features: u32,
    /// Upgrade to the next registered version, `None` for the latest
    pub upgrade: Option<fn(&mut Bundle) -> Result<()>>,
}

/// Every format version this build knows about, oldest first
pub static VERSIONS: LazyLock<Vec<VersionInfo>> = LazyLock::new(|| {
    vec![
        VersionInfo {
            version: 1,
            readers: 1..=1,
            features: FormatFlags::COMPRESSION,
            upgrade: Some(migrate_v1_to_v2),
        },
        VersionInfo {
            version: 2,
            readers: 2..=CURRENT_VERSION,
            features: FormatFlags::COMPRESSION | FormatFlags::STREAMING,
            upgrade: Some(migrate_v2_to_v3),
        },
        VersionInfo {
            version: 3,
            readers: 3..=CURRENT_VERSION,
            features: FormatFlags::COMPRESSION
                | FormatFlags::ENCRYPTION
                | FormatFlags::STREAMING
                | FormatFlags::DEPENDENCY_TRACKING,
            upgrade: None,
        },
    ]
});

/// Registry entry for a format version, if this build knows it
pub fn info(version: u16) -> Option<&'static VersionInfo> {
    VERSIONS.iter().find(|v| v.version == version)
}

/// Whether a bundle of this version opens directly
pub fn is_supported(version: u16) -> bool {
    info(version).is_some_and(|v| v.readers.contains(&CURRENT_VERSION))
}

/// Header flag bits valid for a format version, if registered
pub fn allowed_flags(version: u16) -> Option<u32> {
    info(version).map(|v| v.features)
}

/// Error unless the version is directly readable
pub fn check_supported(version: u16) -> Result<()> {
    if is_supported(version) {
        Ok(())
    } else {
        Err(Error::VersionMismatch {
            found: version,
            supported_min: OLDEST_READABLE,
            supported_max: CURRENT_VERSION,
        })
    }
}

/// One planned upgrade step
#[derive(Clone, Copy)]
struct MigrationStep {
    from: u16,
    to: u16,
    apply: fn(&mut Bundle) -> Result<()>,
}

/// Combined jumps preferred over chaining the registry's adjacent upgrades
static COMBINED: &[MigrationStep] = &[MigrationStep {
    from: 1,
    to: 3,
    apply: migrate_v1_to_v3,
}];

/// v1 -> v2: retag "directory" nodes as "dir"
fn migrate_v1_to_v2(bundle: &mut Bundle) -> Result<()> {
    for node in bundle.graph_mut()?.nodes_mut() {
        if node.type_tag == "directory" {
            node.type_tag = "dir".to_string();
        }
    }
    Ok(())
}

/// v2 -> v3: rename the asset content property from "blob" to "data"
fn migrate_v2_to_v3(bundle: &mut Bundle) -> Result<()> {
    for node in bundle.graph_mut()?.nodes_mut() {
        for (key, _) in &mut node.properties {
            if key == "blob" {
                *key = "data".to_string();
            }
        }
    }
    Ok(())
}

/// v1 -> v3 in one pass, equivalent to chaining 1->2 and 2->3
fn migrate_v1_to_v3(bundle: &mut Bundle) -> Result<()> {
    migrate_v1_to_v2(bundle)?;
    migrate_v2_to_v3(bundle)
}

/// Greedy plan from `from` to `to`
///
/// Prefers the widest combined jump available at each position, falling
/// back to the registry's upgrade chain one version at a time.
fn plan(from: u16, to: u16) -> Result<Vec<MigrationStep>> {
    let mut steps = Vec::new();
    let mut at = from;
    while at < to {
        let combined = COMBINED
            .iter()
            .filter(|s| s.from == at && s.to <= to)
            .max_by_key(|s| s.to);
        let step = match combined {
            Some(step) => *step,
            None => {
                let entry = info(at).ok_or(Error::NoMigrationPath { from, to })?;
                let apply = entry.upgrade.ok_or(Error::NoMigrationPath { from, to })?;
                let next = VERSIONS
                    .iter()
                    .map(|v| v.version)
                    .filter(|&v| v > at)
                    .min()
                    .ok_or(Error::NoMigrationPath { from, to })?;
                MigrationStep {
                    from: at,
                    to: next,
                    apply,
                }
            }
        };
        steps.push(step);
        at = step.to;
    }
    Ok(steps)
}

/// Upgrade a bundle file in place to `target` (at most [`CURRENT_VERSION`])
///
/// All-or-nothing: the file is rewritten once, after every step succeeded
/// in memory. Already at or above `target` is a no-op or an error.
pub fn migrate(path: impl AsRef<Path>, target: u16) -> Result<()> {
    let path = path.as_ref();
    let found = bundle::read_version(path)?;
    if found == target {
        debug!(path = %path.display(), version = found, "already at target version");
        return Ok(());
    }
    if found > target || target > CURRENT_VERSION {
        return Err(Error::NoMigrationPath {
            from: found,
            to: target,
        });
    }
    let steps = plan(found, target)?;
    migrate_with_steps(path, &steps)?;
    info!(path = %path.display(), from = found, to = target, steps = steps.len(), "migrated bundle");
    Ok(())
}

/// Apply a planned step chain to a bundle file
///
/// Every step runs against the in-memory bundle; the file is rewritten
/// only after the whole chain succeeded, so a failing step leaves the
/// original bytes in place.
fn migrate_with_steps(path: &Path, steps: &[MigrationStep]) -> Result<()> {
    let raw = bundle::read_raw(path)?;
    let mut upgraded = Bundle::from_raw(raw, Some(path.to_path_buf()), OpenMode::ReadWrite)?;
    for step in steps {
        debug!(from = step.from, to = step.to, "applying migration step");
        (step.apply)(&mut upgraded)?;
        upgraded.set_format_version(step.to);
    }
    upgraded.save(path)
}

/// Open a bundle, migrating older versions first when allowed
///
/// With `allow_migration` false this behaves like [`Bundle::open`] and
/// reports a version mismatch for out-of-range files. Migration rewrites
/// the file, so it requires the file to be writable even for a read-only
/// handle.
pub fn open_versioned(
    path: impl AsRef<Path>,
    mode: OpenMode,
    allow_migration: bool,
) -> Result<Bundle> {
    let path = path.as_ref();
    let found = bundle::read_version(path)?;
    if is_supported(found) {
        return Bundle::open(path, mode);
    }
    if !allow_migration {
        return Err(Error::VersionMismatch {
            found,
            supported_min: OLDEST_READABLE,
            supported_max: CURRENT_VERSION,
        });
    }
    migrate(path, CURRENT_VERSION)?;
    Bundle::open(path, mode)
}

//! Commit pinning.
//!
//! tantivy garbage-collects segment files as soon as a commit or a merge
//! makes them unreachable. A pin hard-links every file of the committed
//! point into `snapshots/<generation>/`, so the file set survives until the
//! pin is released even if the live directory moves on.

use crate::error::{GriddleError, Result};
use crate::index::file_set::link_or_copy;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tantivy::index::SegmentId;
use tantivy::Index;

pub const META_FILE: &str = "meta.json";

const MAX_PIN_ATTEMPTS: usize = 8;

/// A pinned commit point. Files are names relative to `dir`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexCommit {
    pub generation: u64,
    pub files: BTreeSet<String>,
    pub dir: PathBuf,
}

impl IndexCommit {
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

struct Pin {
    refs: usize,
    commit: IndexCommit,
}

/// Reference-counted pins, one directory per generation.
pub struct SnapshotPolicy {
    dir: PathBuf,
    pins: Mutex<HashMap<u64, Pin>>,
}

/// Generation recorded in a commit payload, 0 for a fresh index.
pub fn payload_generation(payload: Option<&str>) -> u64 {
    payload.and_then(|p| p.trim().parse().ok()).unwrap_or(0)
}

fn segment_ids(metas: &tantivy::IndexMeta) -> Vec<SegmentId> {
    let mut ids: Vec<SegmentId> = metas.segments.iter().map(|s| s.id()).collect();
    ids.sort();
    ids
}

/// Every existing file of the committed point, `meta.json` included.
pub fn committed_files(data_dir: &Path, metas: &tantivy::IndexMeta) -> BTreeSet<String> {
    let mut files: BTreeSet<String> = metas
        .segments
        .iter()
        .flat_map(|segment| segment.list_files())
        .filter(|path| data_dir.join(path).is_file())
        .map(|path| path.to_string_lossy().to_string())
        .collect();
    files.insert(META_FILE.to_string());
    files
}

impl SnapshotPolicy {
    /// Pins left behind by a previous process are discarded.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
        Ok(SnapshotPolicy {
            dir,
            pins: Mutex::new(HashMap::new()),
        })
    }

    /// Pins the current commit of `index`. Callers hold the writer so no
    /// commit runs concurrently; background merges are handled by retrying.
    pub fn pin(&self, index: &Index, data_dir: &Path) -> Result<IndexCommit> {
        for attempt in 0..MAX_PIN_ATTEMPTS {
            let before = index.load_metas()?;
            let generation = payload_generation(before.payload.as_deref());

            // a merge after the pin does not change what the generation holds
            let mut pins = self.pins.lock();
            if let Some(pin) = pins.get_mut(&generation) {
                pin.refs += 1;
                return Ok(pin.commit.clone());
            }

            let files = committed_files(data_dir, &before);
            let pin_dir = self.dir.join(format!("{}.{}", generation, attempt));
            if pin_dir.exists() {
                std::fs::remove_dir_all(&pin_dir)?;
            }
            std::fs::create_dir_all(&pin_dir)?;

            let linked = files
                .iter()
                .try_for_each(|name| link_or_copy(&data_dir.join(name), &pin_dir.join(name)));
            let after = index.load_metas()?;
            let stable = segment_ids(&after) == segment_ids(&before)
                && after.opstamp == before.opstamp;

            match linked {
                Ok(()) if stable => {
                    let commit = IndexCommit {
                        generation,
                        files,
                        dir: pin_dir,
                    };
                    pins.insert(
                        generation,
                        Pin {
                            refs: 1,
                            commit: commit.clone(),
                        },
                    );
                    tracing::debug!(
                        "[SNAPSHOT] pinned generation {} ({} files)",
                        generation,
                        commit.files.len()
                    );
                    return Ok(commit);
                }
                Ok(()) => {
                    tracing::debug!("[SNAPSHOT] commit moved while pinning generation {}, retrying", generation);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!("[SNAPSHOT] file vanished while pinning generation {}, retrying", generation);
                }
                Err(e) => {
                    let _ = std::fs::remove_dir_all(&pin_dir);
                    return Err(e.into());
                }
            }
            let _ = std::fs::remove_dir_all(&pin_dir);
        }
        Err(GriddleError::Io(format!(
            "could not pin a stable commit in {} attempts",
            MAX_PIN_ATTEMPTS
        )))
    }

    /// Adds a reference to an already pinned generation.
    pub fn acquire(&self, generation: u64) -> Option<IndexCommit> {
        let mut pins = self.pins.lock();
        let pin = pins.get_mut(&generation)?;
        pin.refs += 1;
        Some(pin.commit.clone())
    }

    /// Drops one reference; the pin directory goes away with the last one.
    pub fn release(&self, generation: u64) {
        let mut pins = self.pins.lock();
        let Some(pin) = pins.get_mut(&generation) else {
            return;
        };
        pin.refs = pin.refs.saturating_sub(1);
        if pin.refs > 0 {
            return;
        }
        if let Some(pin) = pins.remove(&generation) {
            if let Err(e) = std::fs::remove_dir_all(&pin.commit.dir) {
                tracing::warn!(
                    "[SNAPSHOT] failed to remove pin {}: {}",
                    pin.commit.dir.display(),
                    e
                );
            }
        }
    }

    pub fn pinned_generations(&self) -> Vec<u64> {
        let mut out: Vec<u64> = self.pins.lock().keys().copied().collect();
        out.sort_unstable();
        out
    }
}

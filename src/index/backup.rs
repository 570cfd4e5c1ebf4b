use crate::error::Result;
use crate::index::engine::Engine;
use crate::index::file_set::copy_preserving_mtime;
use crate::index::snapshot::{payload_generation, IndexCommit, META_FILE};
use crate::index::storage_size::index_files;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tantivy::Index;

/// What a backup directory holds. All `None` means there is no backup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    pub version: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub total_bytes: Option<u64>,
    pub file_count: Option<usize>,
}

impl BackupStatus {
    pub fn is_empty(&self) -> bool {
        self.version.is_none()
    }

    /// Reads the status back from disk by opening `dir` as an index.
    pub fn read(dir: &Path) -> Result<Self> {
        let meta = dir.join(META_FILE);
        if !meta.is_file() {
            return Ok(BackupStatus::default());
        }
        let index = Index::open_in_dir(dir)?;
        let metas = index.load_metas()?;
        let files = index_files(dir)?;
        let modified: DateTime<Utc> = std::fs::metadata(&meta)?.modified()?.into();
        Ok(BackupStatus {
            version: Some(payload_generation(metas.payload.as_deref())),
            timestamp: Some(modified),
            total_bytes: Some(files.values().sum()),
            file_count: Some(files.len()),
        })
    }
}

fn unchanged(src: &Path, dst: &Path) -> Result<bool> {
    let Ok(existing) = std::fs::metadata(dst) else {
        return Ok(false);
    };
    let source = std::fs::metadata(src)?;
    Ok(existing.is_file()
        && existing.len() == source.len()
        && existing.modified()? == source.modified()?)
}

fn copy_commit(commit: &IndexCommit, dest: &Path) -> Result<(usize, usize)> {
    let mut copied = 0;
    // meta.json goes last so a torn copy never looks like a valid index
    let ordered = commit
        .files
        .iter()
        .filter(|name| name.as_str() != META_FILE)
        .chain(commit.files.iter().filter(|name| name.as_str() == META_FILE));
    for name in ordered {
        let src = commit.file_path(name);
        let dst = dest.join(name);
        if unchanged(&src, &dst)? {
            continue;
        }
        copy_preserving_mtime(&src, &dst)?;
        copied += 1;
    }

    let mut pruned = 0;
    for entry in std::fs::read_dir(dest)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type()?.is_file() && !commit.files.contains(&name) {
            std::fs::remove_file(entry.path())?;
            pruned += 1;
        }
    }
    Ok((copied, pruned))
}

/// Incrementally mirrors the current commit of `engine` into `dest`.
pub fn backup(engine: &Engine, dest: &Path) -> Result<BackupStatus> {
    std::fs::create_dir_all(dest)?;
    let commit = engine.snapshot()?;
    let result = copy_commit(&commit, dest);
    engine.release(commit.generation);

    match result {
        Ok((copied, pruned)) => {
            tracing::info!(
                "[BACKUP {}] generation {} to {}: {} copied, {} pruned",
                engine.name(),
                commit.generation,
                dest.display(),
                copied,
                pruned
            );
            BackupStatus::read(dest)
        }
        Err(e) => {
            tracing::warn!(
                "[BACKUP {}] failed at generation {}: {}",
                engine.name(),
                commit.generation,
                e
            );
            if let Err(cleanup) = std::fs::remove_dir_all(dest) {
                tracing::warn!(
                    "[BACKUP {}] could not remove partial backup {}: {}",
                    engine.name(),
                    dest.display(),
                    cleanup
                );
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    #[test]
    fn missing_backup_is_all_none() {
        let tmp = TempDir::new().unwrap();
        let status = BackupStatus::read(tmp.path()).unwrap();
        assert!(status.is_empty());
        assert_eq!(status, BackupStatus::default());
    }

    #[test]
    fn copy_commit_prunes_stale_files() {
        let tmp = TempDir::new().unwrap();
        let pin = tmp.path().join("pin");
        let dest = tmp.path().join("dest");
        std::fs::create_dir_all(&pin).unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(pin.join("a.idx"), b"aaaa").unwrap();
        std::fs::write(pin.join(META_FILE), b"{}").unwrap();
        std::fs::write(dest.join("old.idx"), b"stale").unwrap();

        let commit = IndexCommit {
            generation: 1,
            files: BTreeSet::from(["a.idx".to_string(), META_FILE.to_string()]),
            dir: pin,
        };
        assert_eq!(copy_commit(&commit, &dest).unwrap(), (2, 1));
        assert!(!dest.join("old.idx").exists());

        // second pass finds nothing to do
        assert_eq!(copy_commit(&commit, &dest).unwrap(), (0, 0));
    }
}

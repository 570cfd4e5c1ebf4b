//! On-disk size accounting for index directories and backups.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

/// Files tantivy keeps beside the segments that never belong to a commit.
pub const ENGINE_LOCAL_FILES: &[&str] = &[
    ".tantivy-writer.lock",
    ".tantivy-meta.lock",
    ".managed.json",
];

pub fn is_engine_local(name: &str) -> bool {
    ENGINE_LOCAL_FILES.contains(&name)
}

/// Recursively sum the sizes of all regular files under `path`.
///
/// Symlinks are skipped (not followed). Returns `Ok(0)` for a missing or
/// empty directory.
pub fn dir_size_bytes(path: &Path) -> io::Result<u64> {
    let mut total: u64 = 0;
    if !path.is_dir() {
        return Ok(0);
    }
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let ft = entry.file_type()?;
        if ft.is_symlink() {
            continue;
        }
        if ft.is_dir() {
            total += dir_size_bytes(&entry.path())?;
        } else if ft.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Top-level regular files of an index directory with their lengths,
/// engine-local files excluded.
pub fn index_files(path: &Path) -> io::Result<BTreeMap<String, u64>> {
    let mut out = BTreeMap::new();
    if !path.is_dir() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if is_engine_local(&name) {
            continue;
        }
        out.insert(name, entry.metadata()?.len());
    }
    Ok(out)
}

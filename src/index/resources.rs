use crate::error::{GriddleError, Result};
use crate::index::file_set::{check_name, write_bytes_atomic};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Change-detection fingerprint of a resource.
///
/// Equality means "unchanged": same length and same modification time in
/// milliseconds. Content is never hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub last_modified: i64,
    pub length: u64,
}

impl ResourceInfo {
    fn from_metadata(metadata: &std::fs::Metadata) -> Result<Self> {
        Ok(ResourceInfo {
            last_modified: millis(metadata.modified()?),
            length: metadata.len(),
        })
    }
}

fn millis(time: SystemTime) -> i64 {
    chrono::DateTime::<chrono::Utc>::from(time).timestamp_millis()
}

fn system_time(millis: i64) -> SystemTime {
    if millis >= 0 {
        UNIX_EPOCH + Duration::from_millis(millis as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
    }
}

/// Named auxiliary files stored beside an index.
#[derive(Debug, Clone)]
pub struct ResourceSet {
    dir: PathBuf,
}

impl ResourceSet {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        ResourceSet {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        Ok(self.dir.join(name))
    }

    /// All resources ordered by name.
    pub fn list(&self) -> Result<IndexMap<String, ResourceInfo>> {
        let mut out = Vec::new();
        if !self.dir.is_dir() {
            return Ok(IndexMap::new());
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.file_type()?.is_file() {
                continue;
            }
            out.push((name, ResourceInfo::from_metadata(&entry.metadata()?)?));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out.into_iter().collect())
    }

    pub fn info(&self, name: &str) -> Result<Option<ResourceInfo>> {
        let path = self.path(name)?;
        match std::fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => Ok(Some(ResourceInfo::from_metadata(&metadata)?)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path(name)?;
        if !path.is_file() {
            return Err(GriddleError::NotFound(format!("resource: {}", name)));
        }
        Ok(std::fs::read(path)?)
    }

    /// Installs `bytes` under `name`, stamped with `last_modified` so that a
    /// replica's fingerprint matches its master's.
    pub fn post(&self, name: &str, last_modified: i64, bytes: &[u8]) -> Result<ResourceInfo> {
        let path = self.path(name)?;
        std::fs::create_dir_all(&self.dir)?;
        write_bytes_atomic(&path, bytes)?;
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_modified(system_time(last_modified))?;
        drop(file);
        ResourceInfo::from_metadata(&std::fs::metadata(&path)?)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        if !path.is_file() {
            return Err(GriddleError::NotFound(format!("resource: {}", name)));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }
}

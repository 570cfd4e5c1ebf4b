//! On-disk layout of one index directory.
//!
//! ```text
//! <index>/settings.json      IndexSettings
//! <index>/fields.json        field name -> FieldDefinition (ordered)
//! <index>/analyzers.json     analyzer name -> AnalyzerDefinition (ordered)
//! <index>/uuid               identity of this index
//! <index>/master_uuid        replica only, identity of the master
//! <index>/resources/         auxiliary named files
//! <index>/data/              tantivy directory
//! <index>/snapshots/<gen>/   pinned commits
//! ```
//!
//! Every JSON/identity write goes through a temp file + rename so a crash
//! never leaves a half-written definition behind.

use crate::error::{GriddleError, Result};
use crate::index::analyzers::AnalyzerMap;
use crate::index::fields::FieldMap;
use crate::index::settings::IndexSettings;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const SETTINGS_FILE: &str = "settings.json";
pub const FIELDS_FILE: &str = "fields.json";
pub const ANALYZERS_FILE: &str = "analyzers.json";
pub const UUID_FILE: &str = "uuid";
pub const MASTER_UUID_FILE: &str = "master_uuid";
pub const RESOURCES_DIR: &str = "resources";
pub const DATA_DIR: &str = "data";
pub const SNAPSHOTS_DIR: &str = "snapshots";

#[derive(Debug, Clone)]
pub struct IndexFileSet {
    pub root: PathBuf,
    pub name: String,
    pub data_dir: PathBuf,
    pub resources_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    settings_file: PathBuf,
    fields_file: PathBuf,
    analyzers_file: PathBuf,
    uuid_file: PathBuf,
    master_uuid_file: PathBuf,
}

impl IndexFileSet {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| GriddleError::InvalidName(root.display().to_string()))?;
        check_name(&name)?;
        Ok(IndexFileSet {
            name,
            data_dir: root.join(DATA_DIR),
            resources_dir: root.join(RESOURCES_DIR),
            snapshots_dir: root.join(SNAPSHOTS_DIR),
            settings_file: root.join(SETTINGS_FILE),
            fields_file: root.join(FIELDS_FILE),
            analyzers_file: root.join(ANALYZERS_FILE),
            uuid_file: root.join(UUID_FILE),
            master_uuid_file: root.join(MASTER_UUID_FILE),
            root,
        })
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.resources_dir)?;
        std::fs::create_dir_all(&self.snapshots_dir)?;
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn load_settings(&self) -> Result<Option<IndexSettings>> {
        if !self.settings_file.exists() {
            return Ok(None);
        }
        IndexSettings::load(&self.settings_file).map(Some)
    }

    pub fn save_settings(&self, settings: &IndexSettings) -> Result<()> {
        settings.save(&self.settings_file)
    }

    pub fn load_fields(&self) -> Result<FieldMap> {
        read_json_or_default(&self.fields_file)
    }

    pub fn save_fields(&self, fields: &FieldMap) -> Result<()> {
        write_json_atomic(&self.fields_file, fields)
    }

    pub fn load_analyzers(&self) -> Result<AnalyzerMap> {
        read_json_or_default(&self.analyzers_file)
    }

    pub fn save_analyzers(&self, analyzers: &AnalyzerMap) -> Result<()> {
        write_json_atomic(&self.analyzers_file, analyzers)
    }

    /// Reads the index identity, assigning a fresh one on first open.
    pub fn load_or_create_uuid(&self) -> Result<Uuid> {
        if let Some(uuid) = read_uuid(&self.uuid_file)? {
            return Ok(uuid);
        }
        let uuid = Uuid::new_v4();
        write_bytes_atomic(&self.uuid_file, uuid.to_string().as_bytes())?;
        Ok(uuid)
    }

    pub fn read_master_uuid(&self) -> Result<Option<Uuid>> {
        read_uuid(&self.master_uuid_file)
    }

    pub fn write_master_uuid(&self, uuid: Uuid) -> Result<()> {
        write_bytes_atomic(&self.master_uuid_file, uuid.to_string().as_bytes())
    }
}

/// Rejects names that could escape their parent directory or collide with
/// temp files.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(GriddleError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn read_uuid(path: &Path) -> Result<Option<Uuid>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let uuid = Uuid::parse_str(raw.trim())
        .map_err(|e| GriddleError::Config(format!("{}: {}", path.display(), e)))?;
    Ok(Some(uuid))
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    write_bytes_atomic(path, content.as_bytes())
}

pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| GriddleError::InvalidName(path.display().to_string()))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Copies `src` to `dst` and stamps `dst` with the modification time of
/// `src`. Returns the number of bytes copied.
pub fn copy_preserving_mtime(src: &Path, dst: &Path) -> Result<u64> {
    let modified = std::fs::metadata(src)?.modified()?;
    let bytes = std::fs::copy(src, dst)?;
    let file = std::fs::OpenOptions::new().write(true).open(dst)?;
    file.set_modified(modified)?;
    Ok(bytes)
}

/// Hard-links `src` as `dst`, copying instead when the filesystem refuses
/// the link.
pub fn link_or_copy(src: &Path, dst: &Path) -> std::io::Result<()> {
    match std::fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(e),
        Err(_) => copy_preserving_mtime(src, dst)
            .map(|_| ())
            .map_err(|e| std::io::Error::other(e.to_string())),
    }
}

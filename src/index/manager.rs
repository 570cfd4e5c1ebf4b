use crate::error::{GriddleError, Result};
use crate::index::file_set::IndexFileSet;
use crate::index::instance::{IndexInstance, InstanceContext};
use crate::index::settings::IndexSettings;
use crate::index::snapshot::{payload_generation, META_FILE};
use crate::replication::poller::spawn_poller;
use crate::types::CheckStatus;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

struct ManagerState {
    settings: IndexSettings,
    instance: Option<Arc<IndexInstance>>,
}

/// Lifecycle owner of one index directory.
///
/// Holds at most one open [`IndexInstance`]. Opening, reconfiguring, checking
/// and deleting run under the exclusive lock; peeking at the open instance
/// only takes the shared one.
///
/// # Examples
///
/// ```rust,no_run
/// use griddle::{IndexInstanceManager, IndexSettings, InstanceContext, LocalConnector, SchemaGate};
///
/// # fn main() -> griddle::Result<()> {
/// let context = InstanceContext::new(SchemaGate::from_env()?, LocalConnector::new());
/// let manager = IndexInstanceManager::new("./data/books", context)?;
/// let books = manager.create_update(IndexSettings::default())?;
/// println!("{} docs", books.get_status()?.num_docs);
/// # Ok(())
/// # }
/// ```
pub struct IndexInstanceManager {
    files: IndexFileSet,
    context: InstanceContext,
    state: RwLock<ManagerState>,
}

impl IndexInstanceManager {
    pub fn new<P: AsRef<Path>>(dir: P, context: InstanceContext) -> Result<Self> {
        let files = IndexFileSet::new(dir)?;
        let settings = files.load_settings()?.unwrap_or_default();
        Ok(IndexInstanceManager {
            files,
            context,
            state: RwLock::new(ManagerState {
                settings,
                instance: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.files.name
    }

    pub fn files(&self) -> &IndexFileSet {
        &self.files
    }

    /// Opens the instance if it is not open yet.
    pub fn open(&self) -> Result<Arc<IndexInstance>> {
        let mut state = self.state.write();
        self.open_locked(&mut state)
    }

    fn open_locked(&self, state: &mut ManagerState) -> Result<Arc<IndexInstance>> {
        if let Some(instance) = &state.instance {
            return Ok(Arc::clone(instance));
        }
        self.files.ensure_dirs()?;
        if self.files.load_settings()?.is_none() {
            self.files.save_settings(&state.settings)?;
        }
        let instance = IndexInstance::open(
            self.files.clone(),
            state.settings.clone(),
            self.context.clone(),
        )?;
        self.start_poller(&instance, &state.settings);
        state.instance = Some(Arc::clone(&instance));
        Ok(instance)
    }

    fn start_poller(&self, instance: &Arc<IndexInstance>, settings: &IndexSettings) {
        if !settings.is_replica() || settings.replication_interval_secs == 0 {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(
                "[MANAGER {}] no runtime, replication runs on demand only",
                self.files.name
            );
            return;
        };
        let poller = spawn_poller(
            &handle,
            Arc::downgrade(instance),
            Duration::from_secs(settings.replication_interval_secs),
        );
        instance.attach_poller(poller);
    }

    fn close_locked(&self, state: &mut ManagerState) {
        if let Some(instance) = state.instance.take() {
            instance.close();
        }
    }

    /// Applies `settings`. Equal settings on an open instance are a no-op;
    /// anything else closes the instance and reopens it.
    pub fn create_update(&self, settings: IndexSettings) -> Result<Arc<IndexInstance>> {
        let mut state = self.state.write();
        if state.settings == settings {
            if let Some(instance) = &state.instance {
                return Ok(Arc::clone(instance));
            }
        }
        self.close_locked(&mut state);
        self.files.ensure_dirs()?;
        if state.settings != settings || self.files.load_settings()?.is_none() {
            self.files.save_settings(&settings)?;
            tracing::info!("[MANAGER {}] settings updated", self.files.name);
        }
        state.settings = settings;
        self.open_locked(&mut state)
    }

    /// Closes the instance and verifies every segment file checksum.
    pub fn check(&self) -> Result<CheckStatus> {
        let mut state = self.state.write();
        self.close_locked(&mut state);
        if !self.files.data_dir.join(META_FILE).is_file() {
            return Err(GriddleError::NotFound(format!(
                "index data: {}",
                self.files.name
            )));
        }
        let index = tantivy::Index::open_in_dir(&self.files.data_dir)?;
        let metas = index.load_metas()?;
        let mut corrupted: Vec<String> = index
            .validate_checksum()?
            .into_iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        corrupted.sort();
        let status = CheckStatus {
            clean: corrupted.is_empty(),
            segments: metas.segments.len(),
            num_docs: metas.segments.iter().map(|s| s.num_docs() as u64).sum(),
            generation: payload_generation(metas.payload.as_deref()),
            corrupted_files: corrupted,
        };
        tracing::info!(
            "[MANAGER {}] check done: {} segments, {} corrupted files",
            self.files.name,
            status.segments,
            status.corrupted_files.len()
        );
        Ok(status)
    }

    /// Closes the instance and removes its directory.
    pub fn delete(&self) -> Result<()> {
        let mut state = self.state.write();
        self.close_locked(&mut state);
        if self.files.exists() {
            std::fs::remove_dir_all(&self.files.root)?;
        }
        self.context.gate.forget(&self.files.name);
        tracing::info!("[MANAGER {}] deleted", self.files.name);
        Ok(())
    }

    pub fn close(&self) {
        let mut state = self.state.write();
        self.close_locked(&mut state);
    }

    pub fn get_index_instance(&self) -> Option<Arc<IndexInstance>> {
        self.state.read().instance.clone()
    }

    pub fn get_settings(&self) -> IndexSettings {
        self.state.read().settings.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.read().instance.is_some()
    }
}

impl Drop for IndexInstanceManager {
    fn drop(&mut self) {
        if let Some(instance) = self.state.get_mut().instance.take() {
            instance.close();
        }
    }
}

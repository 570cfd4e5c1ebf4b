use crate::error::{GriddleError, Result};
use crate::index::engine::Engine;
use crate::index::snapshot::IndexCommit;
use crate::replication::RevisionSession;
use parking_lot::Mutex;
use std::sync::Arc;

/// Segment-revision source of one master.
///
/// The newest published commit stays pinned so replicas can always check it
/// out; a checkout adds a reference that the replica gives back through
/// [`LocalReplicator::release`].
pub struct LocalReplicator {
    engine: Arc<Engine>,
    current: Mutex<Option<IndexCommit>>,
}

impl LocalReplicator {
    pub fn new(engine: Arc<Engine>) -> Self {
        LocalReplicator {
            engine,
            current: Mutex::new(None),
        }
    }

    /// Makes the latest commit the current revision.
    pub fn publish(&self) -> Result<u64> {
        let commit = self.engine.snapshot()?;
        let generation = commit.generation;
        let previous = self.current.lock().replace(commit);
        if let Some(previous) = previous {
            self.engine.release(previous.generation);
        }
        tracing::debug!(
            "[REPL {}] published generation {}",
            self.engine.name(),
            generation
        );
        Ok(generation)
    }

    pub fn current_generation(&self) -> Option<u64> {
        self.current.lock().as_ref().map(|commit| commit.generation)
    }

    pub fn checkout(&self) -> Result<Option<RevisionSession>> {
        let current = self.current.lock();
        let Some(commit) = current.as_ref() else {
            return Ok(None);
        };
        let commit = self.engine.acquire(commit.generation).ok_or_else(|| {
            GriddleError::NotFound(format!("revision {}", commit.generation))
        })?;
        let mut files = std::collections::BTreeMap::new();
        for name in &commit.files {
            match std::fs::metadata(commit.file_path(name)) {
                Ok(metadata) => {
                    files.insert(name.clone(), metadata.len());
                }
                Err(e) => {
                    self.engine.release(commit.generation);
                    return Err(e.into());
                }
            }
        }
        Ok(Some(RevisionSession {
            generation: commit.generation,
            files,
        }))
    }

    /// Reads one file of a checked-out revision.
    pub fn open_file(&self, generation: u64, name: &str) -> Result<Vec<u8>> {
        let commit = self
            .engine
            .acquire(generation)
            .ok_or_else(|| GriddleError::NotFound(format!("revision {}", generation)))?;
        let result = if commit.files.contains(name) {
            std::fs::read(commit.file_path(name)).map_err(GriddleError::from)
        } else {
            Err(GriddleError::NotFound(format!(
                "file {} of revision {}",
                name, generation
            )))
        };
        self.engine.release(generation);
        result
    }

    pub fn release(&self, generation: u64) {
        self.engine.release(generation);
    }

    /// Drops the current revision's pin.
    pub fn close(&self) {
        if let Some(commit) = self.current.lock().take() {
            self.engine.release(commit.generation);
        }
    }
}

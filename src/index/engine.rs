use crate::error::{GriddleError, Result};
use crate::index::document::ConvertedDocument;
use crate::index::schema::IndexSchema;
use crate::index::settings::IndexSettings;
use crate::index::snapshot::{payload_generation, IndexCommit, SnapshotPolicy, META_FILE};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tantivy::query::Query;
use tantivy::{Executor, Index, IndexReader, IndexWriter, ReloadPolicy, Searcher};

/// Thin wrapper over one tantivy index.
///
/// A master engine owns the writer and the snapshot policy. A replica engine
/// has neither; its data directory is filled by the replication client and
/// only the reader is ever refreshed.
pub struct Engine {
    name: String,
    index: Index,
    schema: IndexSchema,
    reader: IndexReader,
    writer: Mutex<Option<IndexWriter>>,
    generation: AtomicU64,
    snapshots: Option<SnapshotPolicy>,
    data_dir: PathBuf,
}

fn open_or_create(data_dir: &Path) -> Result<Index> {
    std::fs::create_dir_all(data_dir)?;
    if data_dir.join(META_FILE).exists() {
        Ok(Index::open_in_dir(data_dir)?)
    } else {
        Ok(Index::create_in_dir(data_dir, IndexSchema::build().schema)?)
    }
}

impl Engine {
    pub fn open_master(
        name: &str,
        data_dir: &Path,
        snapshots_dir: &Path,
        settings: &IndexSettings,
        executor: Executor,
    ) -> Result<Self> {
        let mut engine = Self::open(name, data_dir, executor)?;
        let writer: IndexWriter = match settings.writer_threads {
            Some(threads) => engine
                .index
                .writer_with_num_threads(threads.max(1), settings.writer_buffer_bytes())?,
            None => engine.index.writer(settings.writer_buffer_bytes())?,
        };
        engine.writer = Mutex::new(Some(writer));
        engine.snapshots = Some(SnapshotPolicy::new(snapshots_dir)?);
        tracing::info!(
            "[ENGINE {}] opened master at generation {}",
            name,
            engine.generation()
        );
        Ok(engine)
    }

    pub fn open_replica(name: &str, data_dir: &Path, executor: Executor) -> Result<Self> {
        let engine = Self::open(name, data_dir, executor)?;
        tracing::info!(
            "[ENGINE {}] opened replica at generation {}",
            name,
            engine.generation()
        );
        Ok(engine)
    }

    fn open(name: &str, data_dir: &Path, executor: Executor) -> Result<Self> {
        let mut index = open_or_create(data_dir)?;
        index.set_executor(executor);
        let schema = IndexSchema::from_tantivy(index.schema())?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let generation = payload_generation(index.load_metas()?.payload.as_deref());
        Ok(Engine {
            name: name.to_string(),
            index,
            schema,
            reader,
            writer: Mutex::new(None),
            generation: AtomicU64::new(generation),
            snapshots: None,
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn is_writable(&self) -> bool {
        self.writer.lock().is_some()
    }

    /// Last generation committed by this process, or read back on open.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Generation stamped in the `meta.json` currently on disk.
    pub fn committed_generation(&self) -> Result<u64> {
        Ok(payload_generation(self.index.load_metas()?.payload.as_deref()))
    }

    fn with_writer<T>(&self, f: impl FnOnce(&mut IndexWriter) -> Result<T>) -> Result<T> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or_else(|| {
            GriddleError::UnsupportedOperation(format!("index {} is read-only", self.name))
        })?;
        f(writer)
    }

    /// Adds documents, replacing any committed document with the same `_id`.
    pub fn upsert(&self, docs: Vec<ConvertedDocument>) -> Result<usize> {
        self.with_writer(|writer| {
            let count = docs.len();
            for converted in docs {
                writer.delete_term(self.schema.id_term(&converted.id));
                writer.add_document(converted.doc)?;
            }
            Ok(count)
        })
    }

    pub fn delete_ids(&self, ids: &[String]) -> Result<()> {
        self.with_writer(|writer| {
            for id in ids {
                writer.delete_term(self.schema.id_term(id));
            }
            Ok(())
        })
    }

    pub fn delete_query(&self, query: Box<dyn Query>) -> Result<()> {
        self.with_writer(|writer| {
            writer.delete_query(query)?;
            Ok(())
        })
    }

    pub fn delete_all(&self) -> Result<()> {
        self.with_writer(|writer| {
            writer.delete_all_documents()?;
            Ok(())
        })
    }

    /// Flushes and commits pending operations under the next generation.
    pub fn commit(&self) -> Result<u64> {
        self.with_writer(|writer| {
            let next = self.generation() + 1;
            let mut prepared = writer.prepare_commit()?;
            prepared.set_payload(&next.to_string());
            let opstamp = prepared.commit()?;
            self.generation.store(next, Ordering::SeqCst);
            tracing::debug!(
                "[COMMIT {}] generation {} at opstamp {}",
                self.name,
                next,
                opstamp
            );
            Ok(next)
        })
    }

    /// Live documents of the committed segments.
    pub fn num_docs(&self) -> Result<u64> {
        let metas = self.index.load_metas()?;
        Ok(metas.segments.iter().map(|s| s.num_docs() as u64).sum())
    }

    pub fn num_deleted_docs(&self) -> Result<u64> {
        let metas = self.index.load_metas()?;
        Ok(metas.segments.iter().map(|s| s.num_deleted_docs() as u64).sum())
    }

    pub fn segment_count(&self) -> Result<usize> {
        Ok(self.index.load_metas()?.segments.len())
    }

    pub fn searcher(&self) -> Searcher {
        self.reader.searcher()
    }

    /// Best-effort reload of the read view.
    pub fn refresh(&self) {
        if let Err(e) = self.reader.reload() {
            tracing::warn!("[ENGINE {}] reader reload failed: {}", self.name, e);
        }
    }

    /// Re-reads `meta.json` after the replication client replaced it.
    pub fn sync_generation(&self) -> Result<u64> {
        let generation = self.committed_generation()?;
        self.generation.store(generation, Ordering::SeqCst);
        self.refresh();
        Ok(generation)
    }

    /// Pins the current commit. Holding the writer lock keeps commits out
    /// while the file list is captured.
    pub fn snapshot(&self) -> Result<IndexCommit> {
        let policy = self.snapshots.as_ref().ok_or_else(|| {
            GriddleError::UnsupportedOperation(format!("index {} has no snapshots", self.name))
        })?;
        let _writer = self.writer.lock();
        policy.pin(&self.index, &self.data_dir)
    }

    pub fn acquire(&self, generation: u64) -> Option<IndexCommit> {
        self.snapshots.as_ref()?.acquire(generation)
    }

    pub fn release(&self, generation: u64) {
        if let Some(policy) = &self.snapshots {
            policy.release(generation);
        }
    }

    /// Drops the writer after its merges finish.
    pub fn close(&self) {
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.wait_merging_threads() {
                tracing::warn!("[ENGINE {}] merge threads failed on close: {}", self.name, e);
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

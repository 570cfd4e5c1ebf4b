//! One open index: documents, definitions, resources and replication.
//!
//! Readers never lock. The field map, the analyzer map and the analyzers
//! built from them live in one [`SchemaState`] swapped as a whole on every
//! structural edit. Structural edits are serialized by `edit_lock`, document
//! writes by `write_lock`, and replication cycles by a fair reentrant lock.

use crate::error::{GriddleError, Result};
use crate::index::admission::{AdmissionGate, Permit};
use crate::index::analyzers::{analyze, AnalyzerContext, AnalyzerDefinition, AnalyzerMap};
use crate::index::backup::{self, BackupStatus};
use crate::index::document::{stored_source, DocumentConverter};
use crate::index::engine::Engine;
use crate::index::facets::FacetsCache;
use crate::index::fields::{check_field_name, FieldDefinition, FieldMap};
use crate::index::file_set::{check_name, IndexFileSet};
use crate::index::resources::{ResourceInfo, ResourceSet};
use crate::index::settings::{IndexSettings, RemoteMaster};
use crate::index::storage_size::dir_size_bytes;
use crate::query::execution::{field_stats, find_by_id, terms_enum};
use crate::query::{
    Execution, ExplainDefinition, JoinQuery, Query, QueryDefinition, ResultDefinition,
    SearchTarget,
};
use crate::replication::{
    client, LocalReplicator, ReplicationConnector, ReplicationSource, RevisionSession,
};
use crate::types::{
    document_id, FieldStats, IndexStatus, MappedDocument, Role, TermDefinition,
    TermEnumDefinition,
};
use arc_swap::ArcSwap;
use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tantivy::TantivyDocument;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Definitions and the analyzers built from them, always consistent.
pub struct SchemaState {
    pub fields: FieldMap,
    pub analyzers: AnalyzerMap,
    pub context: AnalyzerContext,
}

/// Something derived from an instance's state, told to drop it whenever the
/// instance commits or changes its definitions.
pub trait InstanceDependent: Send + Sync {
    fn refresh(&self) -> Result<()>;
}

/// Capabilities shared by every instance of a schema.
#[derive(Clone)]
pub struct InstanceContext {
    pub gate: Arc<dyn AdmissionGate>,
    pub connector: Arc<dyn ReplicationConnector>,
}

impl InstanceContext {
    pub fn new(gate: Arc<dyn AdmissionGate>, connector: Arc<dyn ReplicationConnector>) -> Self {
        InstanceContext { gate, connector }
    }
}

/// A consistent read view: one searcher with the definitions in force.
pub struct ReadView {
    pub state: Arc<SchemaState>,
    pub target: SearchTarget,
}

pub struct IndexInstance {
    name: String,
    uuid: Uuid,
    role: Role,
    files: IndexFileSet,
    settings: IndexSettings,
    engine: Arc<Engine>,
    resources: ResourceSet,
    state: ArcSwap<SchemaState>,
    edit_lock: Mutex<()>,
    write_lock: Mutex<()>,
    backup_lock: Mutex<()>,
    replication_lock: ReentrantMutex<()>,
    facets: FacetsCache,
    dependents: Mutex<Vec<Weak<dyn InstanceDependent>>>,
    context: InstanceContext,
    replicator: Option<LocalReplicator>,
    poller: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

fn same_dependent(a: &Weak<dyn InstanceDependent>, b: &Arc<dyn InstanceDependent>) -> bool {
    a.as_ptr() as *const () == Arc::as_ptr(b) as *const ()
}

impl IndexInstance {
    pub fn open(
        files: IndexFileSet,
        settings: IndexSettings,
        context: InstanceContext,
    ) -> Result<Arc<Self>> {
        files.ensure_dirs()?;
        let name = files.name.clone();
        let uuid = files.load_or_create_uuid()?;
        let fields = files.load_fields()?;
        let analyzers = files.load_analyzers()?;
        let resources = ResourceSet::new(&files.resources_dir);
        let analyzer_context = AnalyzerContext::new(&fields, &analyzers, resources.dir())?;

        let executor = context.gate.executor();
        let (role, engine) = if settings.is_replica() {
            let engine = Engine::open_replica(&name, &files.data_dir, executor)?;
            (Role::Replica, Arc::new(engine))
        } else {
            let engine = Engine::open_master(
                &name,
                &files.data_dir,
                &files.snapshots_dir,
                &settings,
                executor,
            )?;
            (Role::Master, Arc::new(engine))
        };

        let replicator = match role {
            Role::Master => {
                let replicator = LocalReplicator::new(Arc::clone(&engine));
                replicator.publish()?;
                Some(replicator)
            }
            Role::Replica => None,
        };

        context.gate.record_docs(&name, engine.num_docs()?);
        let instance = Arc::new(IndexInstance {
            name,
            uuid,
            role,
            files,
            settings,
            engine,
            resources,
            state: ArcSwap::from_pointee(SchemaState {
                fields,
                analyzers,
                context: analyzer_context,
            }),
            edit_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            backup_lock: Mutex::new(()),
            replication_lock: ReentrantMutex::new(()),
            facets: FacetsCache::default(),
            dependents: Mutex::new(Vec::new()),
            context,
            replicator,
            poller: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        if instance.role == Role::Master {
            let weak = Arc::downgrade(&instance);
            let source: Weak<dyn ReplicationSource> = weak;
            instance.context.connector.publish(&instance.name, source);
        }
        tracing::info!(
            "[INSTANCE {}] opened as {:?} at generation {}",
            instance.name,
            instance.role,
            instance.engine.generation()
        );
        Ok(instance)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn facets_builds(&self) -> usize {
        self.facets.builds()
    }

    /// A read permit from this instance's schema gate.
    pub fn acquire_read(&self) -> Result<Permit> {
        self.context.gate.acquire_read()
    }

    /// Hands the background poller to the instance so `close` can stop it.
    pub fn attach_poller(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.poller.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops the poller, unpins published revisions and releases the writer.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
        if let Some(replicator) = &self.replicator {
            self.context.connector.withdraw(&self.name, self.uuid);
            replicator.close();
        }
        self.engine.close();
        tracing::info!("[INSTANCE {}] closed", self.name);
    }

    fn ensure_master(&self) -> Result<()> {
        match self.role {
            Role::Master => Ok(()),
            Role::Replica => Err(GriddleError::UnsupportedOperation(format!(
                "index {} is a replica",
                self.name
            ))),
        }
    }

    fn state(&self) -> Arc<SchemaState> {
        self.state.load_full()
    }

    // ── dependents ─────────────────────────────────────────────────────

    pub fn register(&self, dependent: &Arc<dyn InstanceDependent>) {
        let mut dependents = self.dependents.lock();
        if !dependents.iter().any(|d| same_dependent(d, dependent)) {
            dependents.push(Arc::downgrade(dependent));
        }
    }

    pub fn unregister(&self, dependent: &Arc<dyn InstanceDependent>) {
        self.dependents
            .lock()
            .retain(|d| d.strong_count() > 0 && !same_dependent(d, dependent));
    }

    pub fn dependents_count(&self) -> usize {
        self.dependents
            .lock()
            .iter()
            .filter(|d| d.strong_count() > 0)
            .count()
    }

    fn notify_dependents(&self) {
        let live: Vec<Arc<dyn InstanceDependent>> = {
            let mut dependents = self.dependents.lock();
            dependents.retain(|d| d.strong_count() > 0);
            dependents.iter().filter_map(Weak::upgrade).collect()
        };
        for dependent in live {
            if let Err(e) = dependent.refresh() {
                tracing::warn!("[INSTANCE {}] dependent refresh failed: {}", self.name, e);
            }
        }
    }

    // ── write path ─────────────────────────────────────────────────────

    /// Commits, publishes the revision, reloads the reader and notifies
    /// dependents.
    fn nrt_commit(&self) -> Result<u64> {
        let generation = self.engine.commit()?;
        if let Some(replicator) = &self.replicator {
            if let Err(e) = replicator.publish() {
                tracing::warn!(
                    "[COMMIT {}] publish of generation {} failed: {}",
                    self.name,
                    generation,
                    e
                );
            }
        }
        self.engine.refresh();
        self.context
            .gate
            .record_docs(&self.name, self.engine.num_docs()?);
        self.notify_dependents();
        Ok(generation)
    }

    pub fn post_mapped_documents(&self, documents: Vec<MappedDocument>) -> Result<usize> {
        let _permit = self.context.gate.acquire_write()?;
        self.ensure_master()?;
        if documents.is_empty() {
            return Ok(0);
        }
        self.context.gate.check_size(&self.name, documents.len())?;

        let state = self.state();
        let converter = DocumentConverter::new(self.engine.schema(), &state.fields, &state.context);
        let converted = documents
            .iter()
            .map(|document| converter.to_tantivy(document))
            .collect::<Result<Vec<_>>>()?;

        let _write = self.write_lock.lock();
        let count = self.engine.upsert(converted)?;
        self.nrt_commit()?;
        Ok(count)
    }

    pub fn post_mapped_document(&self, document: MappedDocument) -> Result<usize> {
        self.post_mapped_documents(vec![document])
    }

    pub fn post_documents(&self, documents: Vec<Value>) -> Result<usize> {
        let mapped = documents
            .into_iter()
            .map(into_mapped)
            .collect::<Result<Vec<_>>>()?;
        self.post_mapped_documents(mapped)
    }

    pub fn post_document(&self, document: Value) -> Result<usize> {
        self.post_mapped_documents(vec![into_mapped(document)?])
    }

    /// Merges the given fields into the stored documents with the same
    /// `_id`. Ids that are not indexed count for nothing.
    pub fn update_docs_values(&self, updates: Vec<MappedDocument>) -> Result<usize> {
        let _permit = self.context.gate.acquire_write()?;
        self.ensure_master()?;

        let state = self.state();
        let schema = self.engine.schema();
        let converter = DocumentConverter::new(schema, &state.fields, &state.context);

        let _write = self.write_lock.lock();
        let target = self.search_target()?;
        let mut converted = Vec::new();
        for update in &updates {
            let id = document_id(update)?.ok_or_else(|| {
                GriddleError::InvalidDocument("updating doc values requires an _id".into())
            })?;
            let Some(address) = find_by_id(&target, &id)? else {
                continue;
            };
            let stored: TantivyDocument = target.searcher.doc(address)?;
            let mut merged = stored_source(schema, &stored)?;
            for (name, value) in update {
                merged.insert(name.clone(), value.clone());
            }
            converted.push(converter.to_tantivy(&merged)?);
        }
        if converted.is_empty() {
            return Ok(0);
        }
        let count = self.engine.upsert(converted)?;
        self.nrt_commit()?;
        Ok(count)
    }

    pub fn update_doc_values(&self, update: MappedDocument) -> Result<usize> {
        self.update_docs_values(vec![update])
    }

    /// Returns how many documents the delete removed.
    pub fn delete_by_query(&self, query: &Query) -> Result<u64> {
        let _permit = self.context.gate.acquire_write()?;
        self.ensure_master()?;
        let state = self.state();
        let compiled = Execution::new(&state.fields, &state.context)
            .compile(self.engine.schema(), query)?;

        let _write = self.write_lock.lock();
        let before = self.engine.num_docs()?;
        self.engine.delete_query(compiled)?;
        self.nrt_commit()?;
        let after = self.engine.num_docs()?;
        Ok(before.saturating_sub(after))
    }

    pub fn delete_all(&self) -> Result<u64> {
        let _permit = self.context.gate.acquire_write()?;
        self.ensure_master()?;
        let _write = self.write_lock.lock();
        let before = self.engine.num_docs()?;
        self.engine.delete_all()?;
        self.nrt_commit()?;
        Ok(before)
    }

    // ── read path ──────────────────────────────────────────────────────

    fn search_target(&self) -> Result<SearchTarget> {
        let searcher = self.engine.searcher();
        let facets = self.facets.get(self.engine.schema(), &searcher)?;
        Ok(SearchTarget {
            index: None,
            searcher,
            schema: self.engine.schema().clone(),
            facets,
        })
    }

    /// Current searcher with the definitions in force. Callers hold their
    /// own read permit.
    pub fn read_view(&self) -> Result<ReadView> {
        let state = self.state();
        let target = self.search_target()?;
        Ok(ReadView { state, target })
    }

    pub fn search(&self, definition: &QueryDefinition) -> Result<ResultDefinition> {
        let _permit = self.context.gate.acquire_read()?;
        let view = self.read_view()?;
        Execution::new(&view.state.fields, &view.state.context).search(&[view.target], definition)
    }

    pub fn explain(&self, query: &Query, id: &str) -> Result<ExplainDefinition> {
        let _permit = self.context.gate.acquire_read()?;
        let view = self.read_view()?;
        Execution::new(&view.state.fields, &view.state.context).explain(&view.target, query, id)
    }

    pub fn get_terms_enum(
        &self,
        field: &str,
        prefix: Option<&str>,
        start: usize,
        rows: usize,
    ) -> Result<Vec<TermEnumDefinition>> {
        let _permit = self.context.gate.acquire_read()?;
        let view = self.read_view()?;
        let definition = field_of(&view.state.fields, field)?;
        terms_enum(
            &view.target.searcher,
            &view.target.schema,
            field,
            definition,
            prefix,
            start,
            rows,
        )
    }

    pub fn get_field_stats(&self, field: &str) -> Result<FieldStats> {
        let _permit = self.context.gate.acquire_read()?;
        let view = self.read_view()?;
        let definition = field_of(&view.state.fields, field)?;
        field_stats(&view.target.searcher, &view.target.schema, field, definition)
    }

    pub fn get_status(&self) -> Result<IndexStatus> {
        let _permit = self.context.gate.acquire_read()?;
        let state = self.state();
        Ok(IndexStatus {
            uuid: self.uuid,
            master_uuid: self.files.read_master_uuid()?,
            role: self.role,
            num_docs: self.engine.num_docs()?,
            num_deleted_docs: self.engine.num_deleted_docs()?,
            segments: self.engine.segment_count()?,
            generation: self.engine.generation(),
            size_bytes: dir_size_bytes(&self.files.data_dir)?,
            fields: state.fields.keys().cloned().collect(),
            analyzers: state.analyzers.keys().cloned().collect(),
            settings: self.settings.clone(),
        })
    }

    /// Turns the `from_field` values of this index's matches into a term
    /// set query on `to_field`, to run against another index.
    pub fn create_join_query(&self, join: &JoinQuery) -> Result<Query> {
        let _permit = self.context.gate.acquire_read()?;
        let view = self.read_view()?;
        let from_query = join.from_query.clone().unwrap_or(Query::MatchAll);
        let values = Execution::new(&view.state.fields, &view.state.context).join_values(
            &view.target,
            &from_query,
            &join.from_field,
        )?;
        Ok(Query::TermSet {
            field: join.to_field.clone(),
            values,
        })
    }

    // ── backup ─────────────────────────────────────────────────────────

    /// Mirrors the current commit into `dir`. Backups of one instance run
    /// one at a time so a prune never races another backup's copy.
    pub fn backup(&self, dir: &Path) -> Result<BackupStatus> {
        let _permit = self.context.gate.acquire_read()?;
        self.ensure_master()?;
        let _backup = self.backup_lock.lock();
        backup::backup(&self.engine, dir)
    }

    pub fn get_backup(&self, dir: &Path) -> Result<BackupStatus> {
        let _permit = self.context.gate.acquire_read()?;
        self.ensure_master()?;
        BackupStatus::read(dir)
    }

    // ── definitions ────────────────────────────────────────────────────

    pub fn get_settings(&self) -> IndexSettings {
        self.settings.clone()
    }

    pub fn get_fields(&self) -> FieldMap {
        self.state().fields.clone()
    }

    pub fn get_field(&self, name: &str) -> Result<FieldDefinition> {
        field_of(&self.state().fields, name).cloned()
    }

    pub fn get_analyzers(&self) -> AnalyzerMap {
        self.state().analyzers.clone()
    }

    pub fn get_analyzer(&self, name: &str) -> Result<AnalyzerDefinition> {
        self.state()
            .analyzers
            .get(name)
            .cloned()
            .ok_or_else(|| GriddleError::NotFound(format!("analyzer: {}", name)))
    }

    pub fn test_analyzer(&self, name: &str, text: &str) -> Result<Vec<TermDefinition>> {
        let definition = self.get_analyzer(name)?;
        let analyzer = definition.build(self.resources.dir())?;
        Ok(analyze(&analyzer, text))
    }

    /// Builds the analyzers for the new maps, persists what changed and
    /// swaps the state. Callers hold `edit_lock`. Nothing is touched when
    /// the analyzers cannot be built.
    fn install(&self, fields: FieldMap, analyzers: AnalyzerMap) -> Result<()> {
        let context = AnalyzerContext::new(&fields, &analyzers, self.resources.dir())?;
        let current = self.state();
        if current.fields != fields {
            self.files.save_fields(&fields)?;
        }
        if current.analyzers != analyzers {
            self.files.save_analyzers(&analyzers)?;
        }
        self.state.store(Arc::new(SchemaState {
            fields,
            analyzers,
            context,
        }));
        self.notify_dependents();
        Ok(())
    }

    /// Rebuilds analyzers after a resource changed. A definition that no
    /// longer builds keeps its previous analyzers.
    fn reload_analyzers(&self) {
        let current = self.state();
        let fields = current.fields.clone();
        let analyzers = current.analyzers.clone();
        if let Err(e) = self.install(fields, analyzers) {
            tracing::warn!(
                "[INSTANCE {}] analyzers kept after resource change: {}",
                self.name,
                e
            );
        }
    }

    pub fn set_fields(&self, fields: FieldMap) -> Result<()> {
        self.ensure_master()?;
        for name in fields.keys() {
            check_field_name(name)?;
        }
        let _edit = self.edit_lock.lock();
        let analyzers = self.state().analyzers.clone();
        self.install(fields, analyzers)
    }

    /// Replaces the definition of an existing field.
    pub fn set_field(&self, name: &str, definition: FieldDefinition) -> Result<()> {
        self.ensure_master()?;
        let _edit = self.edit_lock.lock();
        let current = self.state();
        field_of(&current.fields, name)?;
        let mut fields = current.fields.clone();
        fields.insert(name.to_string(), definition);
        self.install(fields, current.analyzers.clone())
    }

    pub fn delete_field(&self, name: &str) -> Result<()> {
        self.ensure_master()?;
        let _edit = self.edit_lock.lock();
        let current = self.state();
        field_of(&current.fields, name)?;
        let mut fields = current.fields.clone();
        fields.shift_remove(name);
        self.install(fields, current.analyzers.clone())
    }

    pub fn set_analyzers(&self, analyzers: AnalyzerMap) -> Result<()> {
        self.ensure_master()?;
        for (name, definition) in &analyzers {
            check_name(name)?;
            definition.build(self.resources.dir())?;
        }
        let _edit = self.edit_lock.lock();
        let fields = self.state().fields.clone();
        self.install(fields, analyzers)
    }

    /// Adds or replaces one analyzer.
    pub fn set_analyzer(&self, name: &str, definition: AnalyzerDefinition) -> Result<()> {
        self.ensure_master()?;
        check_name(name)?;
        definition.build(self.resources.dir())?;
        let _edit = self.edit_lock.lock();
        let current = self.state();
        let mut analyzers = current.analyzers.clone();
        analyzers.insert(name.to_string(), definition);
        self.install(current.fields.clone(), analyzers)
    }

    pub fn delete_analyzer(&self, name: &str) -> Result<()> {
        self.ensure_master()?;
        let _edit = self.edit_lock.lock();
        let current = self.state();
        if !current.analyzers.contains_key(name) {
            return Err(GriddleError::NotFound(format!("analyzer: {}", name)));
        }
        let mut analyzers = current.analyzers.clone();
        analyzers.shift_remove(name);
        self.install(current.fields.clone(), analyzers)
    }

    // ── resources ──────────────────────────────────────────────────────

    pub fn get_resources(&self) -> Result<IndexMap<String, ResourceInfo>> {
        self.resources.list()
    }

    pub fn get_resource(&self, name: &str) -> Result<Vec<u8>> {
        self.resources.get(name)
    }

    pub fn post_resource(&self, name: &str, last_modified: i64, bytes: &[u8]) -> Result<ResourceInfo> {
        self.ensure_master()?;
        let _edit = self.edit_lock.lock();
        let info = self.resources.post(name, last_modified, bytes)?;
        self.reload_analyzers();
        Ok(info)
    }

    /// Removes a resource no analyzer reads.
    pub fn delete_resource(&self, name: &str) -> Result<()> {
        self.ensure_master()?;
        let _edit = self.edit_lock.lock();
        let state = self.state();
        if let Some((analyzer, _)) = state
            .analyzers
            .iter()
            .find(|(_, definition)| definition.uses_resource(name))
        {
            return Err(GriddleError::NotAcceptable(format!(
                "resource {} is used by analyzer {}",
                name, analyzer
            )));
        }
        self.resources.delete(name)?;
        self.reload_analyzers();
        Ok(())
    }

    // ── replication, master side ───────────────────────────────────────

    pub fn check_remote_master_uuid(&self, claimed: Uuid) -> Result<()> {
        if claimed != self.uuid {
            return Err(GriddleError::NotAcceptable(format!(
                "index {} has uuid {}, not {}",
                self.name, self.uuid, claimed
            )));
        }
        Ok(())
    }

    pub fn get_replicator(&self, claimed: Uuid) -> Result<&LocalReplicator> {
        self.check_remote_master_uuid(claimed)?;
        self.replicator.as_ref().ok_or_else(|| {
            GriddleError::UnsupportedOperation(format!("index {} is a replica", self.name))
        })
    }

    // ── replication, replica side ──────────────────────────────────────

    /// Runs one full replication cycle. Concurrent calls queue up behind the
    /// replication lock and each runs its own cycle.
    pub fn replication_check(&self) -> Result<()> {
        let master = self.settings.master.as_ref().ok_or_else(|| {
            GriddleError::NotAcceptable(format!(
                "index {} has no replication source",
                self.name
            ))
        })?;
        let _permit = self.context.gate.acquire_write()?;
        let guard = self.replication_lock.lock();
        let result = self.replicate(master);
        ReentrantMutexGuard::unlock_fair(guard);
        result
    }

    fn replicate(&self, master: &RemoteMaster) -> Result<()> {
        let source = self.context.connector.connect(master)?;
        let recorded = self.files.read_master_uuid()?;
        let claimed = recorded.unwrap_or_else(|| source.uuid());
        source.check_master_uuid(claimed)?;
        if recorded.is_none() {
            self.files.write_master_uuid(claimed)?;
            tracing::info!(
                "[REPL {}] bound to master {} ({})",
                self.name,
                master.index,
                claimed
            );
        }

        {
            let _edit = self.edit_lock.lock();
            let changed = self.sync_resources(source.as_ref())?;
            let fields = source.get_fields()?;
            let analyzers = source.get_analyzers()?;
            let current = self.state();
            if changed > 0 || current.fields != fields || current.analyzers != analyzers {
                self.install(fields, analyzers)?;
            }
        }

        let pulled = client::pull(&self.engine, source.as_ref(), claimed)?;
        if pulled.is_some() {
            self.context
                .gate
                .record_docs(&self.name, self.engine.num_docs()?);
            self.notify_dependents();
        }
        tracing::info!(
            "[REPL {}] cycle done at generation {}",
            self.name,
            self.engine.generation()
        );
        Ok(())
    }

    /// Mirrors the master's resources. Every resource is attempted; the
    /// first failure is reported once the pass is over.
    fn sync_resources(&self, source: &dyn ReplicationSource) -> Result<usize> {
        let remote = source.get_resources()?;
        let local = self.resources.list()?;
        let mut changed = 0;
        let mut failure: Option<GriddleError> = None;

        for (name, info) in &remote {
            if local.get(name) == Some(info) {
                continue;
            }
            let fetched = source
                .get_resource(name)
                .and_then(|bytes| self.resources.post(name, info.last_modified, &bytes));
            match fetched {
                Ok(_) => changed += 1,
                Err(e) => {
                    tracing::warn!("[REPL {}] resource {} failed: {}", self.name, name, e);
                    failure.get_or_insert(GriddleError::Replication {
                        resource: name.clone(),
                        index: self.name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        for name in local.keys() {
            if remote.contains_key(name) {
                continue;
            }
            match self.resources.delete(name) {
                Ok(()) => changed += 1,
                Err(e) => {
                    failure.get_or_insert(GriddleError::Replication {
                        resource: name.clone(),
                        index: self.name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(changed),
        }
    }
}

fn field_of<'a>(fields: &'a FieldMap, name: &str) -> Result<&'a FieldDefinition> {
    fields
        .get(name)
        .ok_or_else(|| GriddleError::NotFound(format!("field: {}", name)))
}

fn into_mapped(document: Value) -> Result<MappedDocument> {
    match document {
        Value::Object(map) => Ok(map),
        other => Err(GriddleError::InvalidDocument(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

impl ReplicationSource for IndexInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn check_master_uuid(&self, claimed: Uuid) -> Result<()> {
        self.check_remote_master_uuid(claimed)
    }

    fn get_resources(&self) -> Result<IndexMap<String, ResourceInfo>> {
        self.resources.list()
    }

    fn get_resource(&self, name: &str) -> Result<Vec<u8>> {
        self.resources.get(name)
    }

    fn get_fields(&self) -> Result<FieldMap> {
        Ok(self.state().fields.clone())
    }

    fn get_analyzers(&self) -> Result<AnalyzerMap> {
        Ok(self.state().analyzers.clone())
    }

    fn checkout(&self, claimed: Uuid) -> Result<Option<RevisionSession>> {
        self.get_replicator(claimed)?.checkout()
    }

    fn open_file(&self, generation: u64, name: &str) -> Result<Vec<u8>> {
        match &self.replicator {
            Some(replicator) => replicator.open_file(generation, name),
            None => Err(GriddleError::UnsupportedOperation(format!(
                "index {} is a replica",
                self.name
            ))),
        }
    }

    fn release(&self, generation: u64) {
        if let Some(replicator) = &self.replicator {
            replicator.release(generation);
        }
    }
}

impl Drop for IndexInstance {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::admission::{AdmissionConfig, SchemaGate};
    use crate::index::analyzers::FilterDefinition;
    use crate::replication::LocalConnector;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    fn context() -> InstanceContext {
        let gate = SchemaGate::new(AdmissionConfig {
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap();
        InstanceContext::new(Arc::new(gate), LocalConnector::new())
    }

    fn master(tmp: &TempDir, name: &str) -> Arc<IndexInstance> {
        let files = IndexFileSet::new(tmp.path().join(name)).unwrap();
        let settings = IndexSettings {
            writer_threads: Some(1),
            ..Default::default()
        };
        IndexInstance::open(files, settings, context()).unwrap()
    }

    fn title_fields() -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert(
            "title".into(),
            FieldDefinition::Text {
                analyzer: None,
                query_analyzer: None,
            },
        );
        fields.insert("price".into(), FieldDefinition::Double);
        fields
    }

    fn doc(v: Value) -> MappedDocument {
        v.as_object().unwrap().clone()
    }

    struct Counter(AtomicUsize);

    impl InstanceDependent for Counter {
        fn refresh(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn post_then_search() {
        let tmp = TempDir::new().unwrap();
        let instance = master(&tmp, "books");
        instance.set_fields(title_fields()).unwrap();

        let posted = instance
            .post_mapped_document(doc(json!({"_id": "1", "title": "hello world", "price": 3.5})))
            .unwrap();
        assert_eq!(posted, 1);

        let result = instance.search(&QueryDefinition::default()).unwrap();
        assert_eq!(result.total_hits, 1);
        assert_eq!(result.documents[0].id, "1");
    }

    #[test]
    fn posting_an_existing_id_replaces_it() {
        let tmp = TempDir::new().unwrap();
        let instance = master(&tmp, "books");
        instance.set_fields(title_fields()).unwrap();
        instance
            .post_mapped_document(doc(json!({"_id": "1", "title": "first"})))
            .unwrap();
        instance
            .post_mapped_document(doc(json!({"_id": "1", "title": "second"})))
            .unwrap();
        assert_eq!(instance.get_status().unwrap().num_docs, 1);
    }

    #[test]
    fn unknown_field_rejects_the_whole_batch() {
        let tmp = TempDir::new().unwrap();
        let instance = master(&tmp, "books");
        instance.set_fields(title_fields()).unwrap();
        let err = instance
            .post_mapped_documents(vec![
                doc(json!({"title": "ok"})),
                doc(json!({"author": "nope"})),
            ])
            .unwrap_err();
        assert!(matches!(err, GriddleError::InvalidDocument(_)));
        assert_eq!(instance.get_status().unwrap().num_docs, 0);
    }

    #[test]
    fn update_doc_values_merges_into_stored_document() {
        let tmp = TempDir::new().unwrap();
        let instance = master(&tmp, "books");
        instance.set_fields(title_fields()).unwrap();
        instance
            .post_mapped_document(doc(json!({"_id": "1", "title": "dune", "price": 9.0})))
            .unwrap();

        assert_eq!(
            instance
                .update_doc_values(doc(json!({"_id": "1", "price": 4.0})))
                .unwrap(),
            1
        );
        assert_eq!(
            instance
                .update_doc_values(doc(json!({"_id": "missing", "price": 1.0})))
                .unwrap(),
            0
        );

        let result = instance.search(&QueryDefinition::default()).unwrap();
        assert_eq!(result.total_hits, 1);
        let fields = &result.documents[0].fields;
        assert_eq!(fields.get("title"), Some(&json!("dune")));
        assert_eq!(fields.get("price"), Some(&json!(4.0)));
    }

    #[test]
    fn set_field_requires_existing_field() {
        let tmp = TempDir::new().unwrap();
        let instance = master(&tmp, "books");
        instance.set_fields(title_fields()).unwrap();
        let before = instance.get_fields();

        let err = instance
            .set_field("author", FieldDefinition::String)
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(instance.delete_field("author").unwrap_err().is_not_found());
        assert_eq!(instance.get_fields(), before);

        instance.set_field("price", FieldDefinition::Long).unwrap();
        assert_eq!(instance.get_field("price").unwrap(), FieldDefinition::Long);
        instance.delete_field("price").unwrap();
        assert!(instance.get_field("price").unwrap_err().is_not_found());
    }

    #[test]
    fn missing_analyzer_keeps_previous_state() {
        let tmp = TempDir::new().unwrap();
        let instance = master(&tmp, "books");
        instance.set_fields(title_fields()).unwrap();
        let mut fields = title_fields();
        fields.insert(
            "body".into(),
            FieldDefinition::Text {
                analyzer: Some("french".into()),
                query_analyzer: None,
            },
        );
        assert!(instance.set_fields(fields).unwrap_err().is_not_found());
        assert_eq!(instance.get_fields(), title_fields());
        assert!(instance.delete_analyzer("french").unwrap_err().is_not_found());
    }

    #[test]
    fn definitions_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let instance = master(&tmp, "books");
        instance.set_fields(title_fields()).unwrap();
        instance
            .set_analyzer("plain", AnalyzerDefinition::default())
            .unwrap();
        instance.close();
        drop(instance);

        let reopened = master(&tmp, "books");
        assert_eq!(reopened.get_fields(), title_fields());
        assert!(reopened.get_analyzers().contains_key("plain"));
    }

    #[test]
    fn test_analyzer_reports_tokens() {
        let tmp = TempDir::new().unwrap();
        let instance = master(&tmp, "books");
        instance
            .set_analyzer(
                "plain",
                AnalyzerDefinition {
                    filters: vec![FilterDefinition::Lowercase],
                    ..Default::default()
                },
            )
            .unwrap();
        let terms = instance.test_analyzer("plain", "Hello World").unwrap();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[1].term, "world");
        assert!(instance.test_analyzer("other", "x").unwrap_err().is_not_found());
    }

    #[test]
    fn dependents_are_notified_on_commit_and_edit() {
        let tmp = TempDir::new().unwrap();
        let instance = master(&tmp, "books");
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let dependent: Arc<dyn InstanceDependent> = counter.clone();
        instance.register(&dependent);
        instance.register(&dependent);
        assert_eq!(instance.dependents_count(), 1);

        instance.set_fields(title_fields()).unwrap();
        instance
            .post_mapped_document(doc(json!({"title": "x"})))
            .unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);

        instance.unregister(&dependent);
        instance.delete_all().unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn master_uuid_check() {
        let tmp = TempDir::new().unwrap();
        let instance = master(&tmp, "books");
        assert!(instance.check_remote_master_uuid(instance.uuid()).is_ok());
        let err = instance
            .check_remote_master_uuid(Uuid::new_v4())
            .unwrap_err();
        assert!(matches!(err, GriddleError::NotAcceptable(_)));
        assert!(instance.get_replicator(Uuid::new_v4()).is_err());
    }

    #[test]
    fn replication_without_master_is_not_acceptable() {
        let tmp = TempDir::new().unwrap();
        let instance = master(&tmp, "books");
        let err = instance.replication_check().unwrap_err();
        assert!(matches!(err, GriddleError::NotAcceptable(_)));
    }

    #[test]
    fn join_query_collects_values() {
        let tmp = TempDir::new().unwrap();
        let instance = master(&tmp, "books");
        let mut fields = title_fields();
        fields.insert("author_id".into(), FieldDefinition::String);
        instance.set_fields(fields).unwrap();
        instance
            .post_mapped_documents(vec![
                doc(json!({"title": "dune", "author_id": "herbert"})),
                doc(json!({"title": "emma", "author_id": "austen"})),
            ])
            .unwrap();

        let query = instance
            .create_join_query(&JoinQuery {
                from_field: "author_id".into(),
                from_query: Some(Query::Text {
                    field: "title".into(),
                    text: "dune".into(),
                    all: false,
                }),
                to_field: "id".into(),
            })
            .unwrap();
        assert_eq!(
            query,
            Query::TermSet {
                field: "id".into(),
                values: vec![json!("herbert")],
            }
        );
    }
}

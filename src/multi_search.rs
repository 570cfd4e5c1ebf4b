//! Fan-out search over several open instances.

use crate::error::{GriddleError, Result};
use crate::index::analyzers::{AnalyzerContext, AnalyzerMap};
use crate::index::fields::FieldMap;
use crate::index::instance::{IndexInstance, InstanceDependent};
use crate::query::{Execution, QueryDefinition, ResultDefinition, SearchTarget};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

struct Shared {
    refs: usize,
    targets: Option<Vec<SearchTarget>>,
}

/// Reference-counted set of searchers.
///
/// Construction holds the first reference and [`MultiSearch::close`] gives it
/// back. Each search borrows another reference for its duration, so the
/// searchers are dropped exactly once, by whoever returns the last one.
pub struct MultiSearch {
    shared: Mutex<Shared>,
    closed: AtomicBool,
}

impl MultiSearch {
    pub fn new(targets: Vec<SearchTarget>) -> Self {
        MultiSearch {
            shared: Mutex::new(Shared {
                refs: 1,
                targets: Some(targets),
            }),
            closed: AtomicBool::new(false),
        }
    }

    fn borrow(&self) -> Result<Vec<SearchTarget>> {
        let mut shared = self.shared.lock();
        let targets = match (&shared.targets, shared.refs) {
            (Some(targets), refs) if refs > 0 => targets.clone(),
            _ => return Err(GriddleError::NotAcceptable("multi-search is closed".into())),
        };
        shared.refs += 1;
        Ok(targets)
    }

    fn give_back(&self) {
        let released = {
            let mut shared = self.shared.lock();
            shared.refs = shared.refs.saturating_sub(1);
            if shared.refs == 0 {
                shared.targets.take()
            } else {
                None
            }
        };
        if let Some(targets) = released {
            tracing::debug!("[MULTI] released {} searchers", targets.len());
        }
    }

    pub fn refs(&self) -> usize {
        self.shared.lock().refs
    }

    pub fn is_released(&self) -> bool {
        self.shared.lock().targets.is_none()
    }

    pub fn search<T>(&self, f: impl FnOnce(&[SearchTarget]) -> Result<T>) -> Result<T> {
        let targets = self.borrow()?;
        let result = f(&targets);
        drop(targets);
        self.give_back();
        result
    }

    pub fn num_docs(&self) -> Result<u64> {
        self.search(|targets| Ok(targets.iter().map(|t| t.searcher.num_docs()).sum()))
    }

    /// Gives back the construction reference. Later calls do nothing.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.give_back();
        }
    }
}

impl Drop for MultiSearch {
    fn drop(&mut self) {
        self.close();
    }
}

/// One fan-out query's view over a set of instances. Never reused.
pub struct MultiSearchContext {
    instances: Vec<Arc<IndexInstance>>,
    fields: FieldMap,
    analyzers: AnalyzerMap,
    context: AnalyzerContext,
    search: MultiSearch,
}

impl MultiSearchContext {
    pub fn new(instances: &[Arc<IndexInstance>]) -> Result<Self> {
        let mut fields = FieldMap::new();
        let mut analyzers = AnalyzerMap::new();
        let mut states = Vec::with_capacity(instances.len());
        let mut targets = Vec::with_capacity(instances.len());

        for instance in instances {
            let view = instance.read_view()?;
            for (name, definition) in &view.state.fields {
                fields
                    .entry(name.clone())
                    .or_insert_with(|| definition.clone());
            }
            for (name, definition) in &view.state.analyzers {
                analyzers
                    .entry(name.clone())
                    .or_insert_with(|| definition.clone());
            }
            let mut target = view.target;
            target.index = Some(instance.name().to_string());
            targets.push(target);
            states.push(view.state);
        }

        let context = AnalyzerContext::merged(states.iter().map(|state| &state.context));
        Ok(MultiSearchContext {
            instances: instances.to_vec(),
            fields,
            analyzers,
            context,
            search: MultiSearch::new(targets),
        })
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub fn analyzers(&self) -> &AnalyzerMap {
        &self.analyzers
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn num_docs(&self) -> Result<u64> {
        self.search.num_docs()
    }

    pub fn search(&self, definition: &QueryDefinition) -> Result<ResultDefinition> {
        let Some(first) = self.instances.first() else {
            return Ok(ResultDefinition::default());
        };
        let _permit = first.acquire_read()?;
        let execution = Execution::new(&self.fields, &self.context);
        self.search.search(|targets| execution.search(targets, definition))
    }

    pub fn close(&self) {
        self.search.close();
    }
}

/// Long-lived fan-out over a fixed set of instances.
///
/// Registers itself with every participant; the merged field map is cached
/// until a participant commits or edits its definitions.
pub struct MultiSearchInstance {
    instances: Vec<Arc<IndexInstance>>,
    fields: ArcSwapOption<FieldMap>,
    refreshes: AtomicUsize,
}

impl MultiSearchInstance {
    pub fn new(instances: Vec<Arc<IndexInstance>>) -> Arc<Self> {
        let multi = Arc::new(MultiSearchInstance {
            instances,
            fields: ArcSwapOption::empty(),
            refreshes: AtomicUsize::new(0),
        });
        let dependent: Arc<dyn InstanceDependent> = multi.clone();
        for instance in &multi.instances {
            instance.register(&dependent);
        }
        multi
    }

    pub fn instances(&self) -> &[Arc<IndexInstance>] {
        &self.instances
    }

    /// Merged field map, first instance wins per name.
    pub fn fields(&self) -> Arc<FieldMap> {
        if let Some(fields) = self.fields.load_full() {
            return fields;
        }
        let mut merged = FieldMap::new();
        for instance in &self.instances {
            for (name, definition) in instance.get_fields() {
                merged.entry(name).or_insert(definition);
            }
        }
        let merged = Arc::new(merged);
        self.fields.store(Some(Arc::clone(&merged)));
        merged
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn search(&self, definition: &QueryDefinition) -> Result<ResultDefinition> {
        let context = MultiSearchContext::new(&self.instances)?;
        let result = context.search(definition);
        context.close();
        result
    }

    pub fn num_docs(&self) -> Result<u64> {
        let context = MultiSearchContext::new(&self.instances)?;
        let count = context.num_docs();
        context.close();
        count
    }

    /// Stops receiving refresh notifications.
    pub fn close(self: &Arc<Self>) {
        let dependent: Arc<dyn InstanceDependent> = self.clone();
        for instance in &self.instances {
            instance.unregister(&dependent);
        }
    }
}

impl InstanceDependent for MultiSearchInstance {
    fn refresh(&self) -> Result<()> {
        self.fields.store(None);
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_context_has_no_results() {
        let context = MultiSearchContext::new(&[]).unwrap();
        assert!(context.is_empty());
        assert_eq!(context.num_docs().unwrap(), 0);
        let result = context.search(&QueryDefinition::default()).unwrap();
        assert_eq!(result.total_hits, 0);
        assert!(result.documents.is_empty());
    }

    #[test]
    fn searchers_released_once_after_last_borrow() {
        let multi = MultiSearch::new(Vec::new());
        let inside = multi
            .search(|_| {
                multi.close();
                Ok(multi.is_released())
            })
            .unwrap();
        assert!(!inside);
        assert!(multi.is_released());
        assert_eq!(multi.refs(), 0);

        multi.close();
        assert_eq!(multi.refs(), 0);
        let err = multi.search(|_| Ok(())).unwrap_err();
        assert!(matches!(err, GriddleError::NotAcceptable(_)));
    }
}

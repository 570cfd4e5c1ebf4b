use crate::error::Result;
use crate::index::schema::IndexSchema;
use arc_swap::ArcSwapOption;
use parking_lot::FairMutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tantivy::Searcher;

/// Facet dimensions present in one reader generation, with the number of
/// distinct facet paths seen under each.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FacetsState {
    pub dimensions: BTreeMap<String, u64>,
}

impl FacetsState {
    pub fn build(schema: &IndexSchema, searcher: &Searcher) -> Result<Self> {
        let mut dimensions = BTreeMap::new();
        for segment in searcher.segment_readers() {
            let inverted = segment.inverted_index(schema.facets)?;
            let mut stream = inverted.terms().stream()?;
            while stream.advance() {
                let encoded = stream.key();
                let end = encoded.iter().position(|b| *b == 0).unwrap_or(encoded.len());
                if end == 0 {
                    continue;
                }
                let dimension = String::from_utf8_lossy(&encoded[..end]).to_string();
                *dimensions.entry(dimension).or_insert(0) += 1;
            }
        }
        Ok(FacetsState { dimensions })
    }

    pub fn has_dimension(&self, dimension: &str) -> bool {
        self.dimensions.contains_key(dimension)
    }
}

struct Slot {
    generation: u64,
    state: Arc<FacetsState>,
}

/// Single-slot cache keyed by reader generation.
///
/// Lookups that hit the current generation never lock. On a miss, the fair
/// rebuild lock lets the first caller build while the others wait and then
/// find the slot already filled.
#[derive(Default)]
pub struct FacetsCache {
    slot: ArcSwapOption<Slot>,
    rebuild: FairMutex<()>,
    builds: AtomicUsize,
}

impl FacetsCache {
    pub fn get(&self, schema: &IndexSchema, searcher: &Searcher) -> Result<Arc<FacetsState>> {
        let generation = searcher.generation().generation_id();
        if let Some(slot) = self.slot.load().as_ref() {
            if slot.generation == generation {
                return Ok(Arc::clone(&slot.state));
            }
        }

        let _rebuild = self.rebuild.lock();
        if let Some(slot) = self.slot.load().as_ref() {
            if slot.generation == generation {
                return Ok(Arc::clone(&slot.state));
            }
        }
        let state = Arc::new(FacetsState::build(schema, searcher)?);
        self.builds.fetch_add(1, Ordering::Relaxed);
        self.slot.store(Some(Arc::new(Slot {
            generation,
            state: Arc::clone(&state),
        })));
        Ok(state)
    }

    pub fn invalidate(&self) {
        self.slot.store(None);
    }

    /// How many times the state was built.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }
}

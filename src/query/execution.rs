//! Running compiled queries against one or several searchers.
//!
//! A single-index search is a multi-target search with one target, so the
//! instance and the multi-search path share the same hit merging, paging
//! and facet counting.

use crate::error::{GriddleError, Result};
use crate::index::analyzers::AnalyzerContext;
use crate::index::document::stored_source;
use crate::index::facets::FacetsState;
use crate::index::fields::{FieldDefinition, FieldMap, ValueConverter};
use crate::index::schema::{decode_term_value, IndexSchema, FACETS_FIELD, ID_FIELD};
use crate::query::compile::field_presence;
use crate::query::{
    ExplainDefinition, FacetCount, Query, QueryCompiler, QueryDefinition, ResultDefinition,
    ResultDocument,
};
use crate::types::{FieldStats, MappedDocument, TermEnumDefinition};
use indexmap::IndexMap;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tantivy::collector::{Count, DocSetCollector, FacetCollector, TopDocs};
use tantivy::query::{Query as TantivyQuery, TermQuery};
use tantivy::schema::{Facet, IndexRecordOption};
use tantivy::{DocAddress, Searcher, SegmentReader, TantivyDocument};

/// One searchable index as seen by a single query.
#[derive(Clone)]
pub struct SearchTarget {
    pub index: Option<String>,
    pub searcher: Searcher,
    pub schema: IndexSchema,
    pub facets: Arc<FacetsState>,
}

/// Everything a search needs besides the targets.
pub struct Execution<'a> {
    pub fields: &'a FieldMap,
    pub analyzers: &'a AnalyzerContext,
}

struct Hit {
    target: usize,
    key: f64,
    score: f32,
    sort_value: Option<f64>,
    address: DocAddress,
}

fn compare_hits(a: &Hit, b: &Hit) -> Ordering {
    b.key
        .partial_cmp(&a.key)
        .unwrap_or(Ordering::Equal)
        .then(a.target.cmp(&b.target))
        .then(a.address.segment_ord.cmp(&b.address.segment_ord))
        .then(a.address.doc_id.cmp(&b.address.doc_id))
}

/// Top-k key of a sorted hit; documents without a value sort last.
fn sort_key(value: Option<f64>, descending: bool) -> f64 {
    match (value, descending) {
        (Some(v), true) => v,
        (Some(v), false) => -v,
        (None, _) => f64::NEG_INFINITY,
    }
}

fn select_fields(source: MappedDocument, returned: &[String]) -> MappedDocument {
    if returned.is_empty() {
        return source;
    }
    source
        .into_iter()
        .filter(|(name, _)| name == ID_FIELD || returned.iter().any(|r| r == name))
        .collect()
}

impl<'a> Execution<'a> {
    pub fn new(fields: &'a FieldMap, analyzers: &'a AnalyzerContext) -> Self {
        Execution { fields, analyzers }
    }

    pub fn compile(
        &self,
        schema: &IndexSchema,
        query: &Query,
    ) -> Result<Box<dyn TantivyQuery>> {
        QueryCompiler::new(schema, self.fields, self.analyzers).compile(query)
    }

    pub fn search(
        &self,
        targets: &[SearchTarget],
        definition: &QueryDefinition,
    ) -> Result<ResultDefinition> {
        let limit = definition.start.saturating_add(definition.rows);
        let sort = match &definition.sort {
            Some(sort) => {
                let field = self.fields.get(&sort.field).ok_or_else(|| {
                    GriddleError::InvalidQuery(format!("unknown sort field: {}", sort.field))
                })?;
                Some((field.clone(), field.get_sort_field(&sort.field, sort.descending)?))
            }
            None => None,
        };

        let mut dimensions: Vec<&String> = Vec::new();
        for dimension in &definition.facets {
            if !dimensions.contains(&dimension) {
                dimensions.push(dimension);
            }
        }

        let mut total_hits = 0u64;
        let mut hits: Vec<Hit> = Vec::new();
        let mut facet_counts: IndexMap<String, BTreeMap<String, u64>> = dimensions
            .iter()
            .map(|d| (d.to_string(), BTreeMap::new()))
            .collect();

        for (position, target) in targets.iter().enumerate() {
            let query = self.compile(&target.schema, &definition.query)?;
            // top-k never needs more slots than the target has documents
            let top_k = limit.min(target.searcher.num_docs() as usize).max(1);

            let known: Vec<&String> = dimensions
                .iter()
                .copied()
                .filter(|d| target.facets.has_dimension(d))
                .collect();
            let facet_collector = if known.is_empty() {
                None
            } else {
                let mut collector = FacetCollector::for_field(FACETS_FIELD);
                for dimension in &known {
                    collector.add_facet(Facet::from_path([dimension.as_str()]));
                }
                Some(collector)
            };

            let counts = match &sort {
                None => {
                    let (count, top, counts) = target.searcher.search(
                        query.as_ref(),
                        &(Count, TopDocs::with_limit(top_k), facet_collector),
                    )?;
                    hits.extend(top.into_iter().map(|(score, address)| Hit {
                        target: position,
                        key: score as f64,
                        score,
                        sort_value: None,
                        address,
                    }));
                    total_hits += count as u64;
                    counts
                }
                Some((field, key)) => {
                    let field = field.clone();
                    let name = key.field.clone();
                    let descending = key.descending;
                    let scorer = move |segment: &SegmentReader| {
                        let converter = field.get_converter(&name, segment).ok().flatten();
                        move |doc| {
                            let value = converter.as_ref().and_then(|c| c.sort_value(doc));
                            (sort_key(value, descending), value)
                        }
                    };
                    let top = TopDocs::with_limit(top_k).custom_score(scorer);
                    let (count, top, counts) = target
                        .searcher
                        .search(query.as_ref(), &(Count, top, facet_collector))?;
                    hits.extend(top.into_iter().map(|((key, value), address)| Hit {
                        target: position,
                        key,
                        score: 0.0,
                        sort_value: value,
                        address,
                    }));
                    total_hits += count as u64;
                    counts
                }
            };

            if let Some(counts) = counts {
                for dimension in &known {
                    let slot = facet_counts.entry(dimension.to_string()).or_default();
                    for (facet, count) in counts.get(Facet::from_path([dimension.as_str()])) {
                        let value = facet.to_path().last().map(|s| s.to_string()).unwrap_or_default();
                        *slot.entry(value).or_insert(0) += count;
                    }
                }
            }
        }

        hits.sort_by(compare_hits);
        let mut documents = Vec::with_capacity(definition.rows.min(hits.len()));
        for hit in hits.into_iter().skip(definition.start).take(definition.rows) {
            let target = &targets[hit.target];
            let doc: TantivyDocument = target.searcher.doc(hit.address)?;
            let source = stored_source(&target.schema, &doc)?;
            let id = match source.get(ID_FIELD) {
                Some(Value::String(id)) => id.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            documents.push(ResultDocument {
                index: target.index.clone(),
                id,
                score: hit.score,
                sort_value: hit.sort_value,
                fields: select_fields(source, &definition.returned_fields),
            });
        }

        let facets = facet_counts
            .into_iter()
            .map(|(dimension, counts)| {
                let mut counts: Vec<FacetCount> = counts
                    .into_iter()
                    .map(|(value, count)| FacetCount { value, count })
                    .collect();
                counts.sort_by(|a, b| b.count.cmp(&a.count).then(a.value.cmp(&b.value)));
                counts.truncate(definition.facet_limit);
                (dimension, counts)
            })
            .collect();

        Ok(ResultDefinition {
            total_hits,
            documents,
            facets,
        })
    }

    /// Scores the document `id` against `query`.
    pub fn explain(
        &self,
        target: &SearchTarget,
        query: &Query,
        id: &str,
    ) -> Result<ExplainDefinition> {
        let address = find_by_id(target, id)?
            .ok_or_else(|| GriddleError::NotFound(format!("document: {}", id)))?;
        let compiled = self.compile(&target.schema, query)?;
        Ok(match compiled.explain(&target.searcher, address) {
            Ok(explanation) => ExplainDefinition {
                id: id.to_string(),
                score: explanation.value(),
                matched: true,
                description: explanation.to_pretty_json(),
            },
            Err(e) => ExplainDefinition {
                id: id.to_string(),
                score: 0.0,
                matched: false,
                description: e.to_string(),
            },
        })
    }

    /// Collects the doc values of `from_field` over the matches of `query`.
    pub fn join_values(
        &self,
        target: &SearchTarget,
        query: &Query,
        from_field: &str,
    ) -> Result<Vec<Value>> {
        let definition = self.fields.get(from_field).ok_or_else(|| {
            GriddleError::InvalidQuery(format!("unknown field: {}", from_field))
        })?;
        if !matches!(
            definition,
            FieldDefinition::String | FieldDefinition::Long | FieldDefinition::Double
        ) {
            return Err(GriddleError::InvalidQuery(format!(
                "field {} ({}) cannot be joined on",
                from_field,
                definition.kind_name()
            )));
        }
        let compiled = self.compile(&target.schema, query)?;
        let matches = target.searcher.search(compiled.as_ref(), &DocSetCollector)?;

        let mut addresses: Vec<DocAddress> = matches.into_iter().collect();
        addresses.sort_by_key(|a| (a.segment_ord, a.doc_id));

        let mut converters: HashMap<u32, Option<ValueConverter>> = HashMap::new();
        let mut seen = HashSet::new();
        let mut values = Vec::new();
        for address in addresses {
            if !converters.contains_key(&address.segment_ord) {
                let segment = target.searcher.segment_reader(address.segment_ord);
                converters.insert(
                    address.segment_ord,
                    definition.get_converter(from_field, segment)?,
                );
            }
            let Some(Some(converter)) = converters.get(&address.segment_ord) else {
                continue;
            };
            for value in converter.values(address.doc_id) {
                if seen.insert(value.to_string()) {
                    values.push(value);
                }
            }
        }
        Ok(values)
    }
}

pub(crate) fn find_by_id(target: &SearchTarget, id: &str) -> Result<Option<DocAddress>> {
    let query = TermQuery::new(target.schema.id_term(id), IndexRecordOption::Basic);
    let top = target.searcher.search(&query, &TopDocs::with_limit(1))?;
    Ok(top.into_iter().next().map(|(_, address)| address))
}

fn term_type_of(field: &str, definition: &FieldDefinition) -> Result<tantivy::schema::Type> {
    definition.term_type().ok_or_else(|| {
        GriddleError::InvalidQuery(format!(
            "field {} ({}) has no terms",
            field,
            definition.kind_name()
        ))
    })
}

/// Indexed terms of `field` starting with `prefix`, in term order.
pub fn terms_enum(
    searcher: &Searcher,
    schema: &IndexSchema,
    field: &str,
    definition: &FieldDefinition,
    prefix: Option<&str>,
    start: usize,
    rows: usize,
) -> Result<Vec<TermEnumDefinition>> {
    let typ = term_type_of(field, definition)?;
    let key_prefix = schema.term_key_prefix(field, typ);
    let mut lookup = key_prefix.clone();
    if let (Some(prefix), tantivy::schema::Type::Str) = (prefix, typ) {
        lookup.extend_from_slice(prefix.as_bytes());
    }

    let mut merged: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
    for segment in searcher.segment_readers() {
        let inverted = segment.inverted_index(schema.terms)?;
        let mut stream = inverted.terms().range().ge(&lookup).into_stream()?;
        while stream.advance() {
            let key = stream.key();
            if !key.starts_with(&lookup) {
                break;
            }
            *merged.entry(key[key_prefix.len()..].to_vec()).or_insert(0) +=
                stream.value().doc_freq as u64;
        }
    }

    Ok(merged
        .into_iter()
        .skip(start)
        .take(rows)
        .filter_map(|(bytes, doc_freq)| {
            decode_term_value(typ, &bytes).map(|value| TermEnumDefinition {
                term: value.to_json(),
                doc_freq,
            })
        })
        .collect())
}

pub fn field_stats(
    searcher: &Searcher,
    schema: &IndexSchema,
    field: &str,
    definition: &FieldDefinition,
) -> Result<FieldStats> {
    let typ = term_type_of(field, definition)?;
    let key_prefix = schema.term_key_prefix(field, typ);
    let mut stats = FieldStats::default();
    for segment in searcher.segment_readers() {
        let inverted = segment.inverted_index(schema.terms)?;
        let mut stream = inverted.terms().range().ge(&key_prefix).into_stream()?;
        while stream.advance() {
            if !stream.key().starts_with(&key_prefix) {
                break;
            }
            stats.number_of_terms += 1;
            stats.sum_doc_freq += stream.value().doc_freq as u64;
        }
    }
    stats.doc_count = searcher.search(&field_presence(schema, field, typ), &Count)? as u64;
    Ok(stats)
}

pub mod compile;
pub mod execution;

pub use compile::QueryCompiler;
pub use execution::{Execution, SearchTarget};

use crate::types::MappedDocument;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured query, serde-tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Query {
    #[default]
    MatchAll,
    /// Exact value. Text fields go through the query analyzer.
    Term { field: String, value: Value },
    /// Analyzed text; any token matches unless `all` is set.
    Text {
        field: String,
        text: String,
        #[serde(default)]
        all: bool,
    },
    /// Inclusive range on a string, long or double field.
    Range {
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<Value>,
    },
    /// Documents under a facet path, e.g. `sf/classic` of field `genre`.
    Facet { field: String, path: String },
    Bool {
        #[serde(default)]
        must: Vec<Query>,
        #[serde(default)]
        should: Vec<Query>,
        #[serde(default)]
        must_not: Vec<Query>,
    },
    TermSet { field: String, values: Vec<Value> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortDefinition {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

fn default_rows() -> usize {
    10
}

fn default_facet_limit() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDefinition {
    #[serde(default)]
    pub query: Query,
    #[serde(default)]
    pub start: usize,
    #[serde(default = "default_rows")]
    pub rows: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortDefinition>,
    /// Fields copied from the stored document into each hit; empty means all.
    #[serde(default)]
    pub returned_fields: Vec<String>,
    /// Facet dimensions to count over the whole match set.
    #[serde(default)]
    pub facets: Vec<String>,
    #[serde(default = "default_facet_limit")]
    pub facet_limit: usize,
}

impl Default for QueryDefinition {
    fn default() -> Self {
        QueryDefinition {
            query: Query::MatchAll,
            start: 0,
            rows: default_rows(),
            sort: None,
            returned_fields: Vec::new(),
            facets: Vec::new(),
            facet_limit: default_facet_limit(),
        }
    }
}

impl QueryDefinition {
    pub fn new(query: Query) -> Self {
        QueryDefinition {
            query,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    pub id: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_value: Option<f64>,
    pub fields: MappedDocument,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetCount {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultDefinition {
    pub total_hits: u64,
    pub documents: Vec<ResultDocument>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub facets: IndexMap<String, Vec<FacetCount>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainDefinition {
    pub id: String,
    pub score: f32,
    pub matched: bool,
    pub description: String,
}

/// Collects `from_field` values of the documents matching `from_query` on
/// one index, to be matched against `to_field` on another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinQuery {
    pub from_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_query: Option<Query>,
    pub to_field: String,
}

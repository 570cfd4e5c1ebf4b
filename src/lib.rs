//! Replicated multi-index document store on tantivy.
//!
//! Each index directory is owned by an [`IndexInstanceManager`], which opens
//! at most one [`IndexInstance`] at a time. Instances are masters (writable,
//! publishing every commit) or replicas (pulling resources, definitions and
//! segment files from their master). [`MultiSearchContext`] fans one query
//! out over several open instances.

pub mod error;
pub mod index;
pub mod multi_search;
pub mod query;
pub mod replication;
pub mod types;

pub use error::{GriddleError, Result};
pub use index::analyzers::{AnalyzerDefinition, AnalyzerMap, FilterDefinition, TokenizerKind};
pub use index::fields::{FieldDefinition, FieldMap};
pub use index::resources::ResourceInfo;
pub use index::{
    AdmissionConfig, AdmissionGate, BackupStatus, IndexInstance, IndexInstanceManager,
    IndexSettings, InstanceContext, InstanceDependent, RemoteMaster, SchemaGate,
};
pub use multi_search::{MultiSearch, MultiSearchContext, MultiSearchInstance};
pub use query::{
    ExplainDefinition, FacetCount, JoinQuery, Query, QueryDefinition, ResultDefinition,
    ResultDocument, SortDefinition,
};
pub use replication::{LocalConnector, ReplicationConnector, ReplicationSource};
pub use types::{
    CheckStatus, FieldStats, IndexStatus, MappedDocument, Role, TermDefinition,
    TermEnumDefinition,
};

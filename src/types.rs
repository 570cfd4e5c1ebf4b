use crate::index::settings::IndexSettings;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A document as a flat JSON object: field name -> value.
///
/// The reserved key `_id` identifies the document; posting a document with
/// an `_id` that already exists replaces it.
pub type MappedDocument = serde_json::Map<String, serde_json::Value>;

/// Index identifier: the last component of the index directory.
pub type IndexName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Replica,
}

/// Token produced by an analyzer, as reported by `test_analyzer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermDefinition {
    pub term: String,
    pub position: usize,
    pub start_offset: usize,
    pub end_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermEnumDefinition {
    pub term: serde_json::Value,
    pub doc_freq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    /// Distinct indexed terms, summed over segments.
    pub number_of_terms: u64,
    pub sum_doc_freq: u64,
    pub doc_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStatus {
    pub uuid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_uuid: Option<Uuid>,
    pub role: Role,
    pub num_docs: u64,
    pub num_deleted_docs: u64,
    pub segments: usize,
    pub generation: u64,
    pub size_bytes: u64,
    pub fields: Vec<String>,
    pub analyzers: Vec<String>,
    pub settings: IndexSettings,
}

/// Outcome of a full integrity scan of a closed index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckStatus {
    pub clean: bool,
    pub segments: usize,
    pub num_docs: u64,
    pub generation: u64,
    pub corrupted_files: Vec<String>,
}

/// Splits the reserved `_id` key off a mapped document.
pub fn document_id(document: &MappedDocument) -> crate::error::Result<Option<String>> {
    match document.get(crate::index::schema::ID_FIELD) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(Some(id.clone())),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(crate::error::GriddleError::InvalidDocument(format!(
            "_id must be a non-empty string or number, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> MappedDocument {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn id_accepts_strings_and_numbers() {
        assert_eq!(document_id(&doc(json!({"_id": "a1"}))).unwrap(), Some("a1".into()));
        assert_eq!(document_id(&doc(json!({"_id": 42}))).unwrap(), Some("42".into()));
        assert_eq!(document_id(&doc(json!({"title": "x"}))).unwrap(), None);
    }

    #[test]
    fn id_rejects_objects_and_empty_strings() {
        assert!(document_id(&doc(json!({"_id": {"a": 1}}))).is_err());
        assert!(document_id(&doc(json!({"_id": ""}))).is_err());
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Replica).unwrap(), "\"replica\"");
    }
}

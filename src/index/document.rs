use crate::error::{GriddleError, Result};
use crate::index::analyzers::AnalyzerContext;
use crate::index::fields::{DocumentFields, FieldMap};
use crate::index::schema::{IndexSchema, ID_FIELD};
use crate::types::{document_id, MappedDocument};
use serde_json::Value;
use std::collections::BTreeMap;
use tantivy::schema::{OwnedValue, Value as _};
use tantivy::TantivyDocument;

/// A document ready for the writer, with the id used for upserts.
pub struct ConvertedDocument {
    pub id: String,
    pub doc: TantivyDocument,
}

/// Turns mapped documents into tantivy documents through the field map.
pub struct DocumentConverter<'a> {
    schema: &'a IndexSchema,
    fields: &'a FieldMap,
    analyzers: &'a AnalyzerContext,
}

impl<'a> DocumentConverter<'a> {
    pub fn new(schema: &'a IndexSchema, fields: &'a FieldMap, analyzers: &'a AnalyzerContext) -> Self {
        DocumentConverter {
            schema,
            fields,
            analyzers,
        }
    }

    pub fn to_tantivy(&self, document: &MappedDocument) -> Result<ConvertedDocument> {
        let id = document_id(document)?.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut filled = DocumentFields::default();
        for (name, value) in document {
            if name == ID_FIELD {
                continue;
            }
            let definition = self.fields.get(name).ok_or_else(|| {
                GriddleError::InvalidDocument(format!("unknown field: {}", name))
            })?;
            definition.fill(name, value, self.analyzers, &mut filled)?;
        }

        let mut source = document.clone();
        source.insert(ID_FIELD.to_string(), Value::String(id.clone()));

        let mut doc = TantivyDocument::new();
        doc.add_text(self.schema.id, &id);
        doc.add_text(self.schema.source, serde_json::to_string(&source)?);
        doc.add_object(self.schema.terms, collapse(filled.terms));
        doc.add_object(self.schema.values, collapse(filled.values));
        for facet in filled.facets {
            doc.add_facet(self.schema.facets, facet);
        }
        Ok(ConvertedDocument { id, doc })
    }
}

/// Single values stay scalar so single-valued columns stay dense.
fn collapse(map: BTreeMap<String, Vec<OwnedValue>>) -> BTreeMap<String, OwnedValue> {
    map.into_iter()
        .map(|(name, mut values)| {
            let value = if values.len() == 1 {
                values.remove(0)
            } else {
                OwnedValue::Array(values)
            };
            (name, value)
        })
        .collect()
}

/// Reads back the mapped document stored in `_source`.
pub fn stored_source(schema: &IndexSchema, doc: &TantivyDocument) -> Result<MappedDocument> {
    let raw = doc
        .get_first(schema.source)
        .and_then(|v| v.as_str())
        .ok_or_else(|| GriddleError::Tantivy("document without _source".to_string()))?;
    match serde_json::from_str(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(GriddleError::Tantivy(format!(
            "_source is not an object: {}",
            other
        ))),
    }
}

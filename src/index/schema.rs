use crate::error::{GriddleError, Result};
use tantivy::schema::{
    FacetOptions, Field, IndexRecordOption, JsonObjectOptions, Schema as TantivySchema,
    TextFieldIndexing, Type, FAST, STORED, STRING,
};
use tantivy::Term;

pub const ID_FIELD: &str = "_id";
pub const SOURCE_FIELD: &str = "_source";
pub const TERMS_FIELD: &str = "_terms";
pub const VALUES_FIELD: &str = "_values";
pub const FACETS_FIELD: &str = "_facets";

/// A single indexed value, typed the way tantivy encodes it in a JSON term.
#[derive(Debug, Clone, PartialEq)]
pub enum TermValue {
    Str(String),
    I64(i64),
    F64(f64),
}

impl TermValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TermValue::Str(s) => serde_json::Value::String(s.clone()),
            TermValue::I64(v) => serde_json::Value::from(*v),
            TermValue::F64(v) => serde_json::Value::from(*v),
        }
    }
}

/// The fixed tantivy schema shared by every index.
///
/// User fields never become tantivy fields. They live as JSON paths:
/// analyzed tokens and exact values under `_terms`, doc values under
/// `_values`, hierarchical facets under `_facets`. Schema edits therefore
/// never require reopening the tantivy index.
#[derive(Clone)]
pub struct IndexSchema {
    pub schema: TantivySchema,
    pub id: Field,
    pub source: Field,
    pub terms: Field,
    pub values: Field,
    pub facets: Field,
}

impl IndexSchema {
    pub fn build() -> Self {
        let mut builder = TantivySchema::builder();

        let id = builder.add_text_field(ID_FIELD, STRING | STORED | FAST);
        let source = builder.add_text_field(SOURCE_FIELD, STORED);

        let terms_indexing = TextFieldIndexing::default()
            .set_tokenizer("raw")
            .set_index_option(IndexRecordOption::WithFreqs);
        let terms_opts = JsonObjectOptions::default().set_indexing_options(terms_indexing);
        let terms = builder.add_json_field(TERMS_FIELD, terms_opts);

        let values_opts = JsonObjectOptions::default().set_fast(None);
        let values = builder.add_json_field(VALUES_FIELD, values_opts);

        let facets = builder.add_facet_field(FACETS_FIELD, FacetOptions::default());

        IndexSchema {
            schema: builder.build(),
            id,
            source,
            terms,
            values,
            facets,
        }
    }

    pub fn from_tantivy(schema: TantivySchema) -> Result<Self> {
        let get = |name: &str| {
            schema
                .get_field(name)
                .map_err(|_| GriddleError::Tantivy(format!("schema misses field {}", name)))
        };
        Ok(IndexSchema {
            id: get(ID_FIELD)?,
            source: get(SOURCE_FIELD)?,
            terms: get(TERMS_FIELD)?,
            values: get(VALUES_FIELD)?,
            facets: get(FACETS_FIELD)?,
            schema,
        })
    }

    pub fn id_term(&self, id: &str) -> Term {
        Term::from_field_text(self.id, id)
    }

    pub fn term(&self, field_name: &str, value: &TermValue) -> Term {
        let mut term = Term::from_field_json_path(self.terms, field_name, false);
        match value {
            TermValue::Str(s) => term.append_type_and_str(s),
            TermValue::I64(v) => term.append_type_and_fast_value(*v),
            TermValue::F64(v) => term.append_type_and_fast_value(*v),
        }
        term
    }

    /// Term dictionary key prefix of every value of one field and one type.
    pub fn term_key_prefix(&self, field_name: &str, typ: Type) -> Vec<u8> {
        let term = Term::from_field_json_path(self.terms, field_name, false);
        let mut prefix = term.serialized_value_bytes().to_vec();
        prefix.push(typ.to_code());
        prefix
    }

    pub fn values_column(field_name: &str) -> String {
        format!("{}.{}", VALUES_FIELD, field_name)
    }
}

/// Decodes the value part of a `_terms` dictionary key given its type.
pub fn decode_term_value(typ: Type, bytes: &[u8]) -> Option<TermValue> {
    match typ {
        Type::Str => std::str::from_utf8(bytes)
            .ok()
            .map(|s| TermValue::Str(s.to_string())),
        Type::I64 => {
            let raw: [u8; 8] = bytes.try_into().ok()?;
            Some(TermValue::I64(tantivy::u64_to_i64(u64::from_be_bytes(raw))))
        }
        Type::F64 => {
            let raw: [u8; 8] = bytes.try_into().ok()?;
            Some(TermValue::F64(tantivy::u64_to_f64(u64::from_be_bytes(raw))))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_is_deterministic() {
        let a = IndexSchema::build();
        let b = IndexSchema::build();
        assert_eq!(a.terms, b.terms);
        assert_eq!(a.values, b.values);
        assert_eq!(a.schema.fields().count(), 5);
    }

    #[test]
    fn term_key_prefix_matches_term_bytes() {
        let schema = IndexSchema::build();
        let term = schema.term("title", &TermValue::Str("hello".into()));
        let prefix = schema.term_key_prefix("title", Type::Str);
        let bytes = term.serialized_value_bytes();
        assert!(bytes.starts_with(&prefix));
        assert_eq!(&bytes[prefix.len()..], b"hello");
    }

    #[test]
    fn numeric_terms_decode_back() {
        let schema = IndexSchema::build();
        for value in [TermValue::I64(-42), TermValue::F64(2.5)] {
            let typ = match value {
                TermValue::I64(_) => Type::I64,
                _ => Type::F64,
            };
            let term = schema.term("price", &value);
            let prefix = schema.term_key_prefix("price", typ);
            let decoded = decode_term_value(typ, &term.serialized_value_bytes()[prefix.len()..]);
            assert_eq!(decoded, Some(value));
        }
    }

    #[test]
    fn from_tantivy_rejects_foreign_schema() {
        let mut builder = TantivySchema::builder();
        builder.add_text_field("body", STORED);
        assert!(IndexSchema::from_tantivy(builder.build()).is_err());
    }
}

//! Field definitions and the field-type capability.
//!
//! A field is one of a closed set of kinds. Each kind knows how to turn a
//! JSON value into engine values (`fill_value`, `fill_array`, `fill_map`),
//! how to build a sort key, and how to read doc values back from a segment.

use crate::error::{GriddleError, Result};
use crate::index::analyzers::AnalyzerContext;
use crate::index::schema::{IndexSchema, TermValue};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tantivy::columnar::{Column, DynamicColumn, NumericalType, StrColumn};
use tantivy::schema::{Facet, OwnedValue, Type};
use tantivy::{DocId, SegmentReader};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldDefinition {
    /// Analyzed full text.
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        analyzer: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query_analyzer: Option<String>,
    },
    /// Exact keyword, indexed and kept as a doc value.
    String,
    Long,
    Double,
    /// Hierarchical facet; values are `a/b/c` paths.
    Facet,
    /// `{lat, lon}` or a flat `[lat, lon, ...]` array.
    GeoPoint,
}

pub type FieldMap = IndexMap<String, FieldDefinition>;

/// Engine-side representation of one document, filled field by field.
#[derive(Debug, Default)]
pub struct DocumentFields {
    pub terms: BTreeMap<String, Vec<OwnedValue>>,
    pub values: BTreeMap<String, Vec<OwnedValue>>,
    pub facets: Vec<Facet>,
}

impl DocumentFields {
    fn push_term(&mut self, name: &str, value: OwnedValue) {
        self.terms.entry(name.to_string()).or_default().push(value);
    }

    fn push_value(&mut self, name: &str, value: OwnedValue) {
        self.values.entry(name.to_string()).or_default().push(value);
    }
}

/// Numeric sort key resolved for one field.
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

pub fn check_field_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('.') || name.starts_with('_') || name.contains('\0') {
        return Err(GriddleError::InvalidName(format!("field: {}", name)));
    }
    Ok(())
}

fn invalid(name: &str, kind: &str, value: &Value) -> GriddleError {
    GriddleError::InvalidDocument(format!("field {} ({}) cannot hold {}", name, kind, value))
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl FieldDefinition {
    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldDefinition::Text { .. } => "text",
            FieldDefinition::String => "string",
            FieldDefinition::Long => "long",
            FieldDefinition::Double => "double",
            FieldDefinition::Facet => "facet",
            FieldDefinition::GeoPoint => "geo_point",
        }
    }

    /// Dispatches on the JSON shape of `value`. Nulls are skipped.
    pub fn fill(
        &self,
        name: &str,
        value: &Value,
        analyzers: &AnalyzerContext,
        out: &mut DocumentFields,
    ) -> Result<()> {
        match value {
            Value::Null => Ok(()),
            Value::Array(values) => self.fill_array(name, values, analyzers, out),
            Value::Object(map) => self.fill_map(name, map, analyzers, out),
            scalar => self.fill_value(name, scalar, analyzers, out),
        }
    }

    pub fn fill_value(
        &self,
        name: &str,
        value: &Value,
        analyzers: &AnalyzerContext,
        out: &mut DocumentFields,
    ) -> Result<()> {
        match self {
            FieldDefinition::Text { .. } => {
                let text = as_text(value).ok_or_else(|| invalid(name, "text", value))?;
                for token in analyzers.index_tokens(name, &text) {
                    out.push_term(name, OwnedValue::Str(token));
                }
            }
            FieldDefinition::String => {
                let text = as_text(value).ok_or_else(|| invalid(name, "string", value))?;
                out.push_term(name, OwnedValue::Str(text.clone()));
                out.push_value(name, OwnedValue::Str(text));
            }
            FieldDefinition::Long => {
                let v = as_i64(value).ok_or_else(|| invalid(name, "long", value))?;
                out.push_term(name, OwnedValue::I64(v));
                out.push_value(name, OwnedValue::I64(v));
            }
            FieldDefinition::Double => {
                let v = as_f64(value).ok_or_else(|| invalid(name, "double", value))?;
                out.push_term(name, OwnedValue::F64(v));
                out.push_value(name, OwnedValue::F64(v));
            }
            FieldDefinition::Facet => {
                let path = value.as_str().ok_or_else(|| invalid(name, "facet", value))?;
                out.facets.push(facet_for(name, path));
            }
            FieldDefinition::GeoPoint => return Err(invalid(name, "geo_point", value)),
        }
        Ok(())
    }

    pub fn fill_array(
        &self,
        name: &str,
        values: &[Value],
        analyzers: &AnalyzerContext,
        out: &mut DocumentFields,
    ) -> Result<()> {
        if let FieldDefinition::GeoPoint = self {
            if values.iter().all(Value::is_number) {
                if values.len() % 2 != 0 {
                    return Err(GriddleError::InvalidDocument(format!(
                        "field {} (geo_point) expects lat/lon pairs, got {} numbers",
                        name,
                        values.len()
                    )));
                }
                for pair in values.chunks(2) {
                    push_geo_point(name, &pair[0], &pair[1], out)?;
                }
                return Ok(());
            }
        }
        for value in values {
            match value {
                Value::Null => {}
                Value::Array(_) => {
                    return Err(GriddleError::InvalidDocument(format!(
                        "field {} does not accept nested arrays",
                        name
                    )))
                }
                Value::Object(map) => self.fill_map(name, map, analyzers, out)?,
                scalar => self.fill_value(name, scalar, analyzers, out)?,
            }
        }
        Ok(())
    }

    pub fn fill_map(
        &self,
        name: &str,
        map: &serde_json::Map<String, Value>,
        _analyzers: &AnalyzerContext,
        out: &mut DocumentFields,
    ) -> Result<()> {
        match self {
            FieldDefinition::GeoPoint => {
                let lat = map.get("lat").unwrap_or(&Value::Null);
                let lon = map.get("lon").unwrap_or(&Value::Null);
                push_geo_point(name, lat, lon, out)
            }
            other => Err(invalid(
                name,
                other.kind_name(),
                &Value::Object(map.clone()),
            )),
        }
    }

    /// Terms a query value matches for this kind. Text values go through
    /// the query analyzer and may produce several terms.
    pub fn term_values(
        &self,
        name: &str,
        value: &Value,
        analyzers: &AnalyzerContext,
    ) -> Result<Vec<TermValue>> {
        let bad = || GriddleError::InvalidQuery(format!("field {} cannot match {}", name, value));
        match self {
            FieldDefinition::Text { .. } => {
                let text = as_text(value).ok_or_else(bad)?;
                Ok(analyzers
                    .query_tokens(name, &text)
                    .into_iter()
                    .map(TermValue::Str)
                    .collect())
            }
            FieldDefinition::String => Ok(vec![TermValue::Str(as_text(value).ok_or_else(bad)?)]),
            FieldDefinition::Long => Ok(vec![TermValue::I64(as_i64(value).ok_or_else(bad)?)]),
            FieldDefinition::Double => Ok(vec![TermValue::F64(as_f64(value).ok_or_else(bad)?)]),
            FieldDefinition::Facet | FieldDefinition::GeoPoint => Err(GriddleError::InvalidQuery(
                format!("field {} ({}) has no terms", name, self.kind_name()),
            )),
        }
    }

    /// Type tag of the values this kind writes under `_terms`.
    pub fn term_type(&self) -> Option<Type> {
        match self {
            FieldDefinition::Text { .. } | FieldDefinition::String => Some(Type::Str),
            FieldDefinition::Long => Some(Type::I64),
            FieldDefinition::Double => Some(Type::F64),
            FieldDefinition::Facet | FieldDefinition::GeoPoint => None,
        }
    }

    pub fn get_sort_field(&self, name: &str, descending: bool) -> Result<SortKey> {
        match self {
            FieldDefinition::Long | FieldDefinition::Double => Ok(SortKey {
                field: name.to_string(),
                descending,
            }),
            other => Err(GriddleError::InvalidQuery(format!(
                "field {} ({}) is not sortable",
                name,
                other.kind_name()
            ))),
        }
    }

    /// Doc-value accessor for one segment. `None` when the segment holds no
    /// value for this field or the kind keeps no doc values.
    pub fn get_converter(
        &self,
        name: &str,
        segment: &SegmentReader,
    ) -> Result<Option<ValueConverter>> {
        let column = IndexSchema::values_column(name);
        Ok(match self {
            FieldDefinition::Long => numeric_column(segment, &column, NumericalType::I64)?
                .and_then(|c| Option::<Column<i64>>::from(c))
                .map(ValueConverter::Long),
            FieldDefinition::Double => numeric_column(segment, &column, NumericalType::F64)?
                .and_then(|c| Option::<Column<f64>>::from(c))
                .map(ValueConverter::Double),
            FieldDefinition::String => segment.fast_fields().str(&column)?.map(ValueConverter::Str),
            FieldDefinition::GeoPoint => {
                let lat = numeric_column(segment, &format!("{}.lat", column), NumericalType::F64)?
                    .and_then(|c| Option::<Column<f64>>::from(c));
                let lon = numeric_column(segment, &format!("{}.lon", column), NumericalType::F64)?
                    .and_then(|c| Option::<Column<f64>>::from(c));
                match (lat, lon) {
                    (Some(lat), Some(lon)) => Some(ValueConverter::GeoPoint { lat, lon }),
                    _ => None,
                }
            }
            FieldDefinition::Text { .. } | FieldDefinition::Facet => None,
        })
    }
}

pub fn facet_for(dimension: &str, path: &str) -> Facet {
    let mut parts = vec![dimension];
    parts.extend(path.split('/').filter(|p| !p.is_empty()));
    Facet::from_path(parts)
}

fn push_geo_point(name: &str, lat: &Value, lon: &Value, out: &mut DocumentFields) -> Result<()> {
    let (Some(lat), Some(lon)) = (as_f64(lat), as_f64(lon)) else {
        return Err(GriddleError::InvalidDocument(format!(
            "field {} (geo_point) needs numeric lat and lon",
            name
        )));
    };
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(GriddleError::InvalidDocument(format!(
            "field {} (geo_point) out of range: {}, {}",
            name, lat, lon
        )));
    }
    out.push_value(
        name,
        OwnedValue::Object(vec![
            ("lat".to_string(), OwnedValue::F64(lat)),
            ("lon".to_string(), OwnedValue::F64(lon)),
        ]),
    );
    Ok(())
}

fn numeric_column(
    segment: &SegmentReader,
    column: &str,
    target: NumericalType,
) -> Result<Option<DynamicColumn>> {
    for handle in segment.fast_fields().dynamic_column_handles(column)? {
        if handle.column_type().numerical_type().is_none() {
            continue;
        }
        if let Some(coerced) = handle.open()?.coerce_numerical(target) {
            return Ok(Some(coerced));
        }
    }
    Ok(None)
}

/// Reads the doc values of one field in one segment.
pub enum ValueConverter {
    Long(Column<i64>),
    Double(Column<f64>),
    Str(StrColumn),
    GeoPoint { lat: Column<f64>, lon: Column<f64> },
}

impl ValueConverter {
    pub fn values(&self, doc: DocId) -> Vec<Value> {
        match self {
            ValueConverter::Long(column) => column.values_for_doc(doc).map(Value::from).collect(),
            ValueConverter::Double(column) => {
                column.values_for_doc(doc).map(Value::from).collect()
            }
            ValueConverter::Str(column) => {
                let mut out = Vec::new();
                let mut buffer = String::new();
                for ord in column.term_ords(doc) {
                    buffer.clear();
                    if let Ok(true) = column.ord_to_str(ord, &mut buffer) {
                        out.push(Value::String(buffer.clone()));
                    }
                }
                out
            }
            ValueConverter::GeoPoint { lat, lon } => lat
                .values_for_doc(doc)
                .zip(lon.values_for_doc(doc))
                .map(|(lat, lon)| serde_json::json!({"lat": lat, "lon": lon}))
                .collect(),
        }
    }

    /// First numeric value of the document, used as a sort key.
    pub fn sort_value(&self, doc: DocId) -> Option<f64> {
        match self {
            ValueConverter::Long(column) => column.first(doc).map(|v| v as f64),
            ValueConverter::Double(column) => column.first(doc),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fill(def: &FieldDefinition, value: Value) -> Result<DocumentFields> {
        let mut out = DocumentFields::default();
        def.fill("f", &value, &AnalyzerContext::default(), &mut out)?;
        Ok(out)
    }

    #[test]
    fn field_names_reject_dots_and_reserved_prefix() {
        assert!(check_field_name("title").is_ok());
        assert!(check_field_name("a.b").is_err());
        assert!(check_field_name("_id").is_err());
        assert!(check_field_name("").is_err());
    }

    #[test]
    fn long_accepts_integral_numbers_and_strings() {
        let out = fill(&FieldDefinition::Long, json!([3, 4.0, "5"])).unwrap();
        assert_eq!(
            out.values["f"],
            vec![OwnedValue::I64(3), OwnedValue::I64(4), OwnedValue::I64(5)]
        );
        assert!(fill(&FieldDefinition::Long, json!(1.5)).is_err());
    }

    #[test]
    fn text_is_tokenized_with_default_analyzer() {
        let def = FieldDefinition::Text {
            analyzer: None,
            query_analyzer: None,
        };
        let out = fill(&def, json!("Hello World")).unwrap();
        assert_eq!(
            out.terms["f"],
            vec![
                OwnedValue::Str("hello".into()),
                OwnedValue::Str("world".into())
            ]
        );
        assert!(!out.values.contains_key("f"));
    }

    #[test]
    fn geo_point_accepts_pairs_and_objects() {
        let out = fill(&FieldDefinition::GeoPoint, json!([48.8, 2.3, 40.7, -74.0])).unwrap();
        assert_eq!(out.values["f"].len(), 2);
        let out = fill(&FieldDefinition::GeoPoint, json!({"lat": 1.0, "lon": 2.0})).unwrap();
        assert_eq!(out.values["f"].len(), 1);
    }

    #[test]
    fn geo_point_rejects_odd_arrays_and_scalars() {
        assert!(fill(&FieldDefinition::GeoPoint, json!([1.0, 2.0, 3.0])).is_err());
        assert!(fill(&FieldDefinition::GeoPoint, json!(1.0)).is_err());
        assert!(fill(&FieldDefinition::GeoPoint, json!({"lat": 100.0, "lon": 0.0})).is_err());
    }

    #[test]
    fn facet_paths_are_rooted_at_field() {
        let out = fill(&FieldDefinition::Facet, json!("books/scifi")).unwrap();
        assert_eq!(out.facets, vec![Facet::from("/f/books/scifi")]);
    }

    #[test]
    fn map_on_scalar_kind_is_invalid() {
        assert!(fill(&FieldDefinition::String, json!({"a": 1})).is_err());
    }

    #[test]
    fn only_numeric_kinds_sort() {
        assert!(FieldDefinition::Double.get_sort_field("price", true).is_ok());
        assert!(FieldDefinition::String.get_sort_field("sku", false).is_err());
    }

    #[test]
    fn definition_serde_is_tagged() {
        let def: FieldDefinition =
            serde_json::from_str(r#"{"type":"text","analyzer":"english"}"#).unwrap();
        assert_eq!(
            def,
            FieldDefinition::Text {
                analyzer: Some("english".into()),
                query_analyzer: None
            }
        );
        assert_eq!(
            serde_json::to_string(&FieldDefinition::GeoPoint).unwrap(),
            r#"{"type":"geo_point"}"#
        );
    }
}

use crate::error::{GriddleError, Result};
use crate::index::analyzers::AnalyzerContext;
use crate::index::fields::{facet_for, FieldDefinition, FieldMap};
use crate::index::schema::{IndexSchema, TermValue};
use crate::query::Query;
use serde_json::Value;
use std::ops::Bound;
use tantivy::query::{
    AllQuery, BooleanQuery, EmptyQuery, InvertedIndexRangeQuery, Occur, Query as TantivyQuery,
    TermQuery, TermSetQuery,
};
use tantivy::schema::{IndexRecordOption, Type};
use tantivy::Term;

const MAX_QUERY_DEPTH: usize = 16;

/// Compiles [`Query`] trees against one field map and analyzer context.
pub struct QueryCompiler<'a> {
    schema: &'a IndexSchema,
    fields: &'a FieldMap,
    analyzers: &'a AnalyzerContext,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(schema: &'a IndexSchema, fields: &'a FieldMap, analyzers: &'a AnalyzerContext) -> Self {
        QueryCompiler {
            schema,
            fields,
            analyzers,
        }
    }

    pub fn compile(&self, query: &Query) -> Result<Box<dyn TantivyQuery>> {
        self.compile_at(query, 0)
    }

    fn field(&self, name: &str) -> Result<&'a FieldDefinition> {
        self.fields
            .get(name)
            .ok_or_else(|| GriddleError::InvalidQuery(format!("unknown field: {}", name)))
    }

    fn term_query(&self, term: Term) -> Box<dyn TantivyQuery> {
        Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs))
    }

    fn compile_at(&self, query: &Query, depth: usize) -> Result<Box<dyn TantivyQuery>> {
        if depth > MAX_QUERY_DEPTH {
            return Err(GriddleError::InvalidQuery(format!(
                "query nested deeper than {}",
                MAX_QUERY_DEPTH
            )));
        }
        match query {
            Query::MatchAll => Ok(Box::new(AllQuery)),
            Query::Term { field, value } => {
                let terms = self.field(field)?.term_values(field, value, self.analyzers)?;
                Ok(self.conjunction(field, terms))
            }
            Query::Text { field, text, all } => {
                let definition = self.field(field)?;
                if !matches!(definition, FieldDefinition::Text { .. }) {
                    return Err(GriddleError::InvalidQuery(format!(
                        "field {} ({}) is not a text field",
                        field,
                        definition.kind_name()
                    )));
                }
                let tokens = self.analyzers.query_tokens(field, text);
                if *all {
                    let terms = tokens.into_iter().map(TermValue::Str).collect();
                    return Ok(self.conjunction(field, terms));
                }
                let clauses: Vec<(Occur, Box<dyn TantivyQuery>)> = tokens
                    .into_iter()
                    .map(|token| {
                        let term = self.schema.term(field, &TermValue::Str(token));
                        (Occur::Should, self.term_query(term))
                    })
                    .collect();
                if clauses.is_empty() {
                    return Ok(Box::new(EmptyQuery));
                }
                Ok(Box::new(BooleanQuery::new(clauses)))
            }
            Query::Range { field, min, max } => self.range(field, min.as_ref(), max.as_ref()),
            Query::Facet { field, path } => {
                let definition = self.field(field)?;
                if definition != &FieldDefinition::Facet {
                    return Err(GriddleError::InvalidQuery(format!(
                        "field {} ({}) is not a facet field",
                        field,
                        definition.kind_name()
                    )));
                }
                let facet = facet_for(field, path);
                Ok(Box::new(TermQuery::new(
                    Term::from_facet(self.schema.facets, &facet),
                    IndexRecordOption::Basic,
                )))
            }
            Query::Bool {
                must,
                should,
                must_not,
            } => {
                let mut clauses: Vec<(Occur, Box<dyn TantivyQuery>)> = Vec::new();
                for q in must {
                    clauses.push((Occur::Must, self.compile_at(q, depth + 1)?));
                }
                for q in should {
                    clauses.push((Occur::Should, self.compile_at(q, depth + 1)?));
                }
                for q in must_not {
                    clauses.push((Occur::MustNot, self.compile_at(q, depth + 1)?));
                }
                if must.is_empty() && should.is_empty() {
                    clauses.push((Occur::Must, Box::new(AllQuery)));
                }
                Ok(Box::new(BooleanQuery::new(clauses)))
            }
            Query::TermSet { field, values } => {
                let definition = self.field(field)?;
                let mut terms = Vec::with_capacity(values.len());
                for value in values {
                    for term_value in definition.term_values(field, value, self.analyzers)? {
                        terms.push(self.schema.term(field, &term_value));
                    }
                }
                if terms.is_empty() {
                    return Ok(Box::new(EmptyQuery));
                }
                Ok(Box::new(TermSetQuery::new(terms)))
            }
        }
    }

    /// Every term must match. An empty term list matches nothing.
    fn conjunction(&self, field: &str, terms: Vec<TermValue>) -> Box<dyn TantivyQuery> {
        let mut queries: Vec<Box<dyn TantivyQuery>> = terms
            .iter()
            .map(|value| self.term_query(self.schema.term(field, value)))
            .collect();
        match queries.len() {
            0 => Box::new(EmptyQuery),
            1 => queries.remove(0),
            _ => Box::new(BooleanQuery::new(
                queries.into_iter().map(|q| (Occur::Must, q)).collect(),
            )),
        }
    }

    fn bound(&self, field: &str, definition: &FieldDefinition, value: &Value) -> Result<Term> {
        let mut values = definition.term_values(field, value, self.analyzers)?;
        if values.len() != 1 {
            return Err(GriddleError::InvalidQuery(format!(
                "range bound {} on field {} is not a single value",
                value, field
            )));
        }
        Ok(self.schema.term(field, &values.remove(0)))
    }

    fn range(
        &self,
        field: &str,
        min: Option<&Value>,
        max: Option<&Value>,
    ) -> Result<Box<dyn TantivyQuery>> {
        let definition = self.field(field)?;
        let typ = match definition {
            FieldDefinition::String | FieldDefinition::Long | FieldDefinition::Double => {
                definition.term_type()
            }
            _ => None,
        }
        .ok_or_else(|| {
            GriddleError::InvalidQuery(format!(
                "field {} ({}) does not support ranges",
                field,
                definition.kind_name()
            ))
        })?;

        // open ends stay within this field's keys of this type
        let (first, past_last) = key_bounds(self.schema, field, typ);
        let lower = match min {
            Some(value) => Bound::Included(self.bound(field, definition, value)?),
            None => first,
        };
        let upper = match max {
            Some(value) => Bound::Included(self.bound(field, definition, value)?),
            None => past_last,
        };
        Ok(Box::new(InvertedIndexRangeQuery::new(lower, upper)))
    }
}

fn key_bounds(schema: &IndexSchema, field: &str, typ: Type) -> (Bound<Term>, Bound<Term>) {
    let prefix = schema.term_key_prefix(field, typ);
    let mut end = prefix.clone();
    if let Some(last) = end.last_mut() {
        *last += 1;
    }
    (
        Bound::Included(Term::from_field_bytes(schema.terms, &prefix)),
        Bound::Excluded(Term::from_field_bytes(schema.terms, &end)),
    )
}

/// Matches every document holding at least one `typ` term of `field`.
pub fn field_presence(schema: &IndexSchema, field: &str, typ: Type) -> InvertedIndexRangeQuery {
    let (lower, upper) = key_bounds(schema, field, typ);
    InvertedIndexRangeQuery::new(lower, upper)
}

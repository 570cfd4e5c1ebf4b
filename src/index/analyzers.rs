use crate::error::{GriddleError, Result};
use crate::index::fields::{FieldDefinition, FieldMap};
use crate::types::TermDefinition;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tantivy::tokenizer::{
    AsciiFoldingFilter, Language, LowerCaser, RawTokenizer, RemoveLongFilter, SimpleTokenizer,
    Stemmer, StopWordFilter, TextAnalyzer, TokenStream, WhitespaceTokenizer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    #[default]
    Simple,
    Whitespace,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterDefinition {
    Lowercase,
    AsciiFolding,
    Stemmer { language: Language },
    /// One word per line, read from a resource of the index.
    StopWords { resource: String },
    RemoveLong { limit: usize },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnalyzerDefinition {
    #[serde(default)]
    pub tokenizer: TokenizerKind,
    #[serde(default)]
    pub filters: Vec<FilterDefinition>,
}

pub type AnalyzerMap = IndexMap<String, AnalyzerDefinition>;

impl AnalyzerDefinition {
    /// Whether any filter reads the resource `name`.
    pub fn uses_resource(&self, name: &str) -> bool {
        self.filters.iter().any(|filter| {
            matches!(filter, FilterDefinition::StopWords { resource } if resource == name)
        })
    }

    pub fn build(&self, resources_dir: &Path) -> Result<TextAnalyzer> {
        let mut builder = match self.tokenizer {
            TokenizerKind::Simple => TextAnalyzer::builder(SimpleTokenizer::default()).dynamic(),
            TokenizerKind::Whitespace => {
                TextAnalyzer::builder(WhitespaceTokenizer::default()).dynamic()
            }
            TokenizerKind::Raw => TextAnalyzer::builder(RawTokenizer::default()).dynamic(),
        };
        for filter in &self.filters {
            builder = match filter {
                FilterDefinition::Lowercase => builder.filter_dynamic(LowerCaser),
                FilterDefinition::AsciiFolding => builder.filter_dynamic(AsciiFoldingFilter),
                FilterDefinition::Stemmer { language } => {
                    builder.filter_dynamic(Stemmer::new(*language))
                }
                FilterDefinition::StopWords { resource } => {
                    let words = load_word_list(resources_dir, resource)?;
                    builder.filter_dynamic(StopWordFilter::remove(words))
                }
                FilterDefinition::RemoveLong { limit } => {
                    builder.filter_dynamic(RemoveLongFilter::limit(*limit))
                }
            };
        }
        Ok(builder.build())
    }
}

fn load_word_list(resources_dir: &Path, resource: &str) -> Result<Vec<String>> {
    let path = resources_dir.join(resource);
    if !path.is_file() {
        return Err(GriddleError::NotFound(format!("resource: {}", resource)));
    }
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn default_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .build()
}

/// Index and query analyzers resolved for every text field.
///
/// Rebuilt wholesale after each structural edit; an instance swaps the
/// whole context at once so a document is never analyzed half with old
/// and half with new definitions.
#[derive(Clone, Default)]
pub struct AnalyzerContext {
    index: HashMap<String, TextAnalyzer>,
    query: HashMap<String, TextAnalyzer>,
}

impl AnalyzerContext {
    pub fn new(fields: &FieldMap, analyzers: &AnalyzerMap, resources_dir: &Path) -> Result<Self> {
        let mut built: HashMap<&str, TextAnalyzer> = HashMap::new();
        let mut resolve = |name: &Option<String>| -> Result<TextAnalyzer> {
            let Some(name) = name else {
                return Ok(default_analyzer());
            };
            if let Some(analyzer) = built.get(name.as_str()) {
                return Ok(analyzer.clone());
            }
            let (key, definition) = analyzers
                .get_key_value(name)
                .ok_or_else(|| GriddleError::NotFound(format!("analyzer: {}", name)))?;
            let analyzer = definition.build(resources_dir)?;
            built.insert(key.as_str(), analyzer.clone());
            Ok(analyzer)
        };

        let mut context = AnalyzerContext::default();
        for (field_name, definition) in fields {
            if let FieldDefinition::Text {
                analyzer,
                query_analyzer,
            } = definition
            {
                let index_analyzer = resolve(analyzer)?;
                let query = if query_analyzer.is_some() {
                    resolve(query_analyzer)?
                } else {
                    index_analyzer.clone()
                };
                context.index.insert(field_name.clone(), index_analyzer);
                context.query.insert(field_name.clone(), query);
            }
        }
        Ok(context)
    }

    /// Per-field merge where the first context declaring a field wins.
    pub fn merged<'a>(contexts: impl IntoIterator<Item = &'a AnalyzerContext>) -> Self {
        let mut merged = AnalyzerContext::default();
        for context in contexts {
            for (name, analyzer) in &context.index {
                merged
                    .index
                    .entry(name.clone())
                    .or_insert_with(|| analyzer.clone());
            }
            for (name, analyzer) in &context.query {
                merged
                    .query
                    .entry(name.clone())
                    .or_insert_with(|| analyzer.clone());
            }
        }
        merged
    }

    pub fn index_tokens(&self, field: &str, text: &str) -> Vec<String> {
        tokens(self.index.get(field), text)
    }

    pub fn query_tokens(&self, field: &str, text: &str) -> Vec<String> {
        tokens(self.query.get(field), text)
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.index.contains_key(field)
    }
}

fn tokens(analyzer: Option<&TextAnalyzer>, text: &str) -> Vec<String> {
    let mut analyzer = analyzer.cloned().unwrap_or_else(default_analyzer);
    let mut stream = analyzer.token_stream(text);
    let mut out = Vec::new();
    while stream.advance() {
        out.push(stream.token().text.clone());
    }
    out
}

/// Runs `text` through an analyzer and reports every produced token.
pub fn analyze(analyzer: &TextAnalyzer, text: &str) -> Vec<TermDefinition> {
    let mut analyzer = analyzer.clone();
    let mut stream = analyzer.token_stream(text);
    let mut out = Vec::new();
    while stream.advance() {
        let token = stream.token();
        out.push(TermDefinition {
            term: token.text.clone(),
            position: token.position,
            start_offset: token.offset_from,
            end_offset: token.offset_to,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn text_field(analyzer: Option<&str>) -> FieldDefinition {
        FieldDefinition::Text {
            analyzer: analyzer.map(str::to_string),
            query_analyzer: None,
        }
    }

    #[test]
    fn default_analyzer_lowercases() {
        let tmp = TempDir::new().unwrap();
        let mut fields = FieldMap::new();
        fields.insert("title".into(), text_field(None));
        let ctx = AnalyzerContext::new(&fields, &AnalyzerMap::new(), tmp.path()).unwrap();
        assert_eq!(ctx.index_tokens("title", "Hello World"), vec!["hello", "world"]);
        assert_eq!(ctx.query_tokens("title", "HELLO"), vec!["hello"]);
    }

    #[test]
    fn stop_words_come_from_resource() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("stop.txt"), "the\n# comment\na\n").unwrap();
        let mut analyzers = AnalyzerMap::new();
        analyzers.insert(
            "english".into(),
            AnalyzerDefinition {
                tokenizer: TokenizerKind::Simple,
                filters: vec![
                    FilterDefinition::Lowercase,
                    FilterDefinition::StopWords {
                        resource: "stop.txt".into(),
                    },
                    FilterDefinition::Stemmer {
                        language: Language::English,
                    },
                ],
            },
        );
        let mut fields = FieldMap::new();
        fields.insert("body".into(), text_field(Some("english")));
        let ctx = AnalyzerContext::new(&fields, &analyzers, tmp.path()).unwrap();
        assert_eq!(ctx.index_tokens("body", "The running dogs"), vec!["run", "dog"]);
    }

    #[test]
    fn unknown_analyzer_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let mut fields = FieldMap::new();
        fields.insert("body".into(), text_field(Some("missing")));
        let err = AnalyzerContext::new(&fields, &AnalyzerMap::new(), tmp.path())
            .err()
            .unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn missing_stop_word_resource_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let definition = AnalyzerDefinition {
            tokenizer: TokenizerKind::Whitespace,
            filters: vec![FilterDefinition::StopWords {
                resource: "nope.txt".into(),
            }],
        };
        assert!(definition.build(tmp.path()).err().unwrap().is_not_found());
    }

    #[test]
    fn merge_keeps_first_declaration() {
        let tmp = TempDir::new().unwrap();
        let mut raw = AnalyzerMap::new();
        raw.insert(
            "raw".into(),
            AnalyzerDefinition {
                tokenizer: TokenizerKind::Raw,
                filters: vec![],
            },
        );
        let mut first_fields = FieldMap::new();
        first_fields.insert("title".into(), text_field(Some("raw")));
        let first = AnalyzerContext::new(&first_fields, &raw, tmp.path()).unwrap();

        let mut second_fields = FieldMap::new();
        second_fields.insert("title".into(), text_field(None));
        second_fields.insert("body".into(), text_field(None));
        let second = AnalyzerContext::new(&second_fields, &AnalyzerMap::new(), tmp.path()).unwrap();

        let merged = AnalyzerContext::merged([&first, &second]);
        assert_eq!(merged.index_tokens("title", "Hello World"), vec!["Hello World"]);
        assert_eq!(merged.index_tokens("body", "Hello World"), vec!["hello", "world"]);
    }

    #[test]
    fn analyze_reports_offsets() {
        let terms = analyze(&default_analyzer(), "Quick fox");
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[1].term, "fox");
        assert_eq!(terms[1].position, 1);
        assert_eq!(terms[1].start_offset, 6);
        assert_eq!(terms[1].end_offset, 9);
    }

    #[test]
    fn definition_serde_shape() {
        let json = r#"{"tokenizer":"whitespace","filters":[{"type":"lowercase"},{"type":"remove_long","limit":40}]}"#;
        let def: AnalyzerDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.tokenizer, TokenizerKind::Whitespace);
        assert_eq!(def.filters[1], FilterDefinition::RemoveLong { limit: 40 });
    }
}

//! Paginated extraction pipeline
//!
//! One invocation parses a document, counts its context nodes (first
//! invocation only), processes the next window of at most `batch_size`
//! context nodes and advances the persisted cursor. Within a context node,
//! fields are evaluated in declaration order and each single-valued result is
//! bound as `$target` for the fields after it.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sxd_xpath::nodeset::Node;

use crate::config::{ExtractionContext, COUNT_SOURCE, CONTEXT_SOURCE};
use crate::document::{Dialect, ParsedDocument, Preprocessor, RawDocument};
use crate::error::{codes, ConfigError, ExtractionError, QueryDiagnostic, Result, Severity};
use crate::filter::{FilterChain, NodeFilter};
use crate::messages::{Message, MessageSink};
use crate::progress::ProgressStore;
use crate::query::{EngineOptions, QueryEngine, QueryResult};
use crate::serialize::serialize_node;

/// Extracted value of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Single(String),
    /// Several matches, in document order
    Multiple(Vec<String>),
}

impl FieldValue {
    pub fn as_single(&self) -> Option<&str> {
        match self {
            FieldValue::Single(value) => Some(value),
            FieldValue::Multiple(_) => None,
        }
    }

    /// All values, one element for a single value.
    pub fn values(&self) -> Vec<&str> {
        match self {
            FieldValue::Single(value) => vec![value.as_str()],
            FieldValue::Multiple(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

/// Field key to value, in field declaration order. Absent fields have no entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractedRecord {
    fields: IndexMap<String, FieldValue>,
}

impl ExtractedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.fields.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// `$target` bindings for one context node.
///
/// Replacement scans the query once, preferring the longest token at each
/// position, and never re-scans substituted text. Tokens with no binding are
/// left in place.
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    bindings: HashMap<String, String>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, target: &str, value: impl Into<String>) {
        self.bindings.insert(format!("${}", target), value.into());
    }

    pub fn get(&self, target: &str) -> Option<&str> {
        self.bindings.get(&format!("${}", target)).map(String::as_str)
    }

    pub fn apply<'q>(&self, query: &'q str) -> Cow<'q, str> {
        if self.bindings.is_empty() || !query.contains('$') {
            return Cow::Borrowed(query);
        }

        let mut tokens: Vec<(&str, &str)> = self
            .bindings
            .iter()
            .map(|(token, value)| (token.as_str(), value.as_str()))
            .collect();
        tokens.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let mut out = String::with_capacity(query.len());
        let mut rest = query;
        while let Some(offset) = rest.find('$') {
            out.push_str(&rest[..offset]);
            rest = &rest[offset..];
            match tokens.iter().find(|(token, _)| rest.starts_with(token)) {
                Some((token, value)) => {
                    out.push_str(value);
                    rest = &rest[token.len()..];
                }
                None => {
                    out.push('$');
                    rest = &rest[1..];
                }
            }
        }
        out.push_str(rest);
        Cow::Owned(out)
    }
}

/// Output of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionBatch {
    pub records: Vec<ExtractedRecord>,
    pub total: usize,
    /// Cursor before this batch
    pub start: usize,
    /// Cursor after this batch
    pub end: usize,
    /// Context nodes discarded by the filter hook
    pub skipped: usize,
}

impl ExtractionBatch {
    pub fn is_complete(&self) -> bool {
        self.end >= self.total
    }
}

/// Runs configured extractions against documents.
pub struct Extractor {
    config: ExtractionContext,
    filters: FilterChain,
    preprocessor: Option<Box<dyn Preprocessor>>,
}

impl Extractor {
    pub fn new(config: ExtractionContext) -> Self {
        Self {
            config,
            filters: FilterChain::new(),
            preprocessor: None,
        }
    }

    pub fn with_filter(mut self, filter: impl NodeFilter + 'static) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_filters(mut self, filters: FilterChain) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: impl Preprocessor + 'static) -> Self {
        self.preprocessor = Some(Box::new(preprocessor));
        self
    }

    pub fn config(&self) -> &ExtractionContext {
        &self.config
    }

    /// Parse `raw` and process the next batch of context nodes.
    pub fn run(
        &self,
        raw: &RawDocument,
        feed: &str,
        store: &dyn ProgressStore,
        sink: &dyn MessageSink,
    ) -> Result<ExtractionBatch> {
        let parsed = ParsedDocument::parse(raw, self.preprocessor.as_deref())?;
        self.extract(&parsed, feed, store, sink)
    }

    /// Process the next batch of context nodes of an already parsed document.
    pub fn extract(
        &self,
        parsed: &ParsedDocument,
        feed: &str,
        store: &dyn ProgressStore,
        sink: &dyn MessageSink,
    ) -> Result<ExtractionBatch> {
        let config = &self.config;
        let context = config.context.trim();
        if context.is_empty() {
            return Err(ConfigError::EmptyContext.into());
        }
        if config.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize.into());
        }

        if config.show_errors {
            for diagnostic in parsed.diagnostics() {
                sink.emit(Message::warning(diagnostic.clone()).with_source(feed));
            }
        }

        let options = EngineOptions {
            debug: config.debug_keys(),
            show_errors: config.show_errors,
        };
        let engine = QueryEngine::new(parsed, options, sink);

        let mut state = store.get()?;
        let total = match state.total {
            Some(total) => total,
            None => {
                let total = count_context(&engine, context)?;
                state.total = Some(total);
                store.set(state)?;
                total
            }
        };

        let start = state.start();
        let end = start.saturating_add(config.batch_size).min(total);
        if start >= end {
            tracing::info!(feed, total, pointer = start, "No context nodes left");
            store.report_progress(total, start.min(total))?;
            return Ok(ExtractionBatch {
                total,
                start,
                end: start,
                ..ExtractionBatch::default()
            });
        }

        state.pointer = Some(end);
        store.set(state)?;

        tracing::info!(feed, total, start, end, "Extracting batch");

        let window = format!(
            "({})[position() > {} and position() <= {}]",
            context, start, end
        );
        let nodes = context_nodes(&engine, &window)?;

        let raw_keys = config.raw_keys();
        let mut records = Vec::new();
        let mut skipped = 0;
        for node in nodes {
            if self.filters.should_skip(node, feed) {
                skipped += 1;
                continue;
            }
            let record = self.extract_record(&engine, node, &raw_keys);
            if record.is_empty() {
                tracing::debug!(feed, "Discarding empty record");
                continue;
            }
            records.push(record);
        }

        store.report_progress(total, end)?;
        tracing::info!(feed, records = records.len(), skipped, pointer = end, "Batch complete");

        Ok(ExtractionBatch {
            records,
            total,
            start,
            end,
            skipped,
        })
    }

    fn extract_record<'d>(
        &self,
        engine: &QueryEngine<'d, '_>,
        node: Node<'d>,
        raw_keys: &HashSet<&str>,
    ) -> ExtractedRecord {
        let mut record = ExtractedRecord::new();
        let mut substitutions = Substitutions::new();

        for field in &self.config.fields {
            let query = substitutions.apply(field.query.trim());
            if query.is_empty() {
                continue;
            }

            let Some(result) = engine.evaluate(&query, Some(node), &field.key).result else {
                continue;
            };
            let raw = raw_keys.contains(field.key.as_str());
            match collapse(render(result, raw, engine.dialect())) {
                Some(FieldValue::Single(value)) => {
                    substitutions.bind(&field.target, value.clone());
                    record.insert(field.key.clone(), FieldValue::Single(value));
                }
                Some(values) => {
                    substitutions.bind(&field.target, "");
                    record.insert(field.key.clone(), values);
                }
                None => {}
            }
        }

        record
    }
}

impl std::fmt::Debug for Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor")
            .field("config", &self.config)
            .field("filters", &self.filters)
            .field("preprocessor", &self.preprocessor.is_some())
            .finish()
    }
}

fn count_context(engine: &QueryEngine<'_, '_>, context: &str) -> Result<usize> {
    let query = format!("count({})", context);
    match engine.evaluate(&query, None, COUNT_SOURCE).into_result() {
        Ok(QueryResult::Number(n)) if n >= 0.0 => Ok(n as usize),
        Ok(_) => Err(not_a_node_set(&query)),
        Err(diagnostic) => Err(ExtractionError::ContextQuery(diagnostic)),
    }
}

fn context_nodes<'d>(engine: &QueryEngine<'d, '_>, window: &str) -> Result<Vec<Node<'d>>> {
    match engine.evaluate(window, None, CONTEXT_SOURCE).into_result() {
        Ok(QueryResult::Nodes(nodes)) => Ok(nodes),
        Ok(_) => Err(not_a_node_set(window)),
        Err(diagnostic) => Err(ExtractionError::ContextQuery(diagnostic)),
    }
}

fn not_a_node_set(query: &str) -> ExtractionError {
    ExtractionError::ContextQuery(QueryDiagnostic::new(
        Severity::Error,
        codes::INVALID_TYPE,
        "context expression does not select nodes",
        query,
    ))
}

/// Matched nodes as markup or text; a scalar as its string value.
fn render(result: QueryResult<'_>, raw: bool, dialect: Dialect) -> Vec<String> {
    match result {
        QueryResult::Nodes(nodes) => nodes
            .into_iter()
            .map(|node| {
                if raw {
                    serialize_node(node, dialect)
                } else {
                    node.string_value()
                }
            })
            .collect(),
        scalar => scalar.scalar_string().into_iter().collect(),
    }
}

/// One value is single, several a sequence, none is absent.
fn collapse(mut values: Vec<String>) -> Option<FieldValue> {
    match values.len() {
        0 => None,
        1 => values.pop().map(FieldValue::Single),
        _ => Some(FieldValue::Multiple(values)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldSpec;
    use crate::messages::MessageLog;
    use crate::progress::{MemoryProgressStore, PaginationState};
    use proptest::prelude::*;

    fn numbered_list(n: usize) -> RawDocument {
        let items: String = (1..=n)
            .map(|i| format!("<item><id>{}</id></item>", i))
            .collect();
        RawDocument::xml(format!("<list>{}</list>", items))
    }

    fn ids(batch: &ExtractionBatch) -> Vec<String> {
        batch
            .records
            .iter()
            .filter_map(|r| r.get("id").and_then(FieldValue::as_single).map(String::from))
            .collect()
    }

    fn id_extractor(batch_size: usize) -> Extractor {
        Extractor::new(
            ExtractionContext::new("//item")
                .with_field(FieldSpec::new("id", "id", "id"))
                .with_batch_size(batch_size),
        )
    }

    #[test]
    fn test_substitution_prefers_longest_token() {
        let mut subs = Substitutions::new();
        subs.bind("id", "7");
        subs.bind("idx", "9");
        assert_eq!(subs.apply("//a[@n=$idx or @m=$id]"), "//a[@n=9 or @m=7]");
        assert_eq!(subs.get("id"), Some("7"));
    }

    #[test]
    fn test_substitution_leaves_unbound_tokens() {
        let mut subs = Substitutions::new();
        subs.bind("a", "$b");
        // substituted text is not scanned again
        assert_eq!(subs.apply("$a/$b/$"), "$b/$b/$");
        assert!(matches!(Substitutions::new().apply("$a"), Cow::Borrowed("$a")));
    }

    #[test]
    fn test_collapse_rules() {
        assert_eq!(collapse(vec![]), None);
        assert_eq!(collapse(vec![String::new()]), Some(FieldValue::Single(String::new())));
        assert_eq!(collapse(vec!["a".into()]), Some(FieldValue::Single("a".into())));
        assert_eq!(
            collapse(vec!["a".into(), "b".into()]),
            Some(FieldValue::Multiple(vec!["a".into(), "b".into()]))
        );
    }

    #[test]
    fn test_five_nodes_in_batches_of_two() {
        let raw = numbered_list(5);
        let store = MemoryProgressStore::new();
        let log = MessageLog::new();
        let extractor = id_extractor(2);

        let first = extractor.run(&raw, "feed", &store, &log).unwrap();
        assert_eq!((first.start, first.end, first.total), (0, 2, 5));
        assert_eq!(ids(&first), vec!["1", "2"]);

        let second = extractor.run(&raw, "feed", &store, &log).unwrap();
        assert_eq!(ids(&second), vec!["3", "4"]);
        assert_eq!(store.get().unwrap(), PaginationState::new(5, 4));

        let third = extractor.run(&raw, "feed", &store, &log).unwrap();
        assert_eq!(ids(&third), vec!["5"]);
        assert!(third.is_complete());

        let fourth = extractor.run(&raw, "feed", &store, &log).unwrap();
        assert!(fourth.records.is_empty());
        assert_eq!((fourth.start, fourth.end), (5, 5));
        assert_eq!(store.reports().unwrap(), vec![(5, 2), (5, 4), (5, 5), (5, 5)]);
    }

    #[test]
    fn test_total_is_never_recomputed() {
        let store = MemoryProgressStore::with_state(PaginationState {
            total: Some(2),
            pointer: None,
        });
        let log = MessageLog::new();
        let extractor = Extractor::new(
            ExtractionContext::new("//item")
                .with_field(FieldSpec::new("id", "id", "id"))
                .with_debug(COUNT_SOURCE),
        );

        let batch = extractor.run(&numbered_list(5), "feed", &store, &log).unwrap();
        assert_eq!(ids(&batch), vec!["1", "2"]);
        assert_eq!(batch.total, 2);
        // the count query never ran, so nothing was dumped for it
        assert!(log.is_empty());
    }

    #[test]
    fn test_context_failure_is_an_error() {
        let store = MemoryProgressStore::new();
        let log = MessageLog::new();
        let extractor = Extractor::new(ExtractionContext::new("//item["));

        let err = extractor.run(&numbered_list(2), "feed", &store, &log).unwrap_err();
        assert!(matches!(err, ExtractionError::ContextQuery(_)));
        assert!(err.is_document_failure());
        assert_eq!(store.get().unwrap(), PaginationState::default());
    }

    #[test]
    fn test_fatal_context_query_aborts_batch() {
        let store = MemoryProgressStore::new();
        let log = MessageLog::new();
        let extractor = Extractor::new(
            ExtractionContext::new("(//item)[@id='x")
                .with_field(FieldSpec::new("id", "id", "id"))
                .with_show_errors(true),
        );

        let err = extractor.run(&numbered_list(3), "feed", &store, &log).unwrap_err();
        assert!(err.is_document_failure());
        match err {
            ExtractionError::ContextQuery(diagnostic) => {
                assert_eq!(diagnostic.severity, Severity::Fatal);
                assert_eq!(diagnostic.code, codes::UNFINISHED_LITERAL);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.get().unwrap(), PaginationState::default());
        assert!(store.reports().unwrap().is_empty());
        assert_eq!(log.messages().len(), 1);
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let store = MemoryProgressStore::new();
        let log = MessageLog::new();
        let err = id_extractor(0)
            .run(&numbered_list(1), "feed", &store, &log)
            .unwrap_err();

        assert!(matches!(err, ExtractionError::Configuration(ConfigError::ZeroBatchSize)));
        assert_eq!(store.get().unwrap(), PaginationState::default());
    }

    #[test]
    fn test_scalar_context_is_an_error() {
        let store = MemoryProgressStore::with_state(PaginationState::new(1, 0));
        let log = MessageLog::new();
        let extractor = Extractor::new(ExtractionContext::new("'not nodes'"));

        let err = extractor.run(&numbered_list(1), "feed", &store, &log).unwrap_err();
        match err {
            ExtractionError::ContextQuery(diagnostic) => assert_eq!(diagnostic.code, codes::INVALID_TYPE),
            other => panic!("unexpected error: {other}"),
        }
    }

    proptest! {
        #[test]
        fn prop_batches_partition_context_nodes(total in 0usize..12, batch_size in 1usize..5) {
            let raw = numbered_list(total);
            let store = MemoryProgressStore::new();
            let log = MessageLog::new();
            let extractor = id_extractor(batch_size);

            let mut seen = Vec::new();
            let mut invocations = 0;
            loop {
                let batch = extractor.run(&raw, "feed", &store, &log).unwrap();
                if batch.start == batch.end {
                    break;
                }
                invocations += 1;
                seen.extend(ids(&batch));
            }

            let expected: Vec<String> = (1..=total).map(|i| i.to_string()).collect();
            prop_assert_eq!(seen, expected);
            prop_assert_eq!(invocations, total.div_ceil(batch_size));
        }
    }
}

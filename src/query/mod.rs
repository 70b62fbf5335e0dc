//! Namespace-aware query engine
//!
//! Wraps XPath evaluation over one parsed document:
//! - registers the document's namespace prefixes (and a synthetic prefix for
//!   its default namespace) with the evaluator
//! - rewrites queries so unprefixed element steps match the default namespace
//! - returns each evaluation's diagnostic alongside its result, so no
//!   diagnostic outlives the call that produced it
//! - dumps results and reports diagnostics to a [`MessageSink`] when asked

pub mod lexer;
pub mod rewrite;

use std::borrow::Cow;
use std::collections::HashSet;

use sxd_document::dom::Document;
use sxd_xpath::nodeset::Node;
use sxd_xpath::{Context, Factory, Value};

use crate::document::{Dialect, ParsedDocument, XML_NAMESPACE};
use crate::error::{codes, QueryDiagnostic, Severity};
use crate::messages::{Message, MessageSink};
use crate::serialize::serialize_node;

pub use lexer::{tokenize, LexError, Spanned, Token};
pub use rewrite::{qualify_default_namespace, synthetic_prefix, QueryRewriter, DEFAULT_PREFIX};

/// XPath 1.0 core function library.
const CORE_FUNCTIONS: &[&str] = &[
    "last", "position", "count", "id", "local-name", "namespace-uri", "name", "string", "concat",
    "starts-with", "contains", "substring-before", "substring-after", "substring",
    "string-length", "normalize-space", "translate", "boolean", "not", "true", "false", "lang",
    "number", "sum", "floor", "ceiling", "round",
];

/// Native result of a successful evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult<'d> {
    Boolean(bool),
    Number(f64),
    String(String),
    /// Matched nodes in document order
    Nodes(Vec<Node<'d>>),
}

impl<'d> From<Value<'d>> for QueryResult<'d> {
    fn from(value: Value<'d>) -> Self {
        match value {
            Value::Boolean(b) => QueryResult::Boolean(b),
            Value::Number(n) => QueryResult::Number(n),
            Value::String(s) => QueryResult::String(s),
            Value::Nodeset(nodes) => QueryResult::Nodes(nodes.document_order()),
        }
    }
}

impl<'d> QueryResult<'d> {
    pub fn nodes(&self) -> Option<&[Node<'d>]> {
        match self {
            QueryResult::Nodes(nodes) => Some(nodes),
            _ => None,
        }
    }

    /// XPath string value of a scalar result; `None` for node sets.
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            QueryResult::Boolean(b) => Some(b.to_string()),
            QueryResult::Number(n) => Some(format_number(*n)),
            QueryResult::String(s) => Some(s.clone()),
            QueryResult::Nodes(_) => None,
        }
    }
}

/// XPath number-to-string conversion.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Outcome of one evaluation.
///
/// `result` is `None` exactly when the diagnostic is an error or worse, so a
/// failed query is never mistaken for `false` or an empty node set.
#[derive(Debug, Clone)]
pub struct Evaluation<'d> {
    pub result: Option<QueryResult<'d>>,
    pub diagnostic: Option<QueryDiagnostic>,
}

impl<'d> Evaluation<'d> {
    pub fn is_failure(&self) -> bool {
        self.result.is_none()
    }

    pub fn into_result(self) -> Result<QueryResult<'d>, QueryDiagnostic> {
        match (self.result, self.diagnostic) {
            (Some(result), _) => Ok(result),
            (None, Some(diagnostic)) => Err(diagnostic),
            (None, None) => Err(QueryDiagnostic::new(
                Severity::Error,
                codes::INVALID_EXPRESSION,
                "evaluation produced no result",
                "",
            )),
        }
    }
}

/// Debug and error reporting switches.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Sources (field keys, `context`, `count`) whose results are dumped
    pub debug: HashSet<String>,
    /// Report diagnostics to the message sink
    pub show_errors: bool,
}

/// Check that `query` compiles, without evaluating it.
pub fn check_syntax(query: &str) -> Result<(), String> {
    if query.trim().is_empty() {
        return Err("empty expression".to_string());
    }
    tokenize(query).map_err(|e| e.to_string())?;
    match Factory::new().build(query) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err("empty expression".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// Executes XPath queries against one parsed document.
pub struct QueryEngine<'d, 's> {
    document: Document<'d>,
    dialect: Dialect,
    factory: Factory,
    context: Context<'d>,
    prefixes: HashSet<String>,
    rewriter: Option<QueryRewriter>,
    options: EngineOptions,
    sink: &'s dyn MessageSink,
}

impl<'d, 's> QueryEngine<'d, 's> {
    pub fn new(parsed: &'d ParsedDocument, options: EngineOptions, sink: &'s dyn MessageSink) -> Self {
        let namespaces = parsed.namespaces();
        let mut context = Context::new();
        let mut prefixes = HashSet::new();

        context.set_namespace("xml", XML_NAMESPACE);
        prefixes.insert("xml".to_string());
        for (prefix, uri) in namespaces.prefixed() {
            context.set_namespace(prefix, uri);
            prefixes.insert(prefix.to_string());
        }

        let rewriter = namespaces.default_namespace().map(|uri| {
            let prefix = synthetic_prefix(namespaces);
            context.set_namespace(&prefix, uri);
            prefixes.insert(prefix.clone());
            QueryRewriter::new(prefix)
        });

        tracing::debug!(
            prefixes = prefixes.len(),
            default_prefix = ?rewriter.as_ref().map(QueryRewriter::prefix),
            "Query engine ready"
        );

        Self {
            document: parsed.document(),
            dialect: parsed.dialect(),
            factory: Factory::new(),
            context,
            prefixes,
            rewriter,
            options,
            sink,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// The synthetic prefix bound to the default namespace, if any.
    pub fn default_prefix(&self) -> Option<&str> {
        self.rewriter.as_ref().map(QueryRewriter::prefix)
    }

    /// The query as it will be handed to the evaluator.
    pub fn effective_query<'q>(&self, query: &'q str) -> Cow<'q, str> {
        match &self.rewriter {
            Some(rewriter) => Cow::Owned(rewriter.rewrite(query)),
            None => Cow::Borrowed(query),
        }
    }

    /// Evaluate `query` relative to `context_node` (the document root when
    /// `None`). `source` names the field (or `context` / `count`) for debug
    /// and error reporting.
    pub fn evaluate(&self, query: &str, context_node: Option<Node<'d>>, source: &str) -> Evaluation<'d> {
        let effective = self.effective_query(query);
        let node = context_node.unwrap_or(Node::Root(self.document.root()));

        let (result, diagnostic) = match self.execute(query, &effective, node) {
            Ok(result) => (Some(result), None),
            Err(diagnostic) => (None, Some(diagnostic)),
        };

        if self.options.debug.contains(source) {
            self.debug(source, result.as_ref());
        }
        if let Some(diagnostic) = &diagnostic {
            self.report(source, diagnostic);
        }

        Evaluation { result, diagnostic }
    }

    fn execute(&self, original: &str, effective: &str, node: Node<'d>) -> Result<QueryResult<'d>, QueryDiagnostic> {
        let xpath = self
            .factory
            .build(effective)
            .map_err(|e| self.classify(original, effective, e.to_string(), true))?
            .ok_or_else(|| {
                QueryDiagnostic::new(
                    Severity::Error,
                    codes::INVALID_EXPRESSION,
                    "Invalid expression: empty query",
                    original,
                )
            })?;

        // the evaluator treats an unbound prefix as a non-matching name test
        if let Some(prefix) = self.undefined_prefix(effective) {
            return Err(QueryDiagnostic::new(
                Severity::Error,
                codes::UNDEFINED_PREFIX,
                format!("Undefined namespace prefix: {}", prefix),
                original,
            ));
        }

        xpath
            .evaluate(&self.context, node)
            .map(QueryResult::from)
            .map_err(|e| self.classify(original, effective, e.to_string(), false))
    }

    /// Assign a severity and code to an evaluator failure.
    fn classify(&self, original: &str, effective: &str, message: String, compiling: bool) -> QueryDiagnostic {
        let tokens = match tokenize(effective) {
            Ok(tokens) => tokens,
            Err(e) => {
                let code = match e.kind {
                    lexer::LexErrorKind::UnterminatedLiteral => codes::UNFINISHED_LITERAL,
                    lexer::LexErrorKind::UnexpectedChar(_) => codes::INVALID_CHAR,
                };
                return QueryDiagnostic::new(Severity::Fatal, code, format!("{}: {}", message, e), original);
            }
        };

        let code = if compiling {
            codes::INVALID_EXPRESSION
        } else if tokens.iter().any(|t| matches!(t.token, Token::Variable(_))) {
            codes::UNDEFINED_VARIABLE
        } else if tokens.iter().any(|t| match t.token {
            Token::FunctionName(name) => !CORE_FUNCTIONS.contains(&name),
            _ => false,
        }) {
            codes::UNKNOWN_FUNCTION
        } else {
            codes::INVALID_TYPE
        };

        QueryDiagnostic::new(Severity::Error, code, message, original)
    }

    fn undefined_prefix(&self, query: &str) -> Option<String> {
        let tokens = tokenize(query).ok()?;
        tokens.iter().find_map(|t| {
            let prefix = match t.token {
                Token::NameTest { prefix: Some(p), .. } => p,
                Token::FunctionName(name) => name.split_once(':')?.0,
                _ => return None,
            };
            (!self.prefixes.contains(prefix)).then(|| prefix.to_string())
        })
    }

    fn debug(&self, source: &str, result: Option<&QueryResult<'d>>) {
        let items: Vec<String> = match result {
            Some(QueryResult::Nodes(nodes)) => nodes
                .iter()
                .map(|node| serialize_node(*node, self.dialect))
                .collect(),
            Some(scalar) => scalar.scalar_string().into_iter().collect(),
            None => vec!["(evaluation failed)".to_string()],
        };

        tracing::debug!(source, results = items.len(), "Query debug output");

        let mut text = format!("{} :", source);
        for item in &items {
            text.push_str("\n  - ");
            text.push_str(item);
        }
        self.sink.emit(Message::status(source, text));
    }

    fn report(&self, source: &str, diagnostic: &QueryDiagnostic) {
        tracing::warn!(
            source,
            code = diagnostic.code,
            severity = ?diagnostic.severity,
            query = %diagnostic.query,
            "XPath query failed: {}",
            diagnostic.message
        );

        if !self.options.show_errors {
            return;
        }
        let text = format!(
            "There was an error during the XPath query: {}. The evaluator returned the message: {}, with the error code: {}.",
            diagnostic.query,
            diagnostic.message.trim(),
            diagnostic.code
        );
        let message = match diagnostic.severity {
            Severity::Warning => Message::warning(text),
            Severity::Error | Severity::Fatal => Message::error(text),
        };
        self.sink.emit(message.with_source(source));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MessageLevel, MessageLog};

    const FEED: &str = r#"<?xml version="1.0"?>
    <items xmlns="urn:x" xmlns:x="urn:x" xmlns:dc="http://purl.org/dc/elements/1.1/">
        <item id="1"><title>One</title><dc:creator>Ann</dc:creator></item>
        <item id="2"><title>Two</title></item>
    </items>"#;

    fn names<'d>(result: &QueryResult<'d>) -> Vec<String> {
        result
            .nodes()
            .unwrap()
            .iter()
            .map(|n| n.string_value())
            .collect()
    }

    #[test]
    fn test_default_namespace_paths_match() {
        let parsed = ParsedDocument::parse_str(FEED, Dialect::Xml).unwrap();
        let log = MessageLog::new();
        let engine = QueryEngine::new(&parsed, EngineOptions::default(), &log);
        assert_eq!(engine.default_prefix(), Some(DEFAULT_PREFIX));

        let bare = engine.evaluate("/items/item/title", None, "t").into_result().unwrap();
        let explicit = engine.evaluate("/x:items/x:item/x:title", None, "t").into_result().unwrap();
        assert_eq!(names(&bare), vec!["One", "Two"]);
        assert_eq!(bare, explicit);

        let creator = engine.evaluate("//dc:creator", None, "c").into_result().unwrap();
        assert_eq!(names(&creator), vec!["Ann"]);
    }

    #[test]
    fn test_relative_evaluation_and_repeatability() {
        let parsed = ParsedDocument::parse_str(FEED, Dialect::Xml).unwrap();
        let log = MessageLog::new();
        let engine = QueryEngine::new(&parsed, EngineOptions::default(), &log);

        let items = engine.evaluate("//item", None, "context").into_result().unwrap();
        let second = items.nodes().unwrap()[1];
        let first_try = engine.evaluate("title", Some(second), "t").into_result().unwrap();
        let second_try = engine.evaluate("title", Some(second), "t").into_result().unwrap();
        assert_eq!(names(&first_try), vec!["Two"]);
        assert_eq!(first_try, second_try);

        let id = engine.evaluate("string(@id)", Some(second), "id").into_result().unwrap();
        assert_eq!(id, QueryResult::String("2".into()));
    }

    #[test]
    fn test_false_is_not_an_error() {
        let parsed = ParsedDocument::parse_str("<a/>", Dialect::Xml).unwrap();
        let log = MessageLog::new();
        let engine = QueryEngine::new(&parsed, EngineOptions::default(), &log);

        let evaluation = engine.evaluate("1 = 2", None, "f");
        assert_eq!(evaluation.result, Some(QueryResult::Boolean(false)));
        assert!(evaluation.diagnostic.is_none());

        let empty = engine.evaluate("//missing", None, "m");
        assert_eq!(empty.result, Some(QueryResult::Nodes(vec![])));
    }

    #[test]
    fn test_failed_query_returns_null_and_reports() {
        let parsed = ParsedDocument::parse_str(FEED, Dialect::Xml).unwrap();
        let log = MessageLog::new();
        let options = EngineOptions {
            show_errors: true,
            ..EngineOptions::default()
        };
        let engine = QueryEngine::new(&parsed, options, &log);

        let evaluation = engine.evaluate("//item[", None, "broken");
        assert!(evaluation.is_failure());
        let diagnostic = evaluation.diagnostic.unwrap();
        assert_eq!(diagnostic.code, codes::INVALID_EXPRESSION);
        // the original query is reported, not the rewritten one
        assert_eq!(diagnostic.query, "//item[");

        let messages = log.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].level, MessageLevel::Error);
        assert!(messages[0].text.contains("//item["));
        assert!(!messages[0].text.contains(DEFAULT_PREFIX));

        // a new evaluation starts from a clean diagnostic
        let ok = engine.evaluate("//item", None, "fine");
        assert!(ok.diagnostic.is_none());
        assert!(log.is_empty());
    }

    #[test]
    fn test_blank_query_is_an_invalid_expression() {
        let parsed = ParsedDocument::parse_str("<a/>", Dialect::Xml).unwrap();
        let log = MessageLog::new();
        let engine = QueryEngine::new(&parsed, EngineOptions::default(), &log);

        for query in ["", "   ", "\n\t"] {
            let evaluation = engine.evaluate(query, None, "blank");
            assert!(evaluation.is_failure());
            let diagnostic = evaluation.diagnostic.unwrap();
            assert_eq!(diagnostic.severity, Severity::Error);
            assert_eq!(diagnostic.code, codes::INVALID_EXPRESSION);
        }
        assert!(check_syntax("  ").is_err());
    }

    #[test]
    fn test_errors_are_silent_unless_enabled() {
        let parsed = ParsedDocument::parse_str("<a/>", Dialect::Xml).unwrap();
        let log = MessageLog::new();
        let engine = QueryEngine::new(&parsed, EngineOptions::default(), &log);

        assert!(engine.evaluate("//a[", None, "x").is_failure());
        assert!(log.is_empty());
    }

    #[test]
    fn test_diagnostic_codes() {
        let parsed = ParsedDocument::parse_str("<a><b/></a>", Dialect::Xml).unwrap();
        let log = MessageLog::new();
        let engine = QueryEngine::new(&parsed, EngineOptions::default(), &log);

        let code = |query: &str| engine.evaluate(query, None, "q").diagnostic.map(|d| (d.severity, d.code));
        assert_eq!(code("//media:thumbnail"), Some((Severity::Error, codes::UNDEFINED_PREFIX)));
        assert_eq!(code("//b[@id = $missing]"), Some((Severity::Error, codes::UNDEFINED_VARIABLE)));
        assert_eq!(code("//b[@id = 'x]"), Some((Severity::Fatal, codes::UNFINISHED_LITERAL)));
        assert_eq!(code("//b"), None);
    }

    #[test]
    fn test_debug_dumps_serialized_results() {
        let parsed = ParsedDocument::parse_str("<a><b>x</b><b>y</b></a>", Dialect::Xml).unwrap();
        let log = MessageLog::new();
        let options = EngineOptions {
            debug: HashSet::from(["body".to_string()]),
            show_errors: false,
        };
        let engine = QueryEngine::new(&parsed, options, &log);

        engine.evaluate("//b", None, "body");
        engine.evaluate("count(//b)", None, "other");

        let messages = log.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].source.as_deref(), Some("body"));
        assert_eq!(messages[0].text, "body :\n  - <b>x</b>\n  - <b>y</b>");
    }

    #[test]
    fn test_no_default_namespace_means_no_rewrite() {
        let parsed = ParsedDocument::parse_str("<a><b/></a>", Dialect::Xml).unwrap();
        let log = MessageLog::new();
        let engine = QueryEngine::new(&parsed, EngineOptions::default(), &log);
        assert_eq!(engine.default_prefix(), None);
        assert_eq!(engine.effective_query("/a/b"), "/a/b");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(2.0), "2");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_check_syntax() {
        assert!(check_syntax("//item[@id='1']").is_ok());
        assert!(check_syntax("//item[").is_err());
        assert!(check_syntax("'open").is_err());
    }
}

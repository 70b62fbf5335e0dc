//! Default-namespace query rewriting
//!
//! XPath 1.0 has no default element namespace: an unprefixed name test only
//! matches elements in no namespace. For documents that declare a default
//! namespace, every unprefixed element name test is qualified with a
//! synthetic prefix bound to that namespace.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;

use super::lexer::{tokenize, Spanned, Token};
use crate::document::NamespaceMap;

/// Prefix registered for a document's default namespace.
pub const DEFAULT_PREFIX: &str = "__default__";

/// Pick a synthetic prefix that the document does not bind itself.
pub fn synthetic_prefix(namespaces: &NamespaceMap) -> String {
    if !namespaces.contains_prefix(DEFAULT_PREFIX) {
        return DEFAULT_PREFIX.to_string();
    }
    (1..)
        .map(|n| format!("__default{}__", n))
        .find(|candidate| !namespaces.contains_prefix(candidate))
        .unwrap_or_else(|| DEFAULT_PREFIX.to_string())
}

/// Qualify every unprefixed element name test in `query` with `prefix`.
///
/// Attribute and namespace axis names, `*`, function names, node type tests,
/// variables and literals are left alone. Queries that do not tokenize are
/// returned unchanged.
pub fn qualify_default_namespace<'q>(query: &'q str, prefix: &str) -> Cow<'q, str> {
    let tokens = match tokenize(query) {
        Ok(tokens) => tokens,
        Err(_) => return Cow::Borrowed(query),
    };

    let insert_at: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(i, spanned)| match spanned.token {
            Token::NameTest {
                prefix: None,
                local,
            } => local != "*" && !on_non_element_axis(&tokens, *i),
            _ => false,
        })
        .map(|(_, spanned)| spanned.start)
        .collect();

    if insert_at.is_empty() {
        return Cow::Borrowed(query);
    }

    let mut out = String::with_capacity(query.len() + insert_at.len() * (prefix.len() + 1));
    let mut last = 0;
    for position in insert_at {
        out.push_str(&query[last..position]);
        out.push_str(prefix);
        out.push(':');
        last = position;
    }
    out.push_str(&query[last..]);
    Cow::Owned(out)
}

/// Whether the name test at `index` selects attributes or namespace nodes.
fn on_non_element_axis(tokens: &[Spanned<'_>], index: usize) -> bool {
    let before = |n: usize| index.checked_sub(n).map(|j| tokens[j].token);
    match before(1) {
        Some(Token::Punct("@")) => true,
        Some(Token::Punct("::")) => matches!(before(2), Some(Token::AxisName("attribute" | "namespace"))),
        _ => false,
    }
}

/// Memoizing rewriter for one document.
///
/// Field queries are re-evaluated once per context node, so each distinct
/// query string is rewritten once and looked up afterwards.
#[derive(Debug)]
pub struct QueryRewriter {
    prefix: String,
    cache: RefCell<HashMap<String, String>>,
}

impl QueryRewriter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn rewrite(&self, query: &str) -> String {
        if let Some(hit) = self.cache.borrow().get(query) {
            return hit.clone();
        }
        let rewritten = qualify_default_namespace(query, &self.prefix).into_owned();
        self.cache
            .borrow_mut()
            .insert(query.to_string(), rewritten.clone());
        rewritten
    }

    /// Number of distinct queries rewritten so far.
    pub fn cached(&self) -> usize {
        self.cache.borrow().len()
    }
}

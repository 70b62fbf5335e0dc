//! Per-node filter hook.

use sxd_xpath::nodeset::Node;

/// A responder asked whether a context node should be skipped.
pub trait NodeFilter {
    /// `feed` identifies the document being extracted.
    fn skip(&self, node: Node<'_>, feed: &str) -> bool;
}

/// Skips nodes whose `attribute` equals one of the listed values.
#[derive(Debug, Clone)]
pub struct AttributeFilter {
    attribute: String,
    values: Vec<String>,
}

impl AttributeFilter {
    pub fn new(attribute: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            attribute: attribute.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

impl NodeFilter for AttributeFilter {
    fn skip(&self, node: Node<'_>, _feed: &str) -> bool {
        let Node::Element(element) = node else {
            return false;
        };
        element
            .attributes()
            .iter()
            .find(|a| a.name().local_part() == self.attribute)
            .is_some_and(|a| self.values.iter().any(|v| v == a.value()))
    }
}

/// Registered responders; a node is skipped if any of them says so.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn NodeFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: impl NodeFilter + 'static) {
        self.filters.push(Box::new(filter));
    }

    pub fn with(mut self, filter: impl NodeFilter + 'static) -> Self {
        self.push(filter);
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn should_skip(&self, node: Node<'_>, feed: &str) -> bool {
        self.filters.iter().any(|f| f.skip(node, feed))
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}

//! Document loading
//!
//! Turns raw bytes into an XPath-queryable tree. XML is read with quick-xml
//! and HTML with scraper (html5ever); both are rebuilt as an sxd-document
//! tree so one evaluator serves both dialects. While building, the loader
//! records the namespace bindings the query engine needs to register.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};
use sxd_document::dom::{Document, Element};
use sxd_document::{Package, QName};

use crate::error::{ExtractionError, Result};

/// Namespace bound to the reserved `xml` prefix.
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Markup dialect a document is parsed (and re-serialized) under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Html,
    Xml,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Html => f.write_str("HTML"),
            Dialect::Xml => f.write_str("XML"),
        }
    }
}

/// Raw document bytes as handed over by the loader.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub content: Vec<u8>,
    pub dialect: Dialect,
}

impl RawDocument {
    pub fn new(content: impl Into<Vec<u8>>, dialect: Dialect) -> Self {
        Self {
            content: content.into(),
            dialect,
        }
    }

    pub fn xml(content: impl Into<Vec<u8>>) -> Self {
        Self::new(content, Dialect::Xml)
    }

    pub fn html(content: impl Into<Vec<u8>>) -> Self {
        Self::new(content, Dialect::Html)
    }
}

/// Markup repair pass run on the decoded text before parsing.
pub trait Preprocessor {
    fn preprocess<'a>(&self, text: &'a str) -> Cow<'a, str>;
}

/// Namespace bindings discovered in a document.
///
/// The unprefixed default is only taken from the root element's scope.
/// Prefixed bindings come from the root scope plus any deeper declaration
/// that an element or attribute name actually uses; the first binding of a
/// prefix wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceMap {
    default: Option<String>,
    prefixed: IndexMap<String, String>,
}

impl NamespaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, uri: impl Into<String>) -> Self {
        self.default = Some(uri.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>, uri: impl Into<String>) -> Self {
        self.bind(prefix.into(), uri.into());
        self
    }

    /// The document's default (unprefixed) namespace, if any.
    pub fn default_namespace(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn get(&self, prefix: &str) -> Option<&str> {
        self.prefixed.get(prefix).map(String::as_str)
    }

    pub fn contains_prefix(&self, prefix: &str) -> bool {
        self.prefixed.contains_key(prefix)
    }

    /// Prefixed bindings in discovery order.
    pub fn prefixed(&self) -> impl Iterator<Item = (&str, &str)> {
        self.prefixed.iter().map(|(p, u)| (p.as_str(), u.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.prefixed.is_empty()
    }

    fn bind(&mut self, prefix: String, uri: String) {
        if prefix == "xml" || uri.is_empty() {
            return;
        }
        self.prefixed.entry(prefix).or_insert(uri);
    }
}

/// A parsed document tree, owned by one extraction run.
pub struct ParsedDocument {
    package: Package,
    dialect: Dialect,
    namespaces: NamespaceMap,
    diagnostics: Vec<String>,
}

impl fmt::Debug for ParsedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedDocument")
            .field("dialect", &self.dialect)
            .field("namespaces", &self.namespaces)
            .field("diagnostics", &self.diagnostics.len())
            .finish()
    }
}

impl ParsedDocument {
    /// Decode and parse raw loader output, running the optional repair pass first.
    pub fn parse(raw: &RawDocument, preprocessor: Option<&dyn Preprocessor>) -> Result<Self> {
        let text = decode(&raw.content).map_err(|message| ExtractionError::MalformedDocument {
            dialect: raw.dialect,
            message,
        })?;
        let text = match preprocessor {
            Some(p) => p.preprocess(text),
            None => Cow::Borrowed(text),
        };
        Self::parse_str(&text, raw.dialect)
    }

    pub fn parse_str(text: &str, dialect: Dialect) -> Result<Self> {
        let package = Package::new();
        let built = {
            let document = package.as_document();
            match dialect {
                Dialect::Xml => build_xml(text, &document),
                Dialect::Html => build_html(text, &document),
            }
        };
        let (namespaces, diagnostics) =
            built.map_err(|message| ExtractionError::MalformedDocument { dialect, message })?;

        tracing::debug!(
            dialect = %dialect,
            default_namespace = ?namespaces.default_namespace(),
            diagnostics = diagnostics.len(),
            "Parsed document"
        );

        Ok(Self {
            package,
            dialect,
            namespaces,
            diagnostics,
        })
    }

    pub fn document(&self) -> Document<'_> {
        self.package.as_document()
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn namespaces(&self) -> &NamespaceMap {
        &self.namespaces
    }

    /// Recoverable complaints raised while parsing.
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }
}

type BuildResult = std::result::Result<(NamespaceMap, Vec<String>), String>;

fn decode(content: &[u8]) -> std::result::Result<&str, String> {
    let text = std::str::from_utf8(content)
        .map_err(|e| format!("document is not valid UTF-8: {}", e))?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

fn split_qname(name: &str) -> (Option<&str>, &str) {
    match name.split_once(':') {
        Some((prefix, local)) if !prefix.is_empty() && !local.is_empty() => (Some(prefix), local),
        _ => (None, name),
    }
}

fn line_of(text: &str, position: usize) -> usize {
    let end = position.min(text.len());
    text.as_bytes()[..end].iter().filter(|&&b| b == b'\n').count() + 1
}

const PREDEFINED_ENTITIES: &[(&str, &str)] =
    &[("lt", "<"), ("gt", ">"), ("amp", "&"), ("apos", "'"), ("quot", "\"")];

struct OpenElement<'d> {
    element: Element<'d>,
    name: String,
    /// Declarations made on this element; "" is the default namespace.
    bindings: Vec<(String, String)>,
}

struct XmlTreeBuilder<'a, 'd> {
    document: &'a Document<'d>,
    open: Vec<OpenElement<'d>>,
    has_root: bool,
    namespaces: NamespaceMap,
    diagnostics: Vec<String>,
    /// Predefined entities plus those declared in the internal DTD subset
    entities: HashMap<String, String>,
}

impl<'a, 'd> XmlTreeBuilder<'a, 'd> {
    fn new(document: &'a Document<'d>) -> Self {
        Self {
            document,
            open: Vec::new(),
            has_root: false,
            namespaces: NamespaceMap::new(),
            diagnostics: Vec::new(),
            entities: PREDEFINED_ENTITIES
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        }
    }

    fn entity(&self, name: &str) -> Option<&str> {
        self.entities.get(name).map(String::as_str)
    }

    fn lookup(&self, pending: &[(String, String)], prefix: &str) -> Option<String> {
        if prefix == "xml" {
            return Some(XML_NAMESPACE.to_string());
        }
        let scopes = std::iter::once(pending).chain(self.open.iter().rev().map(|o| o.bindings.as_slice()));
        for bindings in scopes {
            if let Some((_, uri)) = bindings.iter().rev().find(|(p, _)| p == prefix) {
                // xmlns="" undeclares the default namespace
                return if uri.is_empty() { None } else { Some(uri.clone()) };
            }
        }
        None
    }

    /// Creates the element for a start (or empty) tag and attaches it.
    fn open_element(&mut self, start: &BytesStart<'_>) -> std::result::Result<OpenElement<'d>, String> {
        let name = std::str::from_utf8(start.name().as_ref())
            .map_err(|e| format!("invalid element name: {}", e))?
            .to_string();

        let mut bindings = Vec::new();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| format!("{} in element {}", e, name))?;
            let key = std::str::from_utf8(attr.key.as_ref())
                .map_err(|e| format!("invalid attribute name: {}", e))?
                .to_string();
            let value = attr
                .unescape_value_with(|entity| self.entity(entity))
                .map_err(|e| format!("{} in attribute {}", e, key))?
                .into_owned();
            if key == "xmlns" {
                bindings.push((String::new(), value));
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                bindings.push((prefix.to_string(), value));
            } else {
                attributes.push((key, value));
            }
        }

        let is_root = self.open.is_empty();
        if is_root {
            if self.has_root {
                return Err(format!("Extra content at the end of the document: <{}>", name));
            }
            for (prefix, uri) in &bindings {
                if prefix.is_empty() {
                    if !uri.is_empty() {
                        self.namespaces.default = Some(uri.clone());
                    }
                } else {
                    self.namespaces.bind(prefix.clone(), uri.clone());
                }
            }
        }

        let (prefix, local) = split_qname(&name);
        let element = match prefix {
            Some(p) => match self.lookup(&bindings, p) {
                Some(uri) => {
                    let element = self
                        .document
                        .create_element(QName::with_namespace_uri(Some(&uri), local));
                    element.set_preferred_prefix(Some(p));
                    self.namespaces.bind(p.to_string(), uri);
                    element
                }
                None => {
                    self.diagnostics
                        .push(format!("Namespace prefix {} on {} is not defined", p, local));
                    self.document.create_element(name.as_str())
                }
            },
            None => match self.lookup(&bindings, "") {
                Some(uri) => self
                    .document
                    .create_element(QName::with_namespace_uri(Some(&uri), local)),
                None => self.document.create_element(local),
            },
        };

        for (attr_name, value) in &attributes {
            let (attr_prefix, attr_local) = split_qname(attr_name);
            let resolved = attr_prefix.and_then(|p| self.lookup(&bindings, p).map(|uri| (p, uri)));
            match resolved {
                Some((p, uri)) => {
                    let attribute = element
                        .set_attribute_value(QName::with_namespace_uri(Some(&uri), attr_local), value);
                    attribute.set_preferred_prefix(Some(p));
                    self.namespaces.bind(p.to_string(), uri);
                }
                None => {
                    if let Some(p) = attr_prefix {
                        self.diagnostics.push(format!(
                            "Namespace prefix {} for {} on {} is not defined",
                            p, attr_local, name
                        ));
                    }
                    element.set_attribute_value(attr_name.as_str(), value);
                }
            }
        }

        match self.open.last() {
            Some(parent) => {
                parent.element.append_child(element);
            }
            None => {
                self.document.root().append_child(element);
                self.has_root = true;
            }
        }

        Ok(OpenElement {
            element,
            name,
            bindings,
        })
    }

    fn append_text(&mut self, text: &str) -> std::result::Result<(), String> {
        match self.open.last() {
            Some(parent) => {
                parent.element.append_child(self.document.create_text(text));
                Ok(())
            }
            None if text.trim().is_empty() => Ok(()),
            None if self.has_root => Err("Extra content at the end of the document".to_string()),
            None => Err("Start tag expected, '<' not found".to_string()),
        }
    }

    fn append_comment(&mut self, text: &str) {
        let comment = self.document.create_comment(text);
        match self.open.last() {
            Some(parent) => {
                parent.element.append_child(comment);
            }
            None => {
                self.document.root().append_child(comment);
            }
        }
    }

    fn append_processing_instruction(&mut self, target: &str, value: &str) {
        let value = value.trim_start();
        let pi = self
            .document
            .create_processing_instruction(target, if value.is_empty() { None } else { Some(value) });
        match self.open.last() {
            Some(parent) => {
                parent.element.append_child(pi);
            }
            None => {
                self.document.root().append_child(pi);
            }
        }
    }

    fn finish(self) -> BuildResult {
        if let Some(open) = self.open.last() {
            return Err(format!("Premature end of data in tag {}", open.name));
        }
        if !self.has_root {
            return Err("Document is empty".to_string());
        }
        Ok((self.namespaces, self.diagnostics))
    }
}

fn build_xml(text: &str, document: &Document<'_>) -> BuildResult {
    let mut reader = Reader::from_str(text);
    reader.config_mut().check_end_names = true;

    let mut builder = XmlTreeBuilder::new(document);

    loop {
        let event = reader.read_event().map_err(|e| {
            format!(
                "{} on line {}",
                e,
                line_of(text, reader.buffer_position() as usize)
            )
        })?;
        match event {
            Event::Start(e) => {
                let open = builder.open_element(&e)?;
                builder.open.push(open);
            }
            Event::Empty(e) => {
                builder.open_element(&e)?;
            }
            Event::End(_) => {
                if builder.open.pop().is_none() {
                    return Err("Unexpected end tag".to_string());
                }
            }
            Event::Text(e) => {
                let content = e
                    .unescape_with(|entity| builder.entity(entity))
                    .map_err(|err| format!("{} on line {}", err, line_of(text, reader.buffer_position() as usize)))?;
                builder.append_text(&content)?;
            }
            Event::CData(e) => {
                let content = std::str::from_utf8(&e).map_err(|err| format!("invalid CDATA: {}", err))?;
                if builder.open.is_empty() {
                    return Err("CDATA section outside of the root element".to_string());
                }
                builder.append_text(content)?;
            }
            Event::Comment(e) => {
                let content = std::str::from_utf8(&e).map_err(|err| format!("invalid comment: {}", err))?;
                builder.append_comment(content);
            }
            Event::PI(e) => {
                let target = std::str::from_utf8(e.target())
                    .map_err(|err| format!("invalid processing instruction: {}", err))?;
                let value = std::str::from_utf8(e.content())
                    .map_err(|err| format!("invalid processing instruction: {}", err))?;
                builder.append_processing_instruction(target, value);
            }
            Event::DocType(e) => {
                let dtd = std::str::from_utf8(&e).map_err(|err| format!("invalid DOCTYPE: {}", err))?;
                for (name, value) in internal_entities(dtd) {
                    builder.entities.entry(name).or_insert(value);
                }
            }
            Event::Eof => break,
            // the XML declaration carries nothing the tree needs
            _ => {}
        }
    }

    builder.finish()
}

/// `<!ENTITY name "value">` declarations of an internal DTD subset.
///
/// Parameter and external entities are skipped. Character references in the
/// replacement text are expanded.
fn internal_entities(dtd: &str) -> Vec<(String, String)> {
    let mut entities = Vec::new();
    let mut rest = dtd;
    while let Some(offset) = rest.find("<!ENTITY") {
        rest = rest[offset + "<!ENTITY".len()..].trim_start();
        if rest.starts_with('%') {
            continue;
        }
        let name_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let name = &rest[..name_end];
        rest = rest[name_end..].trim_start();

        let Some(quote) = rest.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            continue;
        };
        let Some(close) = rest[1..].find(quote) else {
            break;
        };
        let raw = &rest[1..1 + close];
        rest = &rest[1 + close + 1..];

        if name.is_empty() {
            continue;
        }
        let value = unescape(raw).map(Cow::into_owned).unwrap_or_else(|_| raw.to_string());
        entities.push((name.to_string(), value));
    }
    entities
}

fn build_html(text: &str, document: &Document<'_>) -> BuildResult {
    if text.trim().is_empty() {
        return Err("Empty string supplied as input".to_string());
    }

    let html = Html::parse_document(text);
    let root = document.root();
    for child in html.tree.root().children() {
        match child.value() {
            scraper::Node::Element(_) => {
                if let Some(element) = ElementRef::wrap(child) {
                    root.append_child(build_html_element(document, element));
                }
            }
            scraper::Node::Comment(comment) => {
                root.append_child(document.create_comment(comment));
            }
            _ => {}
        }
    }

    // html5ever recovers from every error; keep them as warnings
    let diagnostics = html.errors.iter().map(|e| e.to_string()).collect();

    // HTML parsing never binds namespaces: element names are matched unprefixed
    Ok((NamespaceMap::new(), diagnostics))
}

fn build_html_element<'d>(document: &Document<'d>, source: ElementRef<'_>) -> Element<'d> {
    let element = document.create_element(source.value().name());
    for (name, value) in source.value().attrs() {
        element.set_attribute_value(name, value);
    }

    for child in source.children() {
        match child.value() {
            scraper::Node::Element(_) => {
                if let Some(child_element) = ElementRef::wrap(child) {
                    element.append_child(build_html_element(document, child_element));
                }
            }
            scraper::Node::Text(text) => {
                element.append_child(document.create_text(text));
            }
            scraper::Node::Comment(comment) => {
                element.append_child(document.create_comment(comment));
            }
            _ => {}
        }
    }

    element
}

//! Raw markup serialization of matched nodes.
//!
//! XML output re-declares whatever namespaces a fragment needs so every
//! serialized node is well-formed on its own. HTML output follows the HTML
//! serialization rules: void elements have no end tag and the contents of
//! raw text elements are not escaped.

use quick_xml::escape::partial_escape;
use sxd_document::dom::{ChildOfElement, ChildOfRoot, Element};
use sxd_xpath::nodeset::Node;

use crate::document::{Dialect, XML_NAMESPACE};

const HTML_VOID_ELEMENTS: &[&str] = &[
    "area", "base", "basefont", "br", "col", "embed", "frame", "hr", "img", "input", "isindex",
    "keygen", "link", "meta", "param", "source", "track", "wbr",
];

const HTML_RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

/// Serialize a node back to markup in the given dialect.
pub fn serialize_node(node: Node<'_>, dialect: Dialect) -> String {
    let mut out = String::new();
    match dialect {
        Dialect::Xml => XmlWriter::default().write_node(&mut out, node),
        Dialect::Html => write_html_node(&mut out, node),
    }
    out
}

fn escape_text(out: &mut String, text: &str) {
    let escaped = partial_escape(text);
    if escaped.contains('\r') {
        out.push_str(&escaped.replace('\r', "&#13;"));
    } else {
        out.push_str(&escaped);
    }
}

/// quick-xml escapes the markup characters; quotes and whitespace become
/// character references.
fn escape_xml_attribute(out: &mut String, value: &str) {
    for c in partial_escape(value).chars() {
        match c {
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            '\t' => out.push_str("&#9;"),
            _ => out.push(c),
        }
    }
}

/// HTML attribute values only escape `&` and `"`; `<` and `>` stay literal.
fn escape_html_attribute(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

fn qualified(prefix: Option<&str>, local: &str) -> String {
    match prefix {
        Some(p) if !p.is_empty() => format!("{}:{}", p, local),
        _ => local.to_string(),
    }
}

/// Tracks in-scope namespace declarations while writing a fragment.
#[derive(Default)]
struct XmlWriter {
    /// (prefix, uri); an empty prefix is the default namespace.
    scope: Vec<(String, String)>,
}

impl XmlWriter {
    fn resolve(&self, prefix: &str) -> Option<&str> {
        self.scope
            .iter()
            .rev()
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    fn prefix_for(&self, uri: &str) -> Option<&str> {
        self.scope
            .iter()
            .rev()
            .find(|(p, u)| !p.is_empty() && u == uri)
            .map(|(p, _)| p.as_str())
    }

    fn write_node(&mut self, out: &mut String, node: Node<'_>) {
        match node {
            Node::Root(root) => {
                for child in root.children() {
                    match child {
                        ChildOfRoot::Element(e) => self.write_element(out, e),
                        ChildOfRoot::Comment(c) => write_comment(out, c.text()),
                        ChildOfRoot::ProcessingInstruction(pi) => {
                            write_processing_instruction(out, pi.target(), pi.value())
                        }
                    }
                }
            }
            Node::Element(e) => self.write_element(out, e),
            Node::Attribute(a) => {
                out.push_str(&qualified(a.preferred_prefix(), a.name().local_part()));
                out.push_str("=\"");
                escape_xml_attribute(out, a.value());
                out.push('"');
            }
            Node::Text(t) => escape_text(out, t.text()),
            Node::Comment(c) => write_comment(out, c.text()),
            Node::ProcessingInstruction(pi) => {
                write_processing_instruction(out, pi.target(), pi.value())
            }
            Node::Namespace(ns) => {
                out.push_str("xmlns:");
                out.push_str(ns.prefix());
                out.push_str("=\"");
                escape_xml_attribute(out, ns.uri());
                out.push('"');
            }
        }
    }

    fn write_element(&mut self, out: &mut String, element: Element<'_>) {
        let mark = self.scope.len();
        let mut declarations: Vec<(String, String)> = Vec::new();

        let name = element.name();
        let element_prefix = match name.namespace_uri() {
            Some(uri) => {
                let prefix = element.preferred_prefix().unwrap_or("");
                if self.resolve(prefix) != Some(uri) {
                    declarations.push((prefix.to_string(), uri.to_string()));
                    self.scope.push((prefix.to_string(), uri.to_string()));
                }
                prefix
            }
            None => {
                if self.resolve("").is_some_and(|uri| !uri.is_empty()) {
                    declarations.push((String::new(), String::new()));
                    self.scope.push((String::new(), String::new()));
                }
                ""
            }
        };

        let mut attributes = Vec::new();
        for attribute in element.attributes() {
            let attr_name = attribute.name();
            let attr_qname = match attr_name.namespace_uri() {
                Some(XML_NAMESPACE) => qualified(Some("xml"), attr_name.local_part()),
                Some(uri) => {
                    let prefix = match attribute.preferred_prefix() {
                        Some(p) if self.resolve(p) == Some(uri) => p.to_string(),
                        Some(p) if self.resolve(p).is_none() => {
                            declarations.push((p.to_string(), uri.to_string()));
                            self.scope.push((p.to_string(), uri.to_string()));
                            p.to_string()
                        }
                        _ => match self.prefix_for(uri) {
                            Some(p) => p.to_string(),
                            None => {
                                let p = format!("ns{}", self.scope.len());
                                declarations.push((p.clone(), uri.to_string()));
                                self.scope.push((p.clone(), uri.to_string()));
                                p
                            }
                        },
                    };
                    qualified(Some(&prefix), attr_name.local_part())
                }
                None => attr_name.local_part().to_string(),
            };
            attributes.push((attr_qname, attribute.value()));
        }

        let tag = qualified(Some(element_prefix), name.local_part());
        out.push('<');
        out.push_str(&tag);
        for (prefix, uri) in &declarations {
            if prefix.is_empty() {
                out.push_str(" xmlns=\"");
            } else {
                out.push_str(" xmlns:");
                out.push_str(prefix);
                out.push_str("=\"");
            }
            escape_xml_attribute(out, uri);
            out.push('"');
        }
        for (attr_name, value) in &attributes {
            out.push(' ');
            out.push_str(attr_name);
            out.push_str("=\"");
            escape_xml_attribute(out, value);
            out.push('"');
        }

        let children = element.children();
        if children.is_empty() {
            out.push_str("/>");
        } else {
            out.push('>');
            for child in children {
                match child {
                    ChildOfElement::Element(e) => self.write_element(out, e),
                    ChildOfElement::Text(t) => escape_text(out, t.text()),
                    ChildOfElement::Comment(c) => write_comment(out, c.text()),
                    ChildOfElement::ProcessingInstruction(pi) => {
                        write_processing_instruction(out, pi.target(), pi.value())
                    }
                }
            }
            out.push_str("</");
            out.push_str(&tag);
            out.push('>');
        }

        self.scope.truncate(mark);
    }
}

fn write_comment(out: &mut String, text: &str) {
    out.push_str("<!--");
    out.push_str(text);
    out.push_str("-->");
}

fn write_processing_instruction(out: &mut String, target: &str, value: Option<&str>) {
    out.push_str("<?");
    out.push_str(target);
    if let Some(value) = value {
        out.push(' ');
        out.push_str(value);
    }
    out.push_str("?>");
}

fn write_html_node(out: &mut String, node: Node<'_>) {
    match node {
        Node::Root(root) => {
            for child in root.children() {
                match child {
                    ChildOfRoot::Element(e) => write_html_element(out, e),
                    ChildOfRoot::Comment(c) => write_comment(out, c.text()),
                    ChildOfRoot::ProcessingInstruction(pi) => {
                        write_processing_instruction(out, pi.target(), pi.value())
                    }
                }
            }
        }
        Node::Element(e) => write_html_element(out, e),
        Node::Attribute(a) => {
            out.push_str(a.name().local_part());
            out.push_str("=\"");
            escape_html_attribute(out, a.value());
            out.push('"');
        }
        Node::Text(t) => escape_text(out, t.text()),
        Node::Comment(c) => write_comment(out, c.text()),
        Node::ProcessingInstruction(pi) => write_processing_instruction(out, pi.target(), pi.value()),
        Node::Namespace(ns) => out.push_str(ns.uri()),
    }
}

fn write_html_element(out: &mut String, element: Element<'_>) {
    let name = element.name().local_part();
    out.push('<');
    out.push_str(name);
    for attribute in element.attributes() {
        out.push(' ');
        out.push_str(attribute.name().local_part());
        out.push_str("=\"");
        escape_html_attribute(out, attribute.value());
        out.push('"');
    }
    out.push('>');

    let lower = name.to_ascii_lowercase();
    if HTML_VOID_ELEMENTS.contains(&lower.as_str()) {
        return;
    }

    let raw_text = HTML_RAW_TEXT_ELEMENTS.contains(&lower.as_str());
    for child in element.children() {
        match child {
            ChildOfElement::Element(e) => write_html_element(out, e),
            ChildOfElement::Text(t) if raw_text => out.push_str(t.text()),
            ChildOfElement::Text(t) => escape_text(out, t.text()),
            ChildOfElement::Comment(c) => write_comment(out, c.text()),
            ChildOfElement::ProcessingInstruction(pi) => {
                write_processing_instruction(out, pi.target(), pi.value())
            }
        }
    }

    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

//! Extraction configuration
//!
//! The values the host's configuration layer hands to a run: the context
//! expression, the ordered field list and the debug switches.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::query::check_syntax;

/// Default number of context nodes processed per invocation.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Debug key that dumps the windowed context query result.
pub const CONTEXT_SOURCE: &str = "context";

/// Debug key that dumps the context count query result.
pub const COUNT_SOURCE: &str = "count";

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// One configured extraction field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Unique key the extracted value is stored under
    pub key: String,
    /// Human-readable target name; later fields may reference it as `$target`
    pub target: String,
    /// XPath expression evaluated relative to each context node
    #[serde(default)]
    pub query: String,
    /// Return serialized markup instead of text content
    #[serde(default)]
    pub raw: bool,
    /// Dump this field's query results as debug messages
    #[serde(default)]
    pub debug: bool,
    /// Advisory: the target's values identify a record
    #[serde(default)]
    pub unique: bool,
}

impl FieldSpec {
    pub fn new(key: impl Into<String>, target: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            target: target.into(),
            query: query.into(),
            raw: false,
            debug: false,
            unique: false,
        }
    }

    pub fn with_raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// The substitution token other fields use to reference this one.
    pub fn variable(&self) -> String {
        format!("${}", self.target)
    }
}

/// Per-run extraction configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionContext {
    /// Expression selecting one node per output record
    pub context: String,

    /// Fields in declaration order
    #[serde(default)]
    pub fields: Vec<FieldSpec>,

    /// Keys (field keys, `context` or `count`) whose results are dumped
    #[serde(default)]
    pub show_debug: BTreeSet<String>,

    /// Report query diagnostics as messages
    #[serde(default)]
    pub show_errors: bool,

    /// Maximum context nodes processed per invocation
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl ExtractionContext {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            fields: Vec::new(),
            show_debug: BTreeSet::new(),
            show_errors: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_fields(mut self, fields: impl IntoIterator<Item = FieldSpec>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn with_debug(mut self, key: impl Into<String>) -> Self {
        self.show_debug.insert(key.into());
        self
    }

    pub fn with_show_errors(mut self, show_errors: bool) -> Self {
        self.show_errors = show_errors;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// All keys to dump: the global set plus fields flagged individually.
    pub fn debug_keys(&self) -> HashSet<String> {
        self.show_debug
            .iter()
            .cloned()
            .chain(self.fields.iter().filter(|f| f.debug).map(|f| f.key.clone()))
            .collect()
    }

    pub fn raw_keys(&self) -> HashSet<&str> {
        self.fields
            .iter()
            .filter(|f| f.raw)
            .map(|f| f.key.as_str())
            .collect()
    }

    pub fn field(&self, key: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// Targets of fields flagged unique.
    pub fn unique_targets(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.unique)
            .map(|f| f.target.as_str())
            .collect()
    }

    /// Variables the field `key` may reference: those of earlier fields.
    pub fn available_variables(&self, key: &str) -> Vec<String> {
        self.fields
            .iter()
            .take_while(|f| f.key != key)
            .map(FieldSpec::variable)
            .collect()
    }

    /// Configuration-time checks; nothing here runs during extraction.
    ///
    /// Undefined namespace prefixes are accepted since they can only be
    /// resolved against a real document. A field query that does not compile
    /// is accepted when it mentions a field variable, as substitution may
    /// complete it at run time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }

        let context = self.context.trim();
        if context.is_empty() {
            return Err(ConfigError::EmptyContext);
        }
        check_syntax(context).map_err(|message| ConfigError::InvalidContext {
            query: context.to_string(),
            message,
        })?;

        let variables: Vec<String> = self.fields.iter().map(FieldSpec::variable).collect();
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.key.as_str()) {
                return Err(ConfigError::DuplicateKey(field.key.clone()));
            }

            let query = field.query.trim();
            if query.is_empty() {
                continue;
            }
            if let Err(message) = check_syntax(query) {
                let uses_variable = variables.iter().any(|v| query.contains(v.as_str()));
                if !uses_variable {
                    return Err(ConfigError::InvalidField {
                        key: field.key.clone(),
                        query: query.to_string(),
                        message,
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ExtractionContext {
        ExtractionContext::new("//item")
            .with_field(FieldSpec::new("xpathparser:0", "title", "title").with_unique(true))
            .with_field(FieldSpec::new("xpathparser:1", "link", "link/@href").with_debug(true))
            .with_field(FieldSpec::new("xpathparser:2", "body", "body").with_raw(true))
            .with_debug(CONTEXT_SOURCE)
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "context": "//item",
            "fields": [{"key": "a", "target": "title", "query": "title"}]
        }"#;
        let config: ExtractionContext = serde_json::from_str(json).unwrap();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert!(!config.show_errors);
        assert!(!config.fields[0].raw);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_key_sets() {
        let config = sample();
        let debug = config.debug_keys();
        assert!(debug.contains(CONTEXT_SOURCE));
        assert!(debug.contains("xpathparser:1"));
        assert!(!debug.contains("xpathparser:0"));

        assert_eq!(config.raw_keys(), HashSet::from(["xpathparser:2"]));
        assert_eq!(config.unique_targets(), vec!["title"]);
        assert_eq!(config.field("xpathparser:1").unwrap().target, "link");
    }

    #[test]
    fn test_available_variables_only_from_earlier_fields() {
        let config = sample();
        assert!(config.available_variables("xpathparser:0").is_empty());
        assert_eq!(config.available_variables("xpathparser:2"), vec!["$title", "$link"]);
    }

    #[test]
    fn test_validate_rejects_bad_configuration() {
        assert_eq!(
            ExtractionContext::new("  ").validate(),
            Err(ConfigError::EmptyContext)
        );
        assert!(matches!(
            ExtractionContext::new("//item[").validate(),
            Err(ConfigError::InvalidContext { .. })
        ));
        assert_eq!(
            sample().with_batch_size(0).validate(),
            Err(ConfigError::ZeroBatchSize)
        );
        assert_eq!(
            sample()
                .with_field(FieldSpec::new("xpathparser:0", "again", "x"))
                .validate(),
            Err(ConfigError::DuplicateKey("xpathparser:0".into()))
        );
        assert!(matches!(
            sample()
                .with_field(FieldSpec::new("xpathparser:3", "bad", "title[["))
                .validate(),
            Err(ConfigError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_validate_accepts_variables_and_unknown_prefixes() {
        let config = sample()
            .with_field(FieldSpec::new("xpathparser:3", "byTitle", "//$title"))
            .with_field(FieldSpec::new("xpathparser:4", "creator", "dc:creator"));
        assert_eq!(config.validate(), Ok(()));
    }
}

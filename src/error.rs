//! Typed errors for document loading, query evaluation and configuration.
//!
//! Uses `thiserror` so callers can match on the failure class: a malformed
//! document and a failed context query both abort a batch, while field-level
//! [`QueryDiagnostic`]s are absorbed by the pipeline.

use serde::Serialize;
use thiserror::Error;

use crate::document::Dialect;

/// Numeric diagnostic codes, compatible with libxml2's XPath error numbers so
/// hosts that already key messages on them keep working.
pub mod codes {
    pub const UNFINISHED_LITERAL: u32 = 1202;
    pub const UNDEFINED_VARIABLE: u32 = 1205;
    pub const INVALID_EXPRESSION: u32 = 1207;
    pub const UNKNOWN_FUNCTION: u32 = 1209;
    pub const INVALID_TYPE: u32 = 1211;
    pub const UNDEFINED_PREFIX: u32 = 1219;
    pub const INVALID_CHAR: u32 = 1221;
}

/// Severity of a diagnostic, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

/// Diagnostic produced by one query evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{message} (code {code}) in query `{query}`")]
pub struct QueryDiagnostic {
    pub severity: Severity,
    pub code: u32,
    pub message: String,
    /// The query as configured, before any namespace rewriting.
    pub query: String,
}

impl QueryDiagnostic {
    pub fn new(
        severity: Severity,
        code: u32,
        message: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
            query: query.into(),
        }
    }

    /// Whether the evaluation that produced this diagnostic has no usable result.
    pub fn is_failure(&self) -> bool {
        self.severity >= Severity::Error
    }
}

/// Errors that abort an extraction run.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Raw bytes did not parse under the declared dialect
    #[error("malformed {dialect} document: {message}")]
    MalformedDocument { dialect: Dialect, message: String },

    /// The context query (count or window) failed to evaluate
    #[error("context query failed: {0}")]
    ContextQuery(QueryDiagnostic),

    /// Configuration rejected before the run started
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Progress store could not read or persist the pagination state
    #[error("progress store error: {0}")]
    Progress(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ExtractionError {
    /// True for failures caused by the document itself rather than by
    /// configuration or storage.
    pub fn is_document_failure(&self) -> bool {
        matches!(
            self,
            ExtractionError::MalformedDocument { .. } | ExtractionError::ContextQuery(_)
        )
    }
}

/// Configuration-time validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("context expression is empty")]
    EmptyContext,

    #[error("invalid context expression `{query}`: {message}")]
    InvalidContext { query: String, message: String },

    #[error("invalid query for field `{key}` (`{query}`): {message}")]
    InvalidField {
        key: String,
        query: String,
        message: String,
    },

    #[error("duplicate field key: {0}")]
    DuplicateKey(String),

    #[error("batch size must be positive")]
    ZeroBatchSize,
}

/// Result type alias for extraction operations.
pub type Result<T> = std::result::Result<T, ExtractionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Fatal);

        let warning = QueryDiagnostic::new(Severity::Warning, 1, "w", "q");
        let fatal = QueryDiagnostic::new(Severity::Fatal, 1, "f", "q");
        assert!(!warning.is_failure());
        assert!(fatal.is_failure());
    }

    #[test]
    fn test_document_failure_classification() {
        let diag = QueryDiagnostic::new(Severity::Error, codes::INVALID_EXPRESSION, "bad", "//[");
        assert!(ExtractionError::ContextQuery(diag).is_document_failure());
        assert!(!ExtractionError::Configuration(ConfigError::EmptyContext).is_document_failure());

        let malformed = ExtractionError::MalformedDocument {
            dialect: Dialect::Xml,
            message: "document is empty".into(),
        };
        assert_eq!(malformed.to_string(), "malformed XML document: document is empty");
    }
}
